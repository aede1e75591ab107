use crate::traits::DynamicalSystem;

// Tsitouras 5(4) tableau.
const C2: f64 = 0.161;
const C3: f64 = 0.327;
const C4: f64 = 0.9;
const C5: f64 = 0.9800255409045097;

const A21: f64 = 0.161;

const A31: f64 = -0.008480655492356989;
const A32: f64 = 0.335480655492357;

const A41: f64 = 2.897153057105493;
const A42: f64 = -6.359448489975075;
const A43: f64 = 4.3622954328695815;

const A51: f64 = 5.325864828439257;
const A52: f64 = -11.748883564062828;
const A53: f64 = 7.4955393428898365;
const A54: f64 = -0.09249506636175525;

const A61: f64 = 5.86145544294642;
const A62: f64 = -12.92096931784711;
const A63: f64 = 8.159367898576159;
const A64: f64 = -0.071584973281401;
const A65: f64 = -0.028269050394068383;

// 5th order weights; also the last row of A (FSAL).
const B1: f64 = 0.09646076681806523;
const B2: f64 = 0.01;
const B3: f64 = 0.4798896504144996;
const B4: f64 = 1.379008574103742;
const B5: f64 = -3.290069515436081;
const B6: f64 = 2.324710524099774;

// b - b_hat, the embedded error weights.
const E1: f64 = -0.00178001105222577714;
const E2: f64 = -0.0008164344596567469;
const E3: f64 = 0.007880878010261995;
const E4: f64 = -0.1447110071732629;
const E5: f64 = 0.5823571654525552;
const E6: f64 = -0.45808210592918697;
const E7: f64 = 0.015151515151515152;

/// Order of the embedded error estimate.
pub const ERROR_ORDER: usize = 4;

/// Derivative evaluations per step attempt (the first stage is reused).
pub const STAGE_EVALS: u64 = 6;

/// Tsitouras 5(4) embedded Runge-Kutta stepper.
///
/// Stage buffers are pre-allocated for a fixed dimension. The first stage is
/// shared with the last stage of the previous accepted step (FSAL); callers
/// must `invalidate` after changing the state discontinuously.
pub struct Tsit5 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    k5: Vec<f64>,
    k6: Vec<f64>,
    k7: Vec<f64>,
    tmp: Vec<f64>,
    proposal: Vec<f64>,
    error: Vec<f64>,
    first_stage_valid: bool,
}

impl Tsit5 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            k5: vec![0.0; dim],
            k6: vec![0.0; dim],
            k7: vec![0.0; dim],
            tmp: vec![0.0; dim],
            proposal: vec![0.0; dim],
            error: vec![0.0; dim],
            first_stage_valid: false,
        }
    }

    pub fn dimension(&self) -> usize {
        self.k1.len()
    }

    /// Forces the next attempt to re-evaluate the first stage.
    pub fn invalidate(&mut self) {
        self.first_stage_valid = false;
    }

    /// Computes a trial step of size `dt` from `(t, state)`.
    ///
    /// Returns the number of derivative evaluations performed. The proposed
    /// state, its local error vector and the endpoint derivative are left in
    /// the stepper until the next attempt.
    pub fn attempt<S: DynamicalSystem + ?Sized>(
        &mut self,
        system: &S,
        params: &[f64],
        t: f64,
        state: &[f64],
        dt: f64,
    ) -> u64 {
        let n = state.len();
        let mut evals = STAGE_EVALS;

        if !self.first_stage_valid {
            system.derivative(t, state, params, &mut self.k1);
            self.first_stage_valid = true;
            evals += 1;
        }

        for i in 0..n {
            self.tmp[i] = state[i] + dt * A21 * self.k1[i];
        }
        system.derivative(t + C2 * dt, &self.tmp, params, &mut self.k2);

        for i in 0..n {
            self.tmp[i] = state[i] + dt * (A31 * self.k1[i] + A32 * self.k2[i]);
        }
        system.derivative(t + C3 * dt, &self.tmp, params, &mut self.k3);

        for i in 0..n {
            self.tmp[i] =
                state[i] + dt * (A41 * self.k1[i] + A42 * self.k2[i] + A43 * self.k3[i]);
        }
        system.derivative(t + C4 * dt, &self.tmp, params, &mut self.k4);

        for i in 0..n {
            self.tmp[i] = state[i]
                + dt * (A51 * self.k1[i] + A52 * self.k2[i] + A53 * self.k3[i] + A54 * self.k4[i]);
        }
        system.derivative(t + C5 * dt, &self.tmp, params, &mut self.k5);

        for i in 0..n {
            self.tmp[i] = state[i]
                + dt * (A61 * self.k1[i]
                    + A62 * self.k2[i]
                    + A63 * self.k3[i]
                    + A64 * self.k4[i]
                    + A65 * self.k5[i]);
        }
        system.derivative(t + dt, &self.tmp, params, &mut self.k6);

        for i in 0..n {
            self.proposal[i] = state[i]
                + dt * (B1 * self.k1[i]
                    + B2 * self.k2[i]
                    + B3 * self.k3[i]
                    + B4 * self.k4[i]
                    + B5 * self.k5[i]
                    + B6 * self.k6[i]);
        }
        system.derivative(t + dt, &self.proposal, params, &mut self.k7);

        for i in 0..n {
            self.error[i] = dt
                * (E1 * self.k1[i]
                    + E2 * self.k2[i]
                    + E3 * self.k3[i]
                    + E4 * self.k4[i]
                    + E5 * self.k5[i]
                    + E6 * self.k6[i]
                    + E7 * self.k7[i]);
        }

        evals
    }

    /// Weighted RMS norm of the local error over the first `components`
    /// entries, scaled by `abs_tol + rel_tol * max(|y_old|, |y_new|)`.
    pub fn error_norm(&self, state: &[f64], abs_tol: f64, rel_tol: f64, components: usize) -> f64 {
        let m = components.min(state.len());
        if m == 0 {
            return 0.0;
        }
        let mut sum = 0.0;
        for i in 0..m {
            let scale = abs_tol + rel_tol * state[i].abs().max(self.proposal[i].abs());
            let scaled = self.error[i] / scale;
            sum += scaled * scaled;
        }
        (sum / m as f64).sqrt()
    }

    /// Marks the last attempt as accepted: the endpoint derivative becomes
    /// the first stage of the next step.
    pub fn accept(&mut self) {
        std::mem::swap(&mut self.k1, &mut self.k7);
        self.first_stage_valid = true;
    }

    pub fn proposal(&self) -> &[f64] {
        &self.proposal
    }

    /// Derivative at the start of the last attempt.
    pub fn start_derivative(&self) -> &[f64] {
        &self.k1
    }

    /// Derivative at the end of the last attempt.
    pub fn end_derivative(&self) -> &[f64] {
        &self.k7
    }
}

/// Step-size controller: `h_new = h * safety * error^(-1/(p+1))`,
/// with separate bounds for growth after acceptance and shrinkage after
/// rejection.
#[derive(Debug, Clone, Copy)]
pub struct StepController {
    pub safety: f64,
    pub max_growth: f64,
    pub min_shrink: f64,
    exponent: f64,
}

impl StepController {
    pub fn new(safety: f64, max_growth: f64, min_shrink: f64) -> Self {
        Self {
            safety,
            max_growth,
            min_shrink,
            exponent: 1.0 / (ERROR_ORDER as f64 + 1.0),
        }
    }

    /// Factor applied to an accepted step.
    pub fn growth(&self, error: f64) -> f64 {
        if error == 0.0 {
            return self.max_growth;
        }
        (self.safety * error.powf(-self.exponent)).clamp(self.min_shrink, self.max_growth)
    }

    /// Factor applied to a rejected step; always below one.
    pub fn shrink(&self, error: f64) -> f64 {
        if !error.is_finite() {
            return self.min_shrink;
        }
        (self.safety * error.powf(-self.exponent)).clamp(self.min_shrink, self.safety)
    }
}

/// Cubic Hermite continuous extension over one accepted step.
#[derive(Debug, Clone)]
pub struct DenseStep {
    pub t0: f64,
    pub t1: f64,
    y0: Vec<f64>,
    y1: Vec<f64>,
    f0: Vec<f64>,
    f1: Vec<f64>,
}

impl DenseStep {
    pub fn new(t0: f64, y0: &[f64], f0: &[f64], t1: f64, y1: &[f64], f1: &[f64]) -> Self {
        Self {
            t0,
            t1,
            y0: y0.to_vec(),
            y1: y1.to_vec(),
            f0: f0.to_vec(),
            f1: f1.to_vec(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.y0.len()
    }

    /// Interpolated state at `t`, exact at both step endpoints.
    pub fn evaluate(&self, t: f64, out: &mut [f64]) {
        let h = self.t1 - self.t0;
        if h == 0.0 {
            out.copy_from_slice(&self.y0);
            return;
        }
        let theta = (t - self.t0) / h;
        let one_minus = 1.0 - theta;
        let h00 = (1.0 + 2.0 * theta) * one_minus * one_minus;
        let h10 = theta * one_minus * one_minus;
        let h01 = theta * theta * (3.0 - 2.0 * theta);
        let h11 = theta * theta * (theta - 1.0);
        for i in 0..out.len() {
            out[i] = h00 * self.y0[i]
                + h * h10 * self.f0[i]
                + h01 * self.y1[i]
                + h * h11 * self.f1[i];
        }
    }

    pub fn state_at(&self, t: f64) -> Vec<f64> {
        let mut out = vec![0.0; self.y0.len()];
        self.evaluate(t, &mut out);
        out
    }
}
