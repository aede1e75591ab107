use crate::events::{Event, EventAction, EventDirection};
use crate::traits::DynamicalSystem;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

pub type DerivativeFn = fn(f64, &[f64], &[f64], &mut [f64]);
pub type JacobianFn = fn(f64, &[f64], &[f64], &mut DMatrix<f64>);

/// A system assembled from plain function pointers. The Jacobian capability
/// is chosen at construction; without it the finite-difference default is
/// used.
#[derive(Debug, Clone, Copy)]
pub struct FnSystem {
    dimension: usize,
    derivative: DerivativeFn,
    jacobian: Option<JacobianFn>,
}

impl FnSystem {
    pub fn new(dimension: usize, derivative: DerivativeFn) -> Self {
        Self {
            dimension,
            derivative,
            jacobian: None,
        }
    }

    pub fn with_jacobian(mut self, jacobian: JacobianFn) -> Self {
        self.jacobian = Some(jacobian);
        self
    }
}

impl DynamicalSystem for FnSystem {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn derivative(&self, t: f64, x: &[f64], params: &[f64], out: &mut [f64]) {
        (self.derivative)(t, x, params, out)
    }

    fn jacobian(&self, t: f64, x: &[f64], params: &[f64], out: &mut DMatrix<f64>) {
        match self.jacobian {
            Some(jacobian) => jacobian(t, x, params, out),
            None => crate::traits::finite_difference_jacobian(self, t, x, params, out),
        }
    }

    fn has_jacobian(&self) -> bool {
        self.jacobian.is_some()
    }
}

/// Lorenz system, parameters `[sigma, rho, beta]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Lorenz;

impl Lorenz {
    pub const SIGMA: usize = 0;
    pub const RHO: usize = 1;
    pub const BETA: usize = 2;

    /// The classic chaotic regime.
    pub fn standard_params() -> Vec<f64> {
        vec![10.0, 28.0, 8.0 / 3.0]
    }

    /// The equilibrium `C+ = (√(β(ρ−1)), √(β(ρ−1)), ρ−1)`, defined for ρ ≥ 1.
    pub fn positive_equilibrium(params: &[f64]) -> Option<[f64; 3]> {
        let rho = params[Self::RHO];
        let beta = params[Self::BETA];
        let radicand = beta * (rho - 1.0);
        if radicand < 0.0 {
            return None;
        }
        let xy = radicand.sqrt();
        Some([xy, xy, rho - 1.0])
    }
}

impl DynamicalSystem for Lorenz {
    fn dimension(&self) -> usize {
        3
    }

    fn derivative(&self, _t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
        let (sigma, rho, beta) = (p[0], p[1], p[2]);
        out[0] = sigma * (x[1] - x[0]);
        out[1] = x[0] * (rho - x[2]) - x[1];
        out[2] = x[0] * x[1] - beta * x[2];
    }

    fn jacobian(&self, _t: f64, x: &[f64], p: &[f64], out: &mut DMatrix<f64>) {
        let (sigma, rho, beta) = (p[0], p[1], p[2]);
        out[(0, 0)] = -sigma;
        out[(0, 1)] = sigma;
        out[(0, 2)] = 0.0;
        out[(1, 0)] = rho - x[2];
        out[(1, 1)] = -1.0;
        out[(1, 2)] = -x[0];
        out[(2, 0)] = x[1];
        out[(2, 1)] = x[0];
        out[(2, 2)] = -beta;
    }

    fn has_jacobian(&self) -> bool {
        true
    }
}

/// Supercritical Hopf normal form in Cartesian coordinates,
/// parameters `[mu, omega]`:
///
/// `x' = μx − ωy − x(x²+y²)`, `y' = ωx + μy − y(x²+y²)`.
///
/// For μ > 0 the stable limit cycle has radius √μ and period 2π/ω.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HopfNormalForm;

impl DynamicalSystem for HopfNormalForm {
    fn dimension(&self) -> usize {
        2
    }

    fn derivative(&self, _t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
        let (mu, omega) = (p[0], p[1]);
        let r2 = x[0] * x[0] + x[1] * x[1];
        out[0] = mu * x[0] - omega * x[1] - x[0] * r2;
        out[1] = omega * x[0] + mu * x[1] - x[1] * r2;
    }

    fn jacobian(&self, _t: f64, x: &[f64], p: &[f64], out: &mut DMatrix<f64>) {
        let (mu, omega) = (p[0], p[1]);
        let (a, b) = (x[0], x[1]);
        let r2 = a * a + b * b;
        out[(0, 0)] = mu - r2 - 2.0 * a * a;
        out[(0, 1)] = -omega - 2.0 * a * b;
        out[(1, 0)] = omega - 2.0 * a * b;
        out[(1, 1)] = mu - r2 - 2.0 * b * b;
    }

    fn has_jacobian(&self) -> bool {
        true
    }
}

/// Leaky integrate-and-fire neuron driven by a constant current
/// (parameter 0): `τ dV/dt = −(V − V_rest) + R·I`.
///
/// Spiking is an event: when V rises through `v_threshold` it is reset to
/// `v_rest` (see `spike_event`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegrateAndFire {
    pub tau: f64,
    pub resistance: f64,
    pub v_rest: f64,
    pub v_threshold: f64,
}

impl Default for IntegrateAndFire {
    fn default() -> Self {
        Self {
            tau: 10.0,
            resistance: 10.0,
            v_rest: -65.0,
            v_threshold: -50.0,
        }
    }
}

impl IntegrateAndFire {
    /// Threshold crossing that resets the membrane potential.
    pub fn spike_event(&self) -> Event {
        let threshold = self.v_threshold;
        let reset = self.v_rest;
        Event::new(
            move |_, v: &[f64]| v[0] - threshold,
            move |_, v: &mut [f64]| {
                v[0] = reset;
                EventAction::Continue
            },
        )
        .with_direction(EventDirection::Rising)
    }

    /// Inter-spike interval `τ·ln(RI / (RI − (V_th − V_rest)))`, or `None`
    /// when the current is too weak to reach threshold.
    pub fn analytic_period(&self, current: f64) -> Option<f64> {
        let drive = self.resistance * current;
        let gap = self.v_threshold - self.v_rest;
        if drive <= gap {
            return None;
        }
        Some(self.tau * (drive / (drive - gap)).ln())
    }
}

impl DynamicalSystem for IntegrateAndFire {
    fn dimension(&self) -> usize {
        1
    }

    fn derivative(&self, _t: f64, v: &[f64], p: &[f64], out: &mut [f64]) {
        out[0] = (-(v[0] - self.v_rest) + self.resistance * p[0]) / self.tau;
    }

    fn jacobian(&self, _t: f64, _v: &[f64], _p: &[f64], out: &mut DMatrix<f64>) {
        out[(0, 0)] = -1.0 / self.tau;
    }

    fn has_jacobian(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::finite_difference_jacobian;

    fn assert_jacobian_consistent<S: DynamicalSystem>(system: &S, x: &[f64], params: &[f64]) {
        let n = system.dimension();
        let mut analytic = DMatrix::zeros(n, n);
        let mut numeric = DMatrix::zeros(n, n);
        system.jacobian(0.0, x, params, &mut analytic);
        finite_difference_jacobian(system, 0.0, x, params, &mut numeric);
        let diff = (&analytic - &numeric).abs().max();
        assert!(diff < 1e-6, "jacobian mismatch {diff}");
    }

    #[test]
    fn lorenz_jacobian_matches_finite_differences() {
        assert_jacobian_consistent(&Lorenz, &[1.0, -2.0, 20.0], &Lorenz::standard_params());
    }

    #[test]
    fn hopf_jacobian_matches_finite_differences() {
        assert_jacobian_consistent(&HopfNormalForm, &[0.3, -0.7], &[0.1, 1.0]);
    }

    #[test]
    fn lorenz_positive_equilibrium_is_stationary() {
        let params = Lorenz::standard_params();
        let eq = Lorenz::positive_equilibrium(&params).unwrap();
        let rate = Lorenz.rate(0.0, &eq, &params);
        assert!(rate.iter().all(|v| v.abs() < 1e-12));
        assert!(Lorenz::positive_equilibrium(&[10.0, 0.5, 8.0 / 3.0]).is_none());
    }

    #[test]
    fn fn_system_selects_jacobian_capability() {
        fn linear(_t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
            out[0] = p[0] * x[0];
        }
        fn linear_jacobian(_t: f64, _x: &[f64], p: &[f64], out: &mut DMatrix<f64>) {
            out[(0, 0)] = p[0];
        }

        let plain = FnSystem::new(1, linear);
        let analytic = plain.with_jacobian(linear_jacobian);
        assert!(!plain.has_jacobian());
        assert!(analytic.has_jacobian());

        let mut jac = DMatrix::zeros(1, 1);
        plain.jacobian(0.0, &[2.0], &[3.0], &mut jac);
        assert!((jac[(0, 0)] - 3.0).abs() < 1e-6);
        analytic.jacobian(0.0, &[2.0], &[-4.0], &mut jac);
        assert_eq!(jac[(0, 0)], -4.0);
    }

    #[test]
    fn integrate_and_fire_period_requires_suprathreshold_current() {
        let neuron = IntegrateAndFire::default();
        assert!(neuron.analytic_period(1.0).is_none());
        let period = neuron.analytic_period(2.0).unwrap();
        assert!((period - 10.0 * 4f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn spike_event_resets_to_rest() {
        let neuron = IntegrateAndFire::default();
        let mut event = neuron.spike_event();
        assert_eq!(event.direction, EventDirection::Rising);
        assert_eq!(event.condition(0.0, &[-50.0]), 0.0);
        let mut v = vec![-49.9];
        assert_eq!(event.apply(0.0, &mut v), EventAction::Continue);
        assert_eq!(v[0], -65.0);
    }
}
