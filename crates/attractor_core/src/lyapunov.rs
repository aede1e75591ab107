use crate::integrator::{Integrator, SolverConfig};
use crate::traits::DynamicalSystem;
use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use nalgebra::linalg::QR;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// Settings for a Lyapunov spectrum run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LyapunovConfig {
    /// Transient integrated before tangent vectors are attached.
    #[serde(alias = "Ttr")]
    pub transient: f64,
    /// Number of QR renormalizations.
    #[serde(alias = "N")]
    pub renormalizations: usize,
    /// Time between renormalizations.
    #[serde(alias = "dt")]
    pub interval: f64,
    /// Number of exponents; all of them when unset.
    #[serde(alias = "k")]
    pub exponents: Option<usize>,
}

impl Default for LyapunovConfig {
    fn default() -> Self {
        Self {
            transient: 100.0,
            renormalizations: 300,
            interval: 0.1,
            exponents: None,
        }
    }
}

impl LyapunovConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.transient >= 0.0) || !self.transient.is_finite() {
            bail!("Transient time must be finite and non-negative.");
        }
        if self.renormalizations == 0 {
            bail!("At least one renormalization is required.");
        }
        if !(self.interval > 0.0) || !self.interval.is_finite() {
            bail!("Renormalization interval must be positive.");
        }
        if self.exponents == Some(0) {
            bail!("Number of exponents must be at least 1.");
        }
        Ok(())
    }
}

/// Base system augmented with `k` tangent columns, stored row-major after
/// the base state: `d/dt [x; Q] = [f(x); J(x)·Q]`.
pub struct TangentSystem<'a, S: DynamicalSystem + ?Sized> {
    system: &'a S,
    dimension: usize,
    columns: usize,
    jacobian: RefCell<DMatrix<f64>>,
}

impl<'a, S: DynamicalSystem + ?Sized> TangentSystem<'a, S> {
    pub fn new(system: &'a S, columns: usize) -> Self {
        let dimension = system.dimension();
        Self {
            system,
            dimension,
            columns,
            jacobian: RefCell::new(DMatrix::zeros(dimension, dimension)),
        }
    }
}

impl<'a, S: DynamicalSystem + ?Sized> DynamicalSystem for TangentSystem<'a, S> {
    fn dimension(&self) -> usize {
        self.dimension * (1 + self.columns)
    }

    fn derivative(&self, t: f64, x: &[f64], params: &[f64], out: &mut [f64]) {
        let n = self.dimension;
        let k = self.columns;
        let (base, tangent) = x.split_at(n);
        let (base_out, tangent_out) = out.split_at_mut(n);
        self.system.derivative(t, base, params, base_out);

        let mut jac = self.jacobian.borrow_mut();
        jac.fill(0.0);
        self.system.jacobian(t, base, params, &mut jac);
        for i in 0..n {
            for j in 0..k {
                let mut sum = 0.0;
                for l in 0..n {
                    sum += jac[(i, l)] * tangent[l * k + j];
                }
                tangent_out[i * k + j] = sum;
            }
        }
    }
}

/// Co-evolves a base trajectory with `k` tangent vectors and
/// re-orthonormalizes them on request.
pub struct VariationalPropagator<'a, S: DynamicalSystem + ?Sized> {
    system: &'a S,
    params: Vec<f64>,
    base: Integrator,
    coupled: Integrator,
    time: f64,
    augmented: Vec<f64>,
    dimension: usize,
    columns: usize,
}

impl<'a, S: DynamicalSystem + ?Sized> VariationalPropagator<'a, S> {
    /// Starts at `initial_state` with the tangent set to the first `columns`
    /// columns of the identity.
    pub fn new(
        system: &'a S,
        params: &[f64],
        initial_state: &[f64],
        columns: usize,
        solver: &SolverConfig,
    ) -> Result<Self> {
        let dimension = system.dimension();
        if dimension == 0 {
            bail!("System must have positive dimension.");
        }
        if initial_state.len() != dimension {
            bail!(
                "Initial state has length {}, expected {}.",
                initial_state.len(),
                dimension
            );
        }
        if columns == 0 || columns > dimension {
            bail!("Number of tangent vectors must lie in 1..={dimension}, got {columns}.");
        }

        let base = Integrator::new(*solver)?;
        let coupled = Integrator::new(*solver)?.with_error_components(dimension);
        let mut augmented = vec![0.0; dimension * (1 + columns)];
        augmented[..dimension].copy_from_slice(initial_state);

        let mut propagator = Self {
            system,
            params: params.to_vec(),
            base,
            coupled,
            time: 0.0,
            augmented,
            dimension,
            columns,
        };
        propagator.reset_tangent();
        Ok(propagator)
    }

    fn reset_tangent(&mut self) {
        let n = self.dimension;
        let k = self.columns;
        let tangent = &mut self.augmented[n..];
        tangent.fill(0.0);
        for j in 0..k {
            tangent[j * k + j] = 1.0;
        }
    }

    /// Integrates the base state alone for `duration` and resets the tangent
    /// vectors to the identity columns.
    pub fn discard_transient(&mut self, duration: f64) -> Result<()> {
        let n = self.dimension;
        let target = self.time + duration;
        self.base
            .advance(
                self.system,
                &self.params,
                &mut self.time,
                &mut self.augmented[..n],
                target,
            )
            .context("Transient integration failed")?;
        self.reset_tangent();
        Ok(())
    }

    /// Jointly advances the base state and tangent vectors by `dt`, with
    /// error control on the base components only.
    pub fn advance(&mut self, dt: f64) -> Result<()> {
        let coupled_system = TangentSystem::new(self.system, self.columns);
        let target = self.time + dt;
        self.coupled
            .advance(
                &coupled_system,
                &self.params,
                &mut self.time,
                &mut self.augmented,
                target,
            )
            .context("Variational integration failed")?;
        Ok(())
    }

    /// Thin-QR of the tangent matrix. The tangent is replaced by `Q` and
    /// `ln|R_ii|` is returned per column.
    pub fn renormalize(&mut self) -> Result<Vec<f64>> {
        let n = self.dimension;
        let k = self.columns;
        let (q, r) = thin_qr_positive(self.tangent())?;
        let mut growth = Vec::with_capacity(k);
        for i in 0..k {
            growth.push(r[(i, i)].ln());
        }
        let tangent = &mut self.augmented[n..];
        for i in 0..n {
            for j in 0..k {
                tangent[i * k + j] = q[(i, j)];
            }
        }
        Ok(growth)
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn state(&self) -> &[f64] {
        &self.augmented[..self.dimension]
    }

    /// The current `n×k` tangent matrix.
    pub fn tangent(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(self.dimension, self.columns, &self.augmented[self.dimension..])
    }

    /// Max-norm of `QᵀQ − I` for the current tangent.
    pub fn orthonormality_defect(&self) -> f64 {
        let q = self.tangent();
        let gram = q.transpose() * &q;
        let identity = DMatrix::<f64>::identity(self.columns, self.columns);
        (gram - identity).abs().max()
    }
}

/// Thin QR with a positive `R` diagonal. Fails on a near-singular diagonal.
fn thin_qr_positive(matrix: DMatrix<f64>) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
    let columns = matrix.ncols();
    let (mut q, mut r) = QR::new(matrix).unpack();
    for i in 0..columns {
        let diag = r[(i, i)];
        if diag.abs() <= f64::EPSILON || !diag.is_finite() {
            return Err(anyhow!(
                "Encountered near-singular R matrix during orthonormalization."
            ));
        }
        if diag < 0.0 {
            q.column_mut(i).neg_mut();
            r.row_mut(i).neg_mut();
        }
    }
    Ok((q, r))
}

/// Lyapunov exponents, largest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyapunovSpectrum {
    exponents: Vec<f64>,
}

impl LyapunovSpectrum {
    /// Sorts the given exponents in descending order.
    pub fn new(mut exponents: Vec<f64>) -> Self {
        exponents.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        Self { exponents }
    }

    pub fn exponents(&self) -> &[f64] {
        &self.exponents
    }

    pub fn leading(&self) -> Option<f64> {
        self.exponents.first().copied()
    }

    pub fn len(&self) -> usize {
        self.exponents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exponents.is_empty()
    }

    pub fn kaplan_yorke(&self) -> f64 {
        kaplan_yorke(&self.exponents)
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.exponents
    }
}

/// Computes `k` Lyapunov exponents by the QR method: transient, then
/// `renormalizations` blocks of length `interval`.
pub fn lyapunov_spectrum<S: DynamicalSystem + ?Sized>(
    system: &S,
    params: &[f64],
    initial_state: &[f64],
    config: &LyapunovConfig,
    solver: &SolverConfig,
) -> Result<LyapunovSpectrum> {
    config.validate()?;
    let columns = config.exponents.unwrap_or(system.dimension());
    let mut propagator =
        VariationalPropagator::new(system, params, initial_state, columns, solver)?;
    propagator.discard_transient(config.transient)?;

    let mut sums = vec![0.0; columns];
    for _ in 0..config.renormalizations {
        propagator.advance(config.interval)?;
        for (sum, growth) in sums.iter_mut().zip(propagator.renormalize()?) {
            *sum += growth;
        }
    }

    let total_time = config.renormalizations as f64 * config.interval;
    let exponents: Vec<f64> = sums.into_iter().map(|s| s / total_time).collect();
    debug!(
        "Lyapunov spectrum after {} renormalizations: {:?}",
        config.renormalizations, exponents
    );
    Ok(LyapunovSpectrum::new(exponents))
}

/// Kaplan-Yorke dimension of a descending spectrum.
///
/// With `k` the number of leading exponents whose partial sums stay
/// non-negative: returns `k` when `k` is 0 or the full length, otherwise
/// `k + S_k / |λ_{k+1}|`. A zero `λ_{k+1}` yields NaN.
pub fn kaplan_yorke(exponents: &[f64]) -> f64 {
    let mut partial = 0.0;
    let mut k = 0usize;
    for &lambda in exponents {
        if partial + lambda < 0.0 {
            break;
        }
        partial += lambda;
        k += 1;
    }

    if k == 0 || k == exponents.len() {
        return k as f64;
    }
    let next = exponents[k];
    if next == 0.0 {
        return f64::NAN;
    }
    k as f64 + partial / next.abs()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyapunovResult {
    pub spectrum: LyapunovSpectrum,
    pub kaplan_yorke: f64,
}

/// Spectrum plus its Kaplan-Yorke dimension.
pub fn analyze<S: DynamicalSystem + ?Sized>(
    system: &S,
    params: &[f64],
    initial_state: &[f64],
    config: &LyapunovConfig,
    solver: &SolverConfig,
) -> Result<LyapunovResult> {
    let spectrum = lyapunov_spectrum(system, params, initial_state, config, solver)?;
    let kaplan_yorke = spectrum.kaplan_yorke();
    Ok(LyapunovResult {
        spectrum,
        kaplan_yorke,
    })
}

/// Integrates the full variational system from the identity over
/// `[t0, t1]`. Returns the final state and the fundamental matrix
/// (the monodromy matrix when `t1 − t0` is a period).
pub fn fundamental_matrix<S: DynamicalSystem + ?Sized>(
    system: &S,
    params: &[f64],
    initial_state: &[f64],
    span: (f64, f64),
    solver: &SolverConfig,
) -> Result<(Vec<f64>, DMatrix<f64>)> {
    let n = system.dimension();
    if initial_state.len() != n {
        bail!(
            "Initial state has length {}, expected {}.",
            initial_state.len(),
            n
        );
    }
    let mut augmented = vec![0.0; n * (1 + n)];
    augmented[..n].copy_from_slice(initial_state);
    for i in 0..n {
        augmented[n + i * n + i] = 1.0;
    }

    let coupled_system = TangentSystem::new(system, n);
    let mut integrator = Integrator::new(*solver)?;
    let mut t = span.0;
    integrator
        .advance(&coupled_system, params, &mut t, &mut augmented, span.1)
        .context("Failed to integrate variational equations")?;

    let state = augmented[..n].to_vec();
    let matrix = DMatrix::from_row_slice(n, n, &augmented[n..]);
    Ok((state, matrix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::{FnSystem, Lorenz};
    use approx::assert_relative_eq;

    fn assert_err_contains<T: std::fmt::Debug>(result: anyhow::Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error containing '{needle}', got '{message}'"
        );
    }

    fn diagonal_linear(_t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
        out[0] = p[0] * x[0];
        out[1] = p[1] * x[1];
    }

    fn rotation(_t: f64, x: &[f64], _p: &[f64], out: &mut [f64]) {
        out[0] = -x[1];
        out[1] = x[0];
    }

    #[test]
    fn kaplan_yorke_edge_cases() {
        assert_eq!(kaplan_yorke(&[]), 0.0);
        assert_eq!(kaplan_yorke(&[1.0, 1.0, 1.0]), 3.0);
        assert_eq!(kaplan_yorke(&[-1.0, -2.0]), 0.0);
        assert_relative_eq!(kaplan_yorke(&[0.1, 0.0, -1.0]), 2.1, epsilon = 1e-12);
        assert_relative_eq!(kaplan_yorke(&[0.9, 0.0, -14.5]), 2.0 + 0.9 / 14.5, epsilon = 1e-12);
    }

    #[test]
    fn kaplan_yorke_stops_at_first_negative_partial_sum() {
        // Partial sums: 1.0, -1.0 -> k = 1, next = -2.0
        assert_relative_eq!(kaplan_yorke(&[1.0, -2.0, -3.0]), 1.5, epsilon = 1e-12);
        assert_eq!(kaplan_yorke(&[0.0, 0.0]), 2.0);
    }

    #[test]
    fn linear_system_recovers_diagonal_rates() {
        let system = FnSystem::new(2, diagonal_linear);
        let config = LyapunovConfig {
            transient: 0.0,
            renormalizations: 50,
            interval: 0.2,
            exponents: None,
        };
        let spectrum =
            lyapunov_spectrum(&system, &[0.5, -1.5], &[1.0, 1.0], &config, &SolverConfig::default())
                .unwrap();
        assert_eq!(spectrum.len(), 2);
        assert_relative_eq!(spectrum.exponents()[0], 0.5, epsilon = 1e-6);
        assert_relative_eq!(spectrum.exponents()[1], -1.5, epsilon = 1e-6);
    }

    #[test]
    fn tangent_stays_orthonormal_after_renormalization() {
        let params = Lorenz::standard_params();
        let mut propagator = VariationalPropagator::new(
            &Lorenz,
            &params,
            &[1.0, 1.0, 1.0],
            3,
            &SolverConfig::default(),
        )
        .unwrap();
        propagator.discard_transient(5.0).unwrap();
        for _ in 0..20 {
            propagator.advance(0.1).unwrap();
            let growth = propagator.renormalize().unwrap();
            assert_eq!(growth.len(), 3);
            assert!(propagator.orthonormality_defect() < 1e-10);
        }
        assert_relative_eq!(propagator.time(), 7.0, epsilon = 1e-9);
    }

    #[test]
    fn partial_spectrum_uses_requested_columns() {
        let system = FnSystem::new(2, diagonal_linear);
        let config = LyapunovConfig {
            transient: 1.0,
            renormalizations: 20,
            interval: 0.5,
            exponents: Some(1),
        };
        let result =
            analyze(&system, &[0.3, -2.0], &[0.5, 0.5], &config, &SolverConfig::default()).unwrap();
        assert_eq!(result.spectrum.len(), 1);
        assert_relative_eq!(result.spectrum.leading().unwrap(), 0.3, epsilon = 1e-6);
        assert_eq!(result.kaplan_yorke, 1.0);
    }

    #[test]
    fn lorenz_spectrum_and_dimension() {
        let params = Lorenz::standard_params();
        let config = LyapunovConfig {
            transient: 100.0,
            renormalizations: 300,
            interval: 0.1,
            exponents: None,
        };
        let result = analyze(&Lorenz, &params, &[1.0, 1.0, 1.0], &config, &SolverConfig::default())
            .unwrap();
        let exponents = result.spectrum.exponents();
        assert!(exponents[0] > 0.0, "leading exponent {}", exponents[0]);
        assert!(exponents[2] < -10.0);
        // The exponents sum to the constant divergence of the flow.
        let trace = -(params[0] + 1.0 + params[2]);
        assert_relative_eq!(exponents.iter().sum::<f64>(), trace, epsilon = 1e-3);
        assert!(
            (result.kaplan_yorke - 2.06).abs() < 0.05,
            "Kaplan-Yorke dimension {}",
            result.kaplan_yorke
        );
    }

    #[test]
    fn tangent_system_reuses_jacobian_buffer() {
        let system = FnSystem::new(2, diagonal_linear);
        let tangent = TangentSystem::new(&system, 2);
        let params = [2.0, -3.0];
        let mut out = vec![0.0; 6];
        let x = [1.0, 1.0, 1.0, 0.0, 0.0, 1.0];
        for _ in 0..3 {
            tangent.derivative(0.0, &x, &params, &mut out);
            for (value, expected) in out.iter().zip([2.0, -3.0, 2.0, 0.0, 0.0, -3.0]) {
                assert_relative_eq!(*value, expected, epsilon = 1e-6);
            }
        }
        assert_eq!(tangent.jacobian.borrow().shape(), (2, 2));
    }

    #[test]
    fn fundamental_matrix_of_rotation_is_rotation() {
        let system = FnSystem::new(2, rotation);
        let quarter = std::f64::consts::FRAC_PI_2;
        let (state, matrix) =
            fundamental_matrix(&system, &[], &[1.0, 0.0], (0.0, quarter), &SolverConfig::default())
                .unwrap();
        assert_relative_eq!(state[0], 0.0, epsilon = 1e-7);
        assert_relative_eq!(state[1], 1.0, epsilon = 1e-7);
        assert_relative_eq!(matrix[(0, 1)], -1.0, epsilon = 1e-7);
        assert_relative_eq!(matrix[(1, 0)], 1.0, epsilon = 1e-7);
        assert!(matrix[(0, 0)].abs() < 1e-7);
    }

    #[test]
    fn rejects_invalid_configuration() {
        let system = FnSystem::new(2, diagonal_linear);
        let config = LyapunovConfig {
            renormalizations: 0,
            ..LyapunovConfig::default()
        };
        assert_err_contains(
            lyapunov_spectrum(&system, &[1.0, 1.0], &[1.0, 1.0], &config, &SolverConfig::default()),
            "At least one renormalization",
        );
        let config = LyapunovConfig {
            exponents: Some(3),
            ..LyapunovConfig::default()
        };
        assert_err_contains(
            lyapunov_spectrum(&system, &[1.0, 1.0], &[1.0, 1.0], &config, &SolverConfig::default()),
            "tangent vectors must lie in",
        );
    }

    #[test]
    fn singular_tangent_is_reported() {
        let singular = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 2.0, 0.0]);
        assert_err_contains(thin_qr_positive(singular), "near-singular R matrix");
    }
}
