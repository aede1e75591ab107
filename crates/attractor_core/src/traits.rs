use nalgebra::DMatrix;

/// Represents a continuous-time dynamical system `dx/dt = f(t, x, p)`.
pub trait DynamicalSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// params: parameter vector (read-only for the duration of the call)
    /// out: buffer to write dx/dt into
    fn derivative(&self, t: f64, x: &[f64], params: &[f64], out: &mut [f64]);

    /// Writes the state Jacobian `∂f/∂x` into `out` (n×n).
    ///
    /// The default uses central finite differences on `derivative`;
    /// systems with an analytic Jacobian should override it together with
    /// `has_jacobian`.
    fn jacobian(&self, t: f64, x: &[f64], params: &[f64], out: &mut DMatrix<f64>) {
        finite_difference_jacobian(self, t, x, params, out);
    }

    /// Whether `jacobian` is analytic rather than the finite-difference default.
    fn has_jacobian(&self) -> bool {
        false
    }

    /// Value-semantics convenience wrapper around `derivative`.
    fn rate(&self, t: f64, x: &[f64], params: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.dimension()];
        self.derivative(t, x, params, &mut out);
        out
    }
}

/// Central-difference Jacobian of any system's vector field.
pub fn finite_difference_jacobian<S: DynamicalSystem + ?Sized>(
    system: &S,
    t: f64,
    x: &[f64],
    params: &[f64],
    out: &mut DMatrix<f64>,
) {
    let dim = x.len();
    let mut perturbed = x.to_vec();
    let mut plus = vec![0.0; dim];
    let mut minus = vec![0.0; dim];

    for j in 0..dim {
        let step = 1e-7 * (1.0 + x[j].abs());
        perturbed[j] = x[j] + step;
        system.derivative(t, &perturbed, params, &mut plus);
        perturbed[j] = x[j] - step;
        system.derivative(t, &perturbed, params, &mut minus);
        perturbed[j] = x[j];
        for i in 0..dim {
            out[(i, j)] = (plus[i] - minus[i]) / (2.0 * step);
        }
    }
}

/// Derivative of the vector field with respect to a single parameter,
/// by central differences.
pub fn parameter_sensitivity<S: DynamicalSystem + ?Sized>(
    system: &S,
    t: f64,
    x: &[f64],
    params: &[f64],
    param_index: usize,
    out: &mut [f64],
) {
    let dim = x.len();
    let base = params[param_index];
    let delta = 1e-6f64.max(1e-6 * base.abs());
    let mut shifted = params.to_vec();
    let mut plus = vec![0.0; dim];
    let mut minus = vec![0.0; dim];

    shifted[param_index] = base + delta;
    system.derivative(t, x, &shifted, &mut plus);
    shifted[param_index] = base - delta;
    system.derivative(t, x, &shifted, &mut minus);

    for i in 0..dim {
        out[i] = (plus[i] - minus[i]) / (2.0 * delta);
    }
}

impl<S: DynamicalSystem + ?Sized> DynamicalSystem for &S {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn derivative(&self, t: f64, x: &[f64], params: &[f64], out: &mut [f64]) {
        (**self).derivative(t, x, params, out)
    }

    fn jacobian(&self, t: f64, x: &[f64], params: &[f64], out: &mut DMatrix<f64>) {
        (**self).jacobian(t, x, params, out)
    }

    fn has_jacobian(&self) -> bool {
        (**self).has_jacobian()
    }
}
