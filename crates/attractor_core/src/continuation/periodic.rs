use super::continue_with_problem;
use super::problem::{ContinuationProblem, FlowContext, PointDiagnostics, TestFunctionValues};
use super::types::{BranchType, ContinuationBranch, ContinuationConfig, OrbitRecord};
use super::util::{compute_eigenvalues, cycle_tests};
use crate::integrator::{SolverConfig, Trajectory};
use crate::lyapunov::fundamental_matrix;
use crate::traits::{parameter_sensitivity, DynamicalSystem};
use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use nalgebra::linalg::SVD;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Discretization of periodic orbits by orthogonal collocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollocationConfig {
    #[serde(alias = "M")]
    pub mesh_intervals: usize,
    /// Gauss-Legendre nodes per interval.
    #[serde(alias = "d")]
    pub degree: usize,
    /// Radius of the initial ellipse around a Hopf point.
    pub amplitude: f64,
}

impl Default for CollocationConfig {
    fn default() -> Self {
        Self {
            mesh_intervals: 20,
            degree: 4,
            amplitude: 0.1,
        }
    }
}

impl CollocationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mesh_intervals < 3 {
            bail!("Limit cycle meshes require at least 3 intervals");
        }
        if self.degree == 0 {
            bail!("Collocation degree must be at least 1");
        }
        if !(self.amplitude > 0.0) || !self.amplitude.is_finite() {
            bail!("Amplitude must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitCycleGuess {
    pub param_value: f64,
    pub period: f64,
    pub mesh_states: Vec<Vec<f64>>,
    /// `stage_states[interval][stage]`.
    pub stage_states: Vec<Vec<Vec<f64>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitCycleSetup {
    pub guess: LimitCycleGuess,
    pub phase_anchor: Vec<f64>,
    pub phase_direction: Vec<f64>,
    pub mesh_intervals: usize,
    pub degree: usize,
}

impl LimitCycleSetup {
    /// Flattened `[p, mesh states, stage states, T]`.
    pub fn initial_aug(&self) -> DVector<f64> {
        let mut flat = vec![self.guess.param_value];
        flat.extend(self.guess.mesh_states.iter().flatten());
        flat.extend(self.guess.stage_states.iter().flatten().flatten());
        flat.push(self.guess.period);
        DVector::from_vec(flat)
    }
}

/// Builds a collocation guess around the Hopf point `(hopf_state, hopf_param)`
/// from its critical eigenpair `λ = iω`: a small ellipse spanned by the real
/// and imaginary parts of the eigenvector, traversed in time `2π/ω`.
pub fn limit_cycle_setup_from_hopf<S: DynamicalSystem + ?Sized>(
    system: &S,
    params: &[f64],
    param_index: usize,
    hopf_state: &[f64],
    hopf_param: f64,
    collocation: &CollocationConfig,
) -> Result<LimitCycleSetup> {
    collocation.validate()?;
    let mut context = FlowContext::new(system, params, param_index)?;
    let dim = context.dimension();
    if hopf_state.len() != dim {
        bail!(
            "Hopf state dimension mismatch: expected {}, got {}",
            dim,
            hopf_state.len()
        );
    }

    let mut jac = DMatrix::zeros(dim, dim);
    context.with_param(hopf_param, |system, params| {
        system.jacobian(0.0, hopf_state, params, &mut jac)
    });
    let eigenvalues = compute_eigenvalues(&jac);
    let lambda = eigenvalues
        .iter()
        .filter(|val| val.im > 0.0)
        .min_by(|a, b| {
            a.re.abs()
                .partial_cmp(&b.re.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .copied()
        .ok_or_else(|| anyhow!("Could not locate Hopf eigenpair"))?;
    debug!("Hopf eigenvalue {lambda} at p = {hopf_param}");

    let eigenvector = compute_complex_eigenvector(&jac, lambda)?;
    let norm = eigenvector.iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt();
    if !(norm > 0.0) {
        bail!("Hopf eigenvector is degenerate");
    }
    let real_part: Vec<f64> = eigenvector.iter().map(|v| v.re / norm).collect();
    let imag_part: Vec<f64> = eigenvector.iter().map(|v| v.im / norm).collect();

    let amplitude = collocation.amplitude;
    let ellipse = |theta: f64| -> Vec<f64> {
        (0..dim)
            .map(|i| {
                hopf_state[i]
                    + amplitude * (real_part[i] * theta.cos() - imag_part[i] * theta.sin())
            })
            .collect()
    };

    let mesh_intervals = collocation.mesh_intervals;
    let degree = collocation.degree;
    let nodes = gauss_legendre_nodes(degree)?;
    let angle = |position: f64| 2.0 * PI * position / mesh_intervals as f64;

    let mesh_states: Vec<Vec<f64>> = (0..mesh_intervals)
        .map(|i| ellipse(angle(i as f64)))
        .collect();
    let stage_states: Vec<Vec<Vec<f64>>> = (0..mesh_intervals)
        .map(|i| {
            nodes
                .iter()
                .map(|&c| ellipse(angle(i as f64 + c)))
                .collect()
        })
        .collect();

    let dir_norm = imag_part.iter().map(|v| v * v).sum::<f64>().sqrt();
    if dir_norm == 0.0 {
        bail!("Imaginary part of Hopf eigenvector vanished; cannot define phase direction");
    }
    let phase_direction: Vec<f64> = imag_part.iter().map(|v| -v / dir_norm).collect();
    let phase_anchor = mesh_states[0].clone();

    Ok(LimitCycleSetup {
        guess: LimitCycleGuess {
            param_value: hopf_param,
            period: 2.0 * PI / lambda.im,
            mesh_states,
            stage_states,
        },
        phase_anchor,
        phase_direction,
        mesh_intervals,
        degree,
    })
}

/// Periodic orbits as solutions of the collocation system
/// `[p, mesh states, stage states, T]`: stage equations, continuity between
/// intervals (the last interval closes onto the first mesh state), and an
/// integral-free phase condition `(x_0 − anchor)·direction = 0`.
pub struct PeriodicOrbitProblem<'a, S: DynamicalSystem + ?Sized> {
    context: FlowContext<'a, S>,
    mesh_intervals: usize,
    degree: usize,
    coeffs: CollocationCoefficients,
    phase_anchor: Vec<f64>,
    phase_direction: Vec<f64>,
    monodromy_solver: SolverConfig,
    work_stage_f: Vec<f64>,
    work_stage_jac: Vec<DMatrix<f64>>,
    work_stage_param: Vec<f64>,
}

impl<'a, S: DynamicalSystem + ?Sized> PeriodicOrbitProblem<'a, S> {
    pub fn new(
        system: &'a S,
        params: &[f64],
        param_index: usize,
        setup: &LimitCycleSetup,
    ) -> Result<Self> {
        let context = FlowContext::new(system, params, param_index)?;
        let dim = context.dimension();
        let mesh_intervals = setup.mesh_intervals;
        let degree = setup.degree;
        if mesh_intervals < 2 {
            bail!("Collocation mesh must have at least 2 intervals");
        }
        validate_guess(dim, mesh_intervals, degree, &setup.guess)?;
        let (phase_anchor, phase_direction) = normalize_phase_data(
            dim,
            setup.phase_anchor.clone(),
            setup.phase_direction.clone(),
        )?;
        let coeffs = CollocationCoefficients::new(degree)?;
        let stage_count = mesh_intervals * degree;
        Ok(Self {
            context,
            mesh_intervals,
            degree,
            coeffs,
            phase_anchor,
            phase_direction,
            monodromy_solver: SolverConfig::default(),
            work_stage_f: vec![0.0; stage_count * dim],
            work_stage_jac: vec![DMatrix::zeros(dim, dim); stage_count],
            work_stage_param: vec![0.0; stage_count * dim],
        })
    }

    /// Integrator settings for the variational equations over one period.
    pub fn with_monodromy_solver(mut self, solver: SolverConfig) -> Result<Self> {
        solver.validate()?;
        self.monodromy_solver = solver;
        Ok(self)
    }

    fn state_dim(&self) -> usize {
        self.context.dimension()
    }

    fn stage_count(&self) -> usize {
        self.mesh_intervals * self.degree
    }

    fn stage_offset(&self) -> usize {
        1 + self.mesh_intervals * self.state_dim()
    }

    fn period_index(&self) -> usize {
        self.stage_offset() + self.stage_count() * self.state_dim()
    }

    fn mesh_states<'b>(&self, aug: &'b DVector<f64>) -> Vec<&'b [f64]> {
        let dim = self.state_dim();
        (0..self.mesh_intervals)
            .map(|i| &aug.as_slice()[1 + i * dim..1 + (i + 1) * dim])
            .collect()
    }

    fn stage_states<'b>(&self, aug: &'b DVector<f64>) -> Vec<&'b [f64]> {
        let dim = self.state_dim();
        let offset = self.stage_offset();
        (0..self.stage_count())
            .map(|k| &aug.as_slice()[offset + k * dim..offset + (k + 1) * dim])
            .collect()
    }

    fn period(&self, aug: &DVector<f64>) -> Result<f64> {
        let period = aug[self.period_index()];
        if !(period > 0.0) || !period.is_finite() {
            bail!("Period must be positive (got {period})");
        }
        Ok(period)
    }

    fn evaluate_stages(&mut self, param: f64, stage_states: &[&[f64]]) {
        let dim = self.state_dim();
        let buffer = &mut self.work_stage_f;
        self.context.with_param(param, |system, params| {
            for (idx, state) in stage_states.iter().enumerate() {
                system.derivative(0.0, state, params, &mut buffer[idx * dim..(idx + 1) * dim]);
            }
        });
    }

    fn evaluate_stage_derivatives(&mut self, param: f64, stage_states: &[&[f64]]) {
        let dim = self.state_dim();
        let param_index = self.context.param_index;
        let jacobians = &mut self.work_stage_jac;
        let sensitivities = &mut self.work_stage_param;
        self.context.with_param(param, |system, params| {
            for (idx, state) in stage_states.iter().enumerate() {
                system.jacobian(0.0, state, params, &mut jacobians[idx]);
                parameter_sensitivity(
                    system,
                    0.0,
                    state,
                    params,
                    param_index,
                    &mut sensitivities[idx * dim..(idx + 1) * dim],
                );
            }
        });
    }

    fn stage_function(&self, stage_idx: usize) -> &[f64] {
        let dim = self.state_dim();
        &self.work_stage_f[stage_idx * dim..(stage_idx + 1) * dim]
    }

    fn stage_param_sensitivity(&self, stage_idx: usize) -> &[f64] {
        let dim = self.state_dim();
        &self.work_stage_param[stage_idx * dim..(stage_idx + 1) * dim]
    }
}

impl<'a, S: DynamicalSystem + ?Sized> ContinuationProblem for PeriodicOrbitProblem<'a, S> {
    fn dimension(&self) -> usize {
        (self.mesh_intervals + self.stage_count()) * self.state_dim() + 1
    }

    fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        if out.len() != self.dimension() || aug_state.len() != self.dimension() + 1 {
            bail!("Residual buffer has incorrect dimension");
        }
        let dim = self.state_dim();
        let param = aug_state[0];
        let period = self.period(aug_state)?;
        let mesh_states = self.mesh_states(aug_state);
        let stage_states = self.stage_states(aug_state);
        self.evaluate_stages(param, &stage_states);

        let h = period / self.mesh_intervals as f64;
        let out_slice = out.as_mut_slice();
        let continuity_offset = self.stage_count() * dim;
        let phase_index = continuity_offset + self.mesh_intervals * dim;

        for interval in 0..self.mesh_intervals {
            let base = mesh_states[interval];
            for stage in 0..self.degree {
                let stage_idx = interval * self.degree + stage;
                let z = stage_states[stage_idx];
                for r in 0..dim {
                    let mut sum = 0.0;
                    for k in 0..self.degree {
                        sum += self.coeffs.a[stage][k]
                            * self.stage_function(interval * self.degree + k)[r];
                    }
                    out_slice[stage_idx * dim + r] = z[r] - base[r] - h * sum;
                }
            }
        }

        for interval in 0..self.mesh_intervals {
            let base = mesh_states[interval];
            let next = mesh_states[(interval + 1) % self.mesh_intervals];
            for r in 0..dim {
                let mut sum = 0.0;
                for k in 0..self.degree {
                    sum += self.coeffs.b[k] * self.stage_function(interval * self.degree + k)[r];
                }
                out_slice[continuity_offset + interval * dim + r] = next[r] - base[r] - h * sum;
            }
        }

        out_slice[phase_index] = mesh_states[0]
            .iter()
            .zip(&self.phase_anchor)
            .zip(&self.phase_direction)
            .map(|((x, a), d)| (x - a) * d)
            .sum();
        Ok(())
    }

    fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        let dim = self.state_dim();
        let total_unknowns = self.dimension();
        let mut jac = DMatrix::zeros(total_unknowns, total_unknowns + 1);

        let param = aug_state[0];
        let period = self.period(aug_state)?;
        let stage_states = self.stage_states(aug_state);
        self.evaluate_stages(param, &stage_states);
        self.evaluate_stage_derivatives(param, &stage_states);

        let mesh_col_start = 1usize;
        let stage_col_start = self.stage_offset();
        let period_col = self.period_index();
        let h = period / self.mesh_intervals as f64;
        let m = self.mesh_intervals as f64;

        // Stage rows
        for interval in 0..self.mesh_intervals {
            for stage in 0..self.degree {
                let row_base = (interval * self.degree + stage) * dim;
                for r in 0..dim {
                    let mut param_sum = 0.0;
                    let mut period_sum = 0.0;
                    for k in 0..self.degree {
                        let stage_k = interval * self.degree + k;
                        param_sum += self.coeffs.a[stage][k] * self.stage_param_sensitivity(stage_k)[r];
                        period_sum += self.coeffs.a[stage][k] * self.stage_function(stage_k)[r];
                    }
                    jac[(row_base + r, 0)] = -h * param_sum;
                    jac[(row_base + r, period_col)] = -period_sum / m;
                    jac[(row_base + r, mesh_col_start + interval * dim + r)] -= 1.0;

                    for col_stage in 0..self.degree {
                        let stage_col = interval * self.degree + col_stage;
                        let col_start = stage_col_start + stage_col * dim;
                        let stage_jac = &self.work_stage_jac[stage_col];
                        for c in 0..dim {
                            let mut value = -h * self.coeffs.a[stage][col_stage] * stage_jac[(r, c)];
                            if stage == col_stage && r == c {
                                value += 1.0;
                            }
                            jac[(row_base + r, col_start + c)] += value;
                        }
                    }
                }
            }
        }

        // Continuity rows
        let continuity_offset = self.stage_count() * dim;
        for interval in 0..self.mesh_intervals {
            let row_base = continuity_offset + interval * dim;
            let next_interval = (interval + 1) % self.mesh_intervals;
            for r in 0..dim {
                let mut param_sum = 0.0;
                let mut period_sum = 0.0;
                for k in 0..self.degree {
                    let stage_idx = interval * self.degree + k;
                    param_sum += self.coeffs.b[k] * self.stage_param_sensitivity(stage_idx)[r];
                    period_sum += self.coeffs.b[k] * self.stage_function(stage_idx)[r];

                    let col_start = stage_col_start + stage_idx * dim;
                    let stage_jac = &self.work_stage_jac[stage_idx];
                    for c in 0..dim {
                        jac[(row_base + r, col_start + c)] -= h * self.coeffs.b[k] * stage_jac[(r, c)];
                    }
                }
                jac[(row_base + r, 0)] = -h * param_sum;
                jac[(row_base + r, period_col)] = -period_sum / m;
                jac[(row_base + r, mesh_col_start + interval * dim + r)] -= 1.0;
                jac[(row_base + r, mesh_col_start + next_interval * dim + r)] += 1.0;
            }
        }

        // Phase row
        let phase_row = continuity_offset + self.mesh_intervals * dim;
        for r in 0..dim {
            jac[(phase_row, mesh_col_start + r)] = self.phase_direction[r];
        }

        Ok(jac)
    }

    fn diagnostics(&mut self, aug_state: &DVector<f64>) -> Result<PointDiagnostics> {
        let param = aug_state[0];
        let period = self.period(aug_state)?;
        let x0 = self.mesh_states(aug_state)[0].to_vec();
        let solver = self.monodromy_solver;
        let (_, monodromy) = self.context.with_param(param, |system, params| {
            fundamental_matrix(system, params, &x0, (0.0, period), &solver)
        })?;

        let multipliers = compute_eigenvalues(&monodromy);
        let tests = cycle_tests(&multipliers);
        Ok(PointDiagnostics {
            test_values: TestFunctionValues::limit_cycle(
                tests.cycle_fold,
                tests.period_doubling,
                tests.neimark_sacker,
            )
            .with_complex_pairs(tests.complex_pairs),
            eigenvalues: multipliers,
            stable: tests.stable,
        })
    }

    /// Moves the phase hyperplane to the accepted orbit: anchored at its
    /// first mesh state, normal to the flow there.
    fn update_after_step(&mut self, aug_state: &DVector<f64>) -> Result<()> {
        let x0 = self.mesh_states(aug_state)[0].to_vec();
        let velocity = self
            .context
            .with_param(aug_state[0], |system, params| system.rate(0.0, &x0, params));
        let (anchor, direction) = normalize_phase_data(self.state_dim(), x0, velocity)
            .context("Failed to update phase condition")?;
        self.phase_anchor = anchor;
        self.phase_direction = direction;
        Ok(())
    }

    fn record(&mut self, aug_state: &DVector<f64>) -> Result<Option<OrbitRecord>> {
        let period = self.period(aug_state)?;
        let h = period / self.mesh_intervals as f64;
        let mesh_states = self.mesh_states(aug_state);
        let stage_states = self.stage_states(aug_state);

        let mut trajectory = Trajectory::default();
        for interval in 0..self.mesh_intervals {
            trajectory.push(interval as f64 * h, mesh_states[interval]);
            for (stage, node) in self.coeffs.nodes.iter().enumerate() {
                trajectory.push(
                    (interval as f64 + node) * h,
                    stage_states[interval * self.degree + stage],
                );
            }
        }
        trajectory.push(period, mesh_states[0]);

        Ok(Some(OrbitRecord { period, trajectory }))
    }
}

/// Continues the limit cycle described by `setup` in `params[param_index]`.
pub fn continue_limit_cycle<S: DynamicalSystem + ?Sized>(
    system: &S,
    params: &[f64],
    param_index: usize,
    setup: &LimitCycleSetup,
    config: &ContinuationConfig,
    forward: bool,
) -> Result<ContinuationBranch> {
    let mut problem = PeriodicOrbitProblem::new(system, params, param_index, setup)?;
    let branch_type = BranchType::LimitCycle {
        mesh_intervals: setup.mesh_intervals,
        degree: setup.degree,
    };
    continue_with_problem(&mut problem, setup.initial_aug(), branch_type, config, forward)
}

fn normalize_phase_data(
    dim: usize,
    anchor: Vec<f64>,
    direction: Vec<f64>,
) -> Result<(Vec<f64>, Vec<f64>)> {
    if anchor.len() != dim || direction.len() != dim {
        bail!("Phase anchor and direction must match system dimension");
    }
    let norm = direction.iter().map(|v| v * v).sum::<f64>().sqrt();
    if !(norm > 0.0) || !norm.is_finite() {
        bail!("Phase direction must be non-zero");
    }
    Ok((anchor, direction.into_iter().map(|v| v / norm).collect()))
}

fn validate_guess(
    dim: usize,
    mesh_intervals: usize,
    degree: usize,
    guess: &LimitCycleGuess,
) -> Result<()> {
    if guess.mesh_states.len() != mesh_intervals {
        bail!(
            "Initial guess must provide {} mesh states (got {})",
            mesh_intervals,
            guess.mesh_states.len()
        );
    }
    if guess.stage_states.len() != mesh_intervals
        || guess.stage_states.iter().any(|stages| stages.len() != degree)
    {
        bail!(
            "Initial guess must provide {} stage states per interval",
            degree
        );
    }
    let states = guess
        .mesh_states
        .iter()
        .chain(guess.stage_states.iter().flatten());
    for state in states {
        if state.len() != dim {
            bail!(
                "State slice length {} does not match system dimension {}",
                state.len(),
                dim
            );
        }
    }
    if !(guess.period > 0.0) {
        bail!("Period must be positive (got {})", guess.period);
    }
    Ok(())
}

/// Right singular vector of `J − λI` for its smallest singular value.
fn compute_complex_eigenvector(
    mat: &DMatrix<f64>,
    eigenvalue: Complex<f64>,
) -> Result<Vec<Complex<f64>>> {
    let dim = mat.nrows();
    let mut shifted = mat.map(|v| Complex::new(v, 0.0));
    for i in 0..dim {
        shifted[(i, i)] -= eigenvalue;
    }
    let svd = SVD::new(shifted.clone(), false, true);
    let v_t = svd
        .v_t
        .as_ref()
        .ok_or_else(|| anyhow!("Failed to compute eigenvector for Hopf mode"))?;
    let (row, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| anyhow!("Failed to compute eigenvector for Hopf mode"))?;

    let vector = DVector::from_iterator(dim, (0..dim).map(|i| v_t[(row, i)].conj()));
    let conjugate = vector.map(|v| v.conj());
    let best = if (&shifted * &conjugate).norm() < (&shifted * &vector).norm() {
        conjugate
    } else {
        vector
    };
    Ok(best.iter().cloned().collect())
}

#[derive(Debug, Clone)]
struct CollocationCoefficients {
    nodes: Vec<f64>,
    a: Vec<Vec<f64>>,
    b: Vec<f64>,
}

impl CollocationCoefficients {
    fn new(degree: usize) -> Result<Self> {
        let nodes = gauss_legendre_nodes(degree)?;
        let poly_coeffs = lagrange_coefficients(&nodes)?;
        let b = poly_coeffs
            .iter()
            .map(|coeffs| integrate_polynomial(coeffs, 1.0))
            .collect();
        let a = nodes
            .iter()
            .map(|&node| {
                poly_coeffs
                    .iter()
                    .map(|coeffs| integrate_polynomial(coeffs, node))
                    .collect::<Vec<f64>>()
            })
            .collect();
        Ok(Self { nodes, a, b })
    }
}

/// Gauss-Legendre nodes mapped to `(0, 1)`, ascending.
fn gauss_legendre_nodes(degree: usize) -> Result<Vec<f64>> {
    if degree == 0 {
        bail!("Collocation degree must be positive");
    }
    let n = degree;
    let mut nodes = vec![0.0; n];
    for i in 0..(n + 1) / 2 {
        let mut x = f64::cos(PI * (i as f64 + 0.75) / (n as f64 + 0.5));
        for _ in 0..50 {
            let (p, dp) = legendre_eval(n, x);
            let dx = -p / dp;
            x += dx;
            if dx.abs() < 1e-14 {
                break;
            }
        }
        let t = 0.5 * (x + 1.0);
        nodes[i] = t;
        nodes[n - i - 1] = 1.0 - t;
    }
    nodes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Ok(nodes)
}

fn legendre_eval(n: usize, x: f64) -> (f64, f64) {
    if n == 0 {
        return (1.0, 0.0);
    }
    let mut p0 = 1.0;
    let mut p1 = x;
    if n == 1 {
        return (p1, 1.0);
    }
    for k in 2..=n {
        let kf = k as f64;
        let pn = ((2.0 * kf - 1.0) * x * p1 - (kf - 1.0) * p0) / kf;
        p0 = p1;
        p1 = pn;
    }
    let dp = (n as f64) * (x * p1 - p0) / (x * x - 1.0);
    (p1, dp)
}

/// Monomial coefficients of the Lagrange basis polynomials on `nodes`.
fn lagrange_coefficients(nodes: &[f64]) -> Result<Vec<Vec<f64>>> {
    let degree = nodes.len();
    let mut vandermonde = DMatrix::zeros(degree, degree);
    for (i, &node) in nodes.iter().enumerate() {
        let mut power = 1.0;
        for j in 0..degree {
            vandermonde[(i, j)] = power;
            power *= node;
        }
    }
    let lu = vandermonde.lu();
    if !lu.is_invertible() {
        bail!("Failed to invert Vandermonde matrix for collocation coefficients");
    }
    (0..degree)
        .map(|j| {
            let mut rhs = DVector::zeros(degree);
            rhs[j] = 1.0;
            lu.solve(&rhs)
                .map(|sol| sol.iter().cloned().collect::<Vec<f64>>())
                .ok_or_else(|| anyhow!("Failed to solve for Lagrange coefficients"))
        })
        .collect()
}

fn integrate_polynomial(coeffs: &[f64], upper: f64) -> f64 {
    coeffs
        .iter()
        .enumerate()
        .map(|(deg, &c)| c * upper.powi((deg + 1) as i32) / ((deg + 1) as f64))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::equilibrium::continue_equilibrium;
    use crate::continuation::types::{BifurcationType, TerminationReason};
    use crate::systems::{HopfNormalForm, Lorenz};
    use approx::assert_relative_eq;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn hopf_setup(collocation: &CollocationConfig) -> LimitCycleSetup {
        limit_cycle_setup_from_hopf(&HopfNormalForm, &[0.0, 1.0], 0, &[0.0, 0.0], 0.0, collocation)
            .expect("setup should succeed")
    }

    #[test]
    fn gauss_nodes_and_weights_are_exact() {
        let coeffs = CollocationCoefficients::new(2).unwrap();
        let offset = 3.0f64.sqrt() / 6.0;
        assert_relative_eq!(coeffs.nodes[0], 0.5 - offset, epsilon = 1e-14);
        assert_relative_eq!(coeffs.nodes[1], 0.5 + offset, epsilon = 1e-14);
        assert_relative_eq!(coeffs.b[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(coeffs.b[1], 0.5, epsilon = 1e-12);

        let coeffs = CollocationCoefficients::new(4).unwrap();
        assert_relative_eq!(coeffs.b.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        for (row, node) in coeffs.a.iter().zip(&coeffs.nodes) {
            assert_relative_eq!(row.iter().sum::<f64>(), *node, epsilon = 1e-12);
        }
        assert!(coeffs.nodes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn setup_from_hopf_builds_small_circle() {
        let setup = hopf_setup(&CollocationConfig::default());
        assert_relative_eq!(setup.guess.period, 2.0 * PI, epsilon = 1e-10);
        assert_eq!(setup.guess.mesh_states.len(), 20);
        assert_eq!(setup.guess.stage_states.len(), 20);
        assert!(setup.guess.stage_states.iter().all(|s| s.len() == 4));

        // The normal form's eigenvector spans a circle of radius a/√2.
        for state in setup
            .guess
            .mesh_states
            .iter()
            .chain(setup.guess.stage_states.iter().flatten())
        {
            let r = (state[0] * state[0] + state[1] * state[1]).sqrt();
            assert_relative_eq!(r, 0.1 / 2.0f64.sqrt(), epsilon = 1e-10);
        }

        let dir_norm: f64 = setup.phase_direction.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert_relative_eq!(dir_norm, 1.0, epsilon = 1e-12);
        assert_eq!(setup.phase_anchor, setup.guess.mesh_states[0]);
        assert_eq!(setup.initial_aug().len(), 1 + 20 * 2 + 80 * 2 + 1);

        // Anticlockwise rotation: the guess advances along the phase direction.
        let step: Vec<f64> = setup.guess.mesh_states[1]
            .iter()
            .zip(&setup.guess.mesh_states[0])
            .map(|(b, a)| b - a)
            .collect();
        let along: f64 = step.iter().zip(&setup.phase_direction).map(|(s, d)| s * d).sum();
        assert!(along > 0.0);
    }

    #[test]
    fn setup_requires_complex_eigenpair() {
        let params = [10.0, 0.5, 8.0 / 3.0];
        assert_err_contains(
            limit_cycle_setup_from_hopf(
                &Lorenz,
                &params,
                Lorenz::RHO,
                &[0.0, 0.0, 0.0],
                0.5,
                &CollocationConfig::default(),
            ),
            "Could not locate Hopf eigenpair",
        );
        let bad = CollocationConfig {
            mesh_intervals: 2,
            ..CollocationConfig::default()
        };
        assert_err_contains(
            limit_cycle_setup_from_hopf(&HopfNormalForm, &[0.0, 1.0], 0, &[0.0, 0.0], 0.0, &bad),
            "at least 3 intervals",
        );
    }

    #[test]
    fn extended_jacobian_matches_finite_differences() {
        let collocation = CollocationConfig {
            mesh_intervals: 4,
            degree: 2,
            amplitude: 0.3,
        };
        let setup = hopf_setup(&collocation);
        let mut problem = PeriodicOrbitProblem::new(&HopfNormalForm, &[0.0, 1.0], 0, &setup).unwrap();
        let mut aug = setup.initial_aug();
        aug[0] = 0.05;
        let dim = problem.dimension();
        let analytic = problem.extended_jacobian(&aug).unwrap();

        let mut plus = DVector::zeros(dim);
        let mut minus = DVector::zeros(dim);
        for col in 0..dim + 1 {
            let step = 1e-6 * (1.0 + aug[col].abs());
            let mut shifted = aug.clone();
            shifted[col] += step;
            problem.residual(&shifted, &mut plus).unwrap();
            shifted[col] -= 2.0 * step;
            problem.residual(&shifted, &mut minus).unwrap();
            for row in 0..dim {
                let numeric = (plus[row] - minus[row]) / (2.0 * step);
                assert!(
                    (numeric - analytic[(row, col)]).abs() < 1e-6,
                    "entry ({row}, {col}): {numeric} vs {}",
                    analytic[(row, col)]
                );
            }
        }
    }

    #[test]
    fn hopf_normal_form_cycles_have_radius_sqrt_mu() {
        let setup = hopf_setup(&CollocationConfig::default());
        let config = ContinuationConfig {
            ds: 0.05,
            ds_max: 0.5,
            p_max: 0.25,
            max_steps: 200,
            ..ContinuationConfig::default()
        };
        let branch =
            continue_limit_cycle(&HopfNormalForm, &[0.0, 1.0], 0, &setup, &config, true).unwrap();

        assert_eq!(
            branch.branch_type,
            BranchType::LimitCycle {
                mesh_intervals: 20,
                degree: 4
            }
        );
        assert_eq!(branch.termination, TerminationReason::ParameterBounds);
        assert!(branch.len() > 3);
        assert!(branch.points.last().unwrap().param_value > 0.15);
        assert!(branch.special_points.is_empty());

        for point in &branch.points {
            let mu = point.param_value;
            assert!(mu > 0.0);
            assert!(point.stable);
            let orbit = point.orbit.as_ref().expect("cycles carry their profile");
            assert_relative_eq!(orbit.period, 2.0 * PI, epsilon = 1e-6);
            assert_relative_eq!(*point.state.last().unwrap(), orbit.period, epsilon = 1e-14);
            assert_eq!(orbit.trajectory.len(), 20 * 5 + 1);
            assert_relative_eq!(
                orbit.trajectory.final_time().unwrap(),
                orbit.period,
                epsilon = 1e-14
            );
            assert!(orbit.trajectory.times.windows(2).all(|w| w[0] < w[1]));
            for state in &orbit.trajectory.states {
                let r2 = state[0] * state[0] + state[1] * state[1];
                assert!((r2 - mu).abs() < 1e-6, "r² = {r2}, μ = {mu}");
            }

            let nontrivial = point
                .eigenvalues
                .iter()
                .map(|m| m.re)
                .fold(f64::INFINITY, f64::min);
            assert_relative_eq!(nontrivial, (-4.0 * PI * mu).exp(), epsilon = 1e-5);
        }
    }

    #[test]
    fn cycle_branch_switches_from_detected_hopf_point() {
        let params = [-0.2, 1.0];
        let equilibrium_config = ContinuationConfig {
            ds: 0.05,
            ds_max: 0.1,
            p_max: 0.2,
            ..ContinuationConfig::default()
        };
        let equilibria = continue_equilibrium(
            &HopfNormalForm,
            &params,
            0,
            &[0.0, 0.0],
            &equilibrium_config,
            true,
        )
        .unwrap();
        let hopf = equilibria
            .special_points_of(BifurcationType::Hopf)
            .next()
            .expect("Hopf point on the equilibrium branch");

        let collocation = CollocationConfig::default();
        let setup = limit_cycle_setup_from_hopf(
            &HopfNormalForm,
            &params,
            0,
            &hopf.state,
            hopf.param_value,
            &collocation,
        )
        .unwrap();
        assert_eq!(setup.guess.param_value, hopf.param_value);
        assert_relative_eq!(setup.guess.period, 2.0 * PI, epsilon = 1e-6);

        let cycle_config = ContinuationConfig {
            ds: 0.05,
            ds_max: 0.5,
            p_max: 0.25,
            max_steps: 200,
            ..ContinuationConfig::default()
        };
        let cycles =
            continue_limit_cycle(&HopfNormalForm, &params, 0, &setup, &cycle_config, true)
                .unwrap();
        assert_eq!(cycles.termination, TerminationReason::ParameterBounds);
        let last = cycles.points.last().unwrap();
        assert!(last.param_value > 0.15);
        let orbit = last.orbit.as_ref().unwrap();
        assert_relative_eq!(orbit.period, 2.0 * PI, epsilon = 1e-6);
        for state in &orbit.trajectory.states {
            let r2 = state[0] * state[0] + state[1] * state[1];
            assert!((r2 - last.param_value).abs() < 1e-6, "r² = {r2}");
        }
    }

    #[test]
    fn mismatched_guess_is_rejected() {
        let mut setup = hopf_setup(&CollocationConfig::default());
        setup.guess.mesh_states.pop();
        assert_err_contains(
            PeriodicOrbitProblem::new(&HopfNormalForm, &[0.0, 1.0], 0, &setup).map(|_| ()),
            "must provide 20 mesh states",
        );
    }
}
