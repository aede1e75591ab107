pub mod equilibrium;
pub mod periodic;
pub mod problem;
pub mod types;
pub mod util;

pub use equilibrium::{compute_eigenvalues_for_state, continue_equilibrium, EquilibriumProblem};
pub use periodic::{
    continue_limit_cycle, limit_cycle_setup_from_hopf, CollocationConfig, LimitCycleGuess,
    LimitCycleSetup, PeriodicOrbitProblem,
};
pub use problem::{ContinuationProblem, PointDiagnostics, TestFunctionValues};
pub use types::{
    BifurcationType, BranchType, ContinuationBranch, ContinuationConfig, ContinuationPoint,
    OrbitRecord, SpecialPoint, TerminationReason,
};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use util::compute_nullspace_tangent;

/// Traces a solution branch of `problem` from `initial_aug = [p, x...]`.
///
/// The starting guess is corrected onto the branch first. Corrector
/// failures shrink the arclength step; a failure at `ds_min` ends the branch
/// and the points found so far are returned.
pub fn continue_with_problem<P: ContinuationProblem>(
    problem: &mut P,
    initial_aug: DVector<f64>,
    branch_type: BranchType,
    config: &ContinuationConfig,
    forward: bool,
) -> Result<ContinuationBranch> {
    config.validate()?;
    let dim = problem.dimension();
    if initial_aug.len() != dim + 1 {
        bail!(
            "Initial state dimension mismatch: expected {}, got {}",
            dim,
            initial_aug.len().saturating_sub(1)
        );
    }
    if !config.contains(initial_aug[0]) {
        bail!(
            "Starting parameter {} lies outside [{}, {}]",
            initial_aug[0],
            config.p_min,
            config.p_max
        );
    }

    let direction = if forward { 1.0 } else { -1.0 };
    let j_ext = problem.extended_jacobian(&initial_aug)?;
    let mut guess_tangent =
        compute_nullspace_tangent(&j_ext).context("Failed to compute initial tangent")?;
    if guess_tangent[0] * direction < 0.0 {
        guess_tangent = -guess_tangent;
    }

    let (mut current, mut tangent) = match moore_penrose_correct(
        problem,
        &initial_aug,
        &guess_tangent,
        config,
    ) {
        Ok(Some(corrected)) => corrected,
        Ok(None) => bail!("Starting point did not converge onto the solution branch"),
        Err(err) => {
            return Err(err.context("Starting point did not converge onto the solution branch"))
        }
    };
    if tangent.dot(&guess_tangent) < 0.0 {
        tangent = -tangent;
    }
    if !config.contains(current[0]) {
        bail!(
            "Corrected starting parameter {} lies outside [{}, {}]",
            current[0],
            config.p_min,
            config.p_max
        );
    }

    problem.update_after_step(&current)?;
    let mut current_diag = problem.diagnostics(&current)?;
    if !current_diag.test_values.is_finite() {
        bail!("Test functions are not finite at the starting point");
    }

    let mut branch = ContinuationBranch::new(branch_type);
    branch.push(make_point(
        problem,
        &current,
        &tangent,
        &current_diag,
        BifurcationType::None,
    )?);

    let mut ds = config.ds;
    let mut added = 0usize;

    branch.termination = loop {
        if added >= config.max_steps {
            break TerminationReason::MaxSteps;
        }

        let predicted = &current + &tangent * ds;
        let outcome = match moore_penrose_correct(problem, &predicted, &tangent, config) {
            Ok(Some((aug, next_tangent))) => match problem.diagnostics(&aug) {
                Ok(diag) if diag.test_values.is_finite() => Some((aug, next_tangent, diag)),
                Ok(_) => {
                    debug!("Non-finite test functions at p = {:.6}", aug[0]);
                    None
                }
                Err(err) => {
                    debug!("Diagnostics failed at p = {:.6}: {err:#}", aug[0]);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                debug!("Corrector error with ds = {ds:.3e}: {err:#}");
                None
            }
        };

        let Some((next, mut next_tangent, next_diag)) = outcome else {
            if ds <= config.ds_min {
                info!(
                    "Corrector failed at minimum step {:.3e}; branch ends after {} points",
                    ds,
                    branch.len()
                );
                break TerminationReason::CorrectorFailure;
            }
            ds = (ds * 0.5).max(config.ds_min);
            debug!("Corrector failed, reducing step to {ds:.3e}");
            continue;
        };

        if next_tangent.dot(&tangent) < 0.0 {
            next_tangent = -next_tangent;
        }

        if !config.contains(next[0]) {
            info!(
                "Parameter {:.6} left [{}, {}]; branch ends after {} points",
                next[0],
                config.p_min,
                config.p_max,
                branch.len()
            );
            break TerminationReason::ParameterBounds;
        }

        let mut next_kind = BifurcationType::None;
        if let Some(kind) = current_diag.test_values.crossing(&next_diag.test_values) {
            next_kind = kind;
            if matches!(kind, BifurcationType::Fold | BifurcationType::Hopf) {
                match refine_special_point(
                    problem,
                    kind,
                    (&current, &current_diag),
                    (&next, &next_diag),
                    &tangent,
                    config,
                ) {
                    Ok((refined, refined_tangent, refined_diag)) => {
                        info!("{kind:?} point located at p = {:.8}", refined[0]);
                        branch.push(make_point(
                            problem,
                            &refined,
                            &refined_tangent,
                            &refined_diag,
                            kind,
                        )?);
                        added += 1;
                        next_kind = BifurcationType::None;
                    }
                    Err(err) => {
                        warn!("{kind:?} refinement rejected near p = {:.6}: {err:#}", next[0]);
                    }
                }
            } else {
                info!("{kind:?} detected near p = {:.8}", next[0]);
            }
        }

        if added >= config.max_steps {
            break TerminationReason::MaxSteps;
        }

        problem.update_after_step(&next)?;
        branch.push(make_point(problem, &next, &next_tangent, &next_diag, next_kind)?);
        added += 1;
        debug!(
            "Accepted point {} at p = {:.6} (ds = {:.3e})",
            branch.len() - 1,
            next[0],
            ds
        );

        current = next;
        tangent = next_tangent;
        current_diag = next_diag;
        ds = (ds * config.growth).min(config.ds_max);
    };

    Ok(branch)
}

fn make_point<P: ContinuationProblem>(
    problem: &mut P,
    aug: &DVector<f64>,
    tangent: &DVector<f64>,
    diagnostics: &PointDiagnostics,
    kind: BifurcationType,
) -> Result<ContinuationPoint> {
    let dim = problem.dimension();
    Ok(ContinuationPoint {
        state: aug.rows(1, dim).iter().cloned().collect(),
        param_value: aug[0],
        tangent: tangent.iter().cloned().collect(),
        stable: diagnostics.stable,
        stability: kind,
        eigenvalues: diagnostics.eigenvalues.clone(),
        orbit: problem.record(aug)?,
    })
}

/// Moore-Penrose corrector: Newton on the bordered system `[J(u); vᵀ]`
/// with the tangent `v` updated alongside `u`.
///
/// Returns `Ok(None)` when the iteration diverges, meets a singular
/// bordered matrix or exhausts `max_newton_iters`.
fn moore_penrose_correct<P: ContinuationProblem>(
    problem: &mut P,
    predicted: &DVector<f64>,
    tangent: &DVector<f64>,
    config: &ContinuationConfig,
) -> Result<Option<(DVector<f64>, DVector<f64>)>> {
    let dim = problem.dimension();
    let mut u = predicted.clone();
    let mut v = tangent.clone();
    let mut residual = DVector::zeros(dim);
    let mut last_step = f64::INFINITY;

    for iteration in 0..=config.max_newton_iters {
        problem.residual(&u, &mut residual)?;
        let residual_norm = residual.norm();
        if !residual_norm.is_finite() {
            return Ok(None);
        }
        if residual_norm < config.newton_tol && last_step < config.step_tol {
            debug!("Corrector converged in {iteration} iterations (|F| = {residual_norm:.3e})");
            return Ok(Some((u, v)));
        }
        if iteration == config.max_newton_iters {
            break;
        }

        let j_ext = problem.extended_jacobian(&u)?;
        let mut bordered = DMatrix::zeros(dim + 1, dim + 1);
        bordered.view_mut((0, 0), (dim, dim + 1)).copy_from(&j_ext);
        for i in 0..dim + 1 {
            bordered[(dim, i)] = v[i];
        }
        let lu = bordered.lu();

        let mut rhs = DVector::zeros(dim + 1);
        rhs.rows_mut(0, dim).copy_from(&residual);
        let Some(du) = lu.solve(&rhs) else {
            return Ok(None);
        };
        rhs.rows_mut(0, dim).copy_from(&(&j_ext * &v));
        rhs[dim] = 0.0;
        let Some(dv) = lu.solve(&rhs) else {
            return Ok(None);
        };
        if du.iter().chain(dv.iter()).any(|x| !x.is_finite()) {
            return Ok(None);
        }

        u -= &du;
        v -= &dv;
        let v_norm = v.norm();
        if !(v_norm > 0.0) || !v_norm.is_finite() {
            return Ok(None);
        }
        v /= v_norm;
        last_step = du.norm();
    }

    Ok(None)
}

/// Refines a fold or Hopf point bracketed by `current` and `next`, returning
/// the refined state, its oriented tangent and its diagnostics. Points outside
/// the bracketing step are rejected.
fn refine_special_point<P: ContinuationProblem>(
    problem: &mut P,
    kind: BifurcationType,
    current: (&DVector<f64>, &PointDiagnostics),
    next: (&DVector<f64>, &PointDiagnostics),
    tangent: &DVector<f64>,
    config: &ContinuationConfig,
) -> Result<(DVector<f64>, DVector<f64>, PointDiagnostics)> {
    let (current_aug, current_diag) = current;
    let (next_aug, next_diag) = next;
    let refined = locate_special_point(
        problem,
        kind,
        (current_aug, current_diag.test_values.value_for(kind)),
        (next_aug, next_diag.test_values.value_for(kind)),
        config,
    )?;

    let step_length = (next_aug - current_aug).norm();
    if (&refined - current_aug).norm() > step_length || (&refined - next_aug).norm() > step_length
    {
        bail!("Refined point lies outside the bracketing step");
    }
    if !config.contains(refined[0]) {
        bail!("Refined parameter {} outside bounds", refined[0]);
    }

    let diagnostics = problem.diagnostics(&refined)?;
    let j_ext = problem.extended_jacobian(&refined)?;
    let mut refined_tangent = compute_nullspace_tangent(&j_ext)?;
    if refined_tangent.dot(tangent) < 0.0 {
        refined_tangent = -refined_tangent;
    }
    Ok((refined, refined_tangent, diagnostics))
}

/// Newton on `[F; τ] = 0`, started from the secant estimate of the
/// test-function root between two bracketing points.
fn locate_special_point<P: ContinuationProblem>(
    problem: &mut P,
    kind: BifurcationType,
    current: (&DVector<f64>, f64),
    next: (&DVector<f64>, f64),
    config: &ContinuationConfig,
) -> Result<DVector<f64>> {
    let dim = problem.dimension();
    let (current_aug, current_value) = current;
    let (next_aug, next_value) = next;

    let mut guess = current_aug.clone();
    let denom = current_value - next_value;
    if denom.abs() > 1e-12 {
        let mut s = current_value / denom;
        if !s.is_finite() {
            s = 0.5;
        }
        s = s.clamp(0.0, 1.0);
        guess = current_aug + (next_aug - current_aug) * s;
    }

    let mut residual = DVector::zeros(dim);
    for _ in 0..config.max_newton_iters {
        problem.residual(&guess, &mut residual)?;
        let test_value = problem.diagnostics(&guess)?.test_values.value_for(kind);
        if residual.norm() < config.newton_tol && test_value.abs() < config.newton_tol {
            return Ok(guess);
        }

        let j_ext = problem.extended_jacobian(&guess)?;
        let gradient = compute_test_gradient(problem, &guess, kind)?;

        let mut a = DMatrix::zeros(dim + 1, dim + 1);
        a.view_mut((0, 0), (dim, dim + 1)).copy_from(&j_ext);
        for i in 0..dim + 1 {
            a[(dim, i)] = gradient[i];
        }
        let mut rhs = DVector::zeros(dim + 1);
        for i in 0..dim {
            rhs[i] = -residual[i];
        }
        rhs[dim] = -test_value;

        let delta = a
            .lu()
            .solve(&rhs)
            .ok_or_else(|| anyhow!("{kind:?} refinement linear solve failed"))?;
        if delta.iter().any(|v| !v.is_finite()) {
            bail!("{kind:?} refinement diverged");
        }
        guess += &delta;

        if delta.norm() < config.step_tol {
            return Ok(guess);
        }
    }

    Err(anyhow!("{kind:?} refinement did not converge"))
}

/// Central-difference gradient of one test function in `[p, x]` coordinates.
fn compute_test_gradient<P: ContinuationProblem>(
    problem: &mut P,
    aug_state: &DVector<f64>,
    kind: BifurcationType,
) -> Result<DVector<f64>> {
    let mut grad = DVector::zeros(aug_state.len());
    let base_eps = 1e-6;

    for i in 0..aug_state.len() {
        let mut perturbed = aug_state.clone();
        let step = base_eps * (1.0 + aug_state[i].abs());
        perturbed[i] += step;
        let plus = problem.diagnostics(&perturbed)?.test_values.value_for(kind);
        perturbed[i] -= 2.0 * step;
        let minus = problem.diagnostics(&perturbed)?.test_values.value_for(kind);
        grad[i] = (plus - minus) / (2.0 * step);
    }

    Ok(grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::util::compute_eigenvalues;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    /// `x² + p = 0`, folding at the origin. Optionally refuses to evaluate
    /// beyond a parameter value.
    struct Parabola {
        evaluable_up_to: f64,
    }

    impl ContinuationProblem for Parabola {
        fn dimension(&self) -> usize {
            1
        }

        fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
            if aug_state[0] > self.evaluable_up_to {
                bail!("Residual undefined for p = {}", aug_state[0]);
            }
            out[0] = aug_state[1] * aug_state[1] + aug_state[0];
            Ok(())
        }

        fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_row_slice(1, 2, &[1.0, 2.0 * aug_state[1]]))
        }

        fn diagnostics(&mut self, aug_state: &DVector<f64>) -> Result<PointDiagnostics> {
            let jac = DMatrix::from_element(1, 1, 2.0 * aug_state[1]);
            let eigenvalues = compute_eigenvalues(&jac);
            let stable = eigenvalues.iter().all(|l| l.re < 0.0);
            Ok(PointDiagnostics {
                test_values: TestFunctionValues::equilibrium(jac[(0, 0)], 1.0, 1.0),
                eigenvalues,
                stable,
            })
        }
    }

    fn parabola_config() -> ContinuationConfig {
        ContinuationConfig {
            p_min: -2.0,
            p_max: 1.0,
            ds: 0.1,
            ds_max: 0.2,
            max_steps: 200,
            ..ContinuationConfig::default()
        }
    }

    #[test]
    fn fold_is_refined_and_branch_turns_back() {
        let mut problem = Parabola {
            evaluable_up_to: f64::INFINITY,
        };
        let branch = continue_with_problem(
            &mut problem,
            DVector::from_vec(vec![-1.0, 1.0]),
            BranchType::Equilibrium,
            &parabola_config(),
            true,
        )
        .expect("continuation should run");

        let folds: Vec<_> = branch.special_points_of(BifurcationType::Fold).collect();
        assert_eq!(folds.len(), 1);
        assert!(folds[0].param_value.abs() < 1e-8);
        assert!(folds[0].state[0].abs() < 1e-6);
        assert_eq!(branch.termination, TerminationReason::ParameterBounds);

        let last = branch.points.last().unwrap();
        assert!(last.state[0] < 0.0);
        assert!(last.param_value >= -2.0);
        assert!(last.stable);
        assert!(!branch.points[0].stable);

        for point in &branch.points {
            let residual = point.state[0] * point.state[0] + point.param_value;
            assert!(residual.abs() < 1e-8);
            let norm: f64 = point.tangent.iter().map(|v| v * v).sum::<f64>().sqrt();
            assert!((norm - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn approximate_start_is_corrected() {
        let mut problem = Parabola {
            evaluable_up_to: f64::INFINITY,
        };
        let config = ContinuationConfig {
            max_steps: 3,
            ..parabola_config()
        };
        let branch = continue_with_problem(
            &mut problem,
            DVector::from_vec(vec![-1.0, 1.05]),
            BranchType::Equilibrium,
            &config,
            true,
        )
        .expect("continuation should run");
        let start = &branch.points[0];
        assert!((start.state[0] * start.state[0] + start.param_value).abs() < 1e-9);
        assert_eq!(branch.len(), 4);
        assert_eq!(branch.termination, TerminationReason::MaxSteps);
    }

    #[test]
    fn backward_direction_decreases_parameter() {
        let mut problem = Parabola {
            evaluable_up_to: f64::INFINITY,
        };
        let config = ContinuationConfig {
            max_steps: 5,
            ..parabola_config()
        };
        let branch = continue_with_problem(
            &mut problem,
            DVector::from_vec(vec![-1.0, 1.0]),
            BranchType::Equilibrium,
            &config,
            false,
        )
        .expect("continuation should run");
        assert!(branch.points[1].param_value < branch.points[0].param_value);
        assert!(branch.points[1].tangent[0] < 0.0);
    }

    #[test]
    fn corrector_failure_returns_partial_branch() {
        let mut problem = Parabola {
            evaluable_up_to: -0.5,
        };
        let branch = continue_with_problem(
            &mut problem,
            DVector::from_vec(vec![-1.0, 1.0]),
            BranchType::Equilibrium,
            &parabola_config(),
            true,
        )
        .expect("partial branch should be returned");
        assert_eq!(branch.termination, TerminationReason::CorrectorFailure);
        assert!(branch.len() > 1);
        assert!(branch.points.iter().all(|p| p.param_value <= -0.5));
    }

    #[test]
    fn start_outside_bounds_is_rejected() {
        let mut problem = Parabola {
            evaluable_up_to: f64::INFINITY,
        };
        let config = ContinuationConfig {
            p_min: 0.0,
            ..parabola_config()
        };
        assert_err_contains(
            continue_with_problem(
                &mut problem,
                DVector::from_vec(vec![-1.0, 1.0]),
                BranchType::Equilibrium,
                &config,
                true,
            ),
            "lies outside",
        );
    }

    #[test]
    fn unreachable_start_is_rejected() {
        let mut problem = Parabola {
            evaluable_up_to: -1.5,
        };
        assert_err_contains(
            continue_with_problem(
                &mut problem,
                DVector::from_vec(vec![-1.0, 1.0]),
                BranchType::Equilibrium,
                &parabola_config(),
                true,
            ),
            "did not converge onto the solution branch",
        );
    }
}
