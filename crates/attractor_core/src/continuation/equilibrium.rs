use super::problem::{ContinuationProblem, FlowContext, PointDiagnostics, TestFunctionValues};
use super::types::{BranchType, ContinuationBranch, ContinuationConfig};
use super::util::{
    compute_eigenvalues, hopf_test_function, neutral_saddle_test_function, real_eigenvalue_count,
};
use super::continue_with_problem;
use crate::traits::{parameter_sensitivity, DynamicalSystem};
use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

/// Equilibria `f(x, p) = 0` of a flow, continued in one parameter.
pub struct EquilibriumProblem<'a, S: DynamicalSystem + ?Sized> {
    context: FlowContext<'a, S>,
}

impl<'a, S: DynamicalSystem + ?Sized> EquilibriumProblem<'a, S> {
    pub fn new(system: &'a S, params: &[f64], param_index: usize) -> Result<Self> {
        Ok(Self {
            context: FlowContext::new(system, params, param_index)?,
        })
    }

    fn state_jacobian(&mut self, param: f64, state: &[f64]) -> DMatrix<f64> {
        let dim = self.dimension();
        let mut jac = DMatrix::zeros(dim, dim);
        self.context
            .with_param(param, |system, params| system.jacobian(0.0, state, params, &mut jac));
        jac
    }
}

impl<'a, S: DynamicalSystem + ?Sized> ContinuationProblem for EquilibriumProblem<'a, S> {
    fn dimension(&self) -> usize {
        self.context.dimension()
    }

    fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        let dim = self.dimension();
        if out.len() != dim || aug_state.len() != dim + 1 {
            bail!("Residual buffer has incorrect dimension");
        }
        let state: Vec<f64> = aug_state.rows(1, dim).iter().cloned().collect();
        self.context.with_param(aug_state[0], |system, params| {
            system.derivative(0.0, &state, params, out.as_mut_slice())
        });
        Ok(())
    }

    fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        let dim = self.dimension();
        let param = aug_state[0];
        let state: Vec<f64> = aug_state.rows(1, dim).iter().cloned().collect();

        let mut j_ext = DMatrix::zeros(dim, dim + 1);
        let mut sensitivity = vec![0.0; dim];
        let param_index = self.context.param_index;
        self.context.with_param(param, |system, params| {
            parameter_sensitivity(system, 0.0, &state, params, param_index, &mut sensitivity)
        });
        for i in 0..dim {
            j_ext[(i, 0)] = sensitivity[i];
        }
        let jac_x = self.state_jacobian(param, &state);
        j_ext.view_mut((0, 1), (dim, dim)).copy_from(&jac_x);
        Ok(j_ext)
    }

    fn diagnostics(&mut self, aug_state: &DVector<f64>) -> Result<PointDiagnostics> {
        let dim = self.dimension();
        let state: Vec<f64> = aug_state.rows(1, dim).iter().cloned().collect();
        let jac = self.state_jacobian(aug_state[0], &state);

        let fold = jac.determinant();
        let eigenvalues = compute_eigenvalues(&jac);
        let hopf = hopf_test_function(&eigenvalues);
        let neutral = neutral_saddle_test_function(&eigenvalues);
        let stable = eigenvalues.iter().all(|lambda| lambda.re < 0.0);

        Ok(PointDiagnostics {
            test_values: TestFunctionValues::equilibrium(fold, hopf, neutral)
                .with_real_eigenvalues(real_eigenvalue_count(&eigenvalues)),
            eigenvalues,
            stable,
        })
    }
}

/// Continues an equilibrium of `system` in `params[param_index]`, starting
/// from `initial_state` at the parameter value stored in `params`.
pub fn continue_equilibrium<S: DynamicalSystem + ?Sized>(
    system: &S,
    params: &[f64],
    param_index: usize,
    initial_state: &[f64],
    config: &ContinuationConfig,
    forward: bool,
) -> Result<ContinuationBranch> {
    let mut problem = EquilibriumProblem::new(system, params, param_index)?;
    if initial_state.len() != problem.dimension() {
        bail!(
            "Initial state dimension mismatch: expected {}, got {}",
            problem.dimension(),
            initial_state.len()
        );
    }

    let mut aug = DVector::zeros(initial_state.len() + 1);
    aug[0] = params[param_index];
    aug.rows_mut(1, initial_state.len()).copy_from_slice(initial_state);

    continue_with_problem(&mut problem, aug, BranchType::Equilibrium, config, forward)
}

/// Eigenvalues of the state Jacobian at `state` with the continuation
/// parameter set to `param_value`.
pub fn compute_eigenvalues_for_state<S: DynamicalSystem + ?Sized>(
    system: &S,
    params: &[f64],
    param_index: usize,
    state: &[f64],
    param_value: f64,
) -> Result<Vec<Complex<f64>>> {
    let mut problem = EquilibriumProblem::new(system, params, param_index)?;
    if state.len() != problem.dimension() {
        bail!(
            "State dimension mismatch: expected {}, got {}",
            problem.dimension(),
            state.len()
        );
    }
    let jac = problem.state_jacobian(param_value, state);
    Ok(compute_eigenvalues(&jac))
}
