use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use super::types::{BifurcationType, OrbitRecord};
use crate::traits::DynamicalSystem;

/// Generic diagnostics reported by a continuation problem at a given point.
#[derive(Debug, Clone)]
pub struct PointDiagnostics {
    pub test_values: TestFunctionValues,
    pub eigenvalues: Vec<Complex<f64>>,
    pub stable: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TestFunctionValues {
    pub fold: f64,
    pub hopf: f64,
    pub neutral_saddle: f64,
    pub cycle_fold: f64,
    pub period_doubling: f64,
    pub neimark_sacker: f64,
    /// Real eigenvalues entering the neutral-saddle product.
    #[serde(default)]
    pub real_eigenvalues: usize,
    /// Complex multiplier pairs entering the Neimark-Sacker product.
    #[serde(default)]
    pub complex_pairs: usize,
}

impl TestFunctionValues {
    pub fn equilibrium(fold: f64, hopf: f64, neutral_saddle: f64) -> Self {
        Self {
            fold,
            hopf,
            neutral_saddle,
            cycle_fold: 1.0,
            period_doubling: 1.0,
            neimark_sacker: 1.0,
            real_eigenvalues: 0,
            complex_pairs: 0,
        }
    }

    pub fn limit_cycle(cycle_fold: f64, period_doubling: f64, neimark_sacker: f64) -> Self {
        Self {
            fold: 1.0,
            hopf: 1.0,
            neutral_saddle: 1.0,
            cycle_fold,
            period_doubling,
            neimark_sacker,
            real_eigenvalues: 0,
            complex_pairs: 0,
        }
    }

    pub fn with_real_eigenvalues(mut self, count: usize) -> Self {
        self.real_eigenvalues = count;
        self
    }

    pub fn with_complex_pairs(mut self, count: usize) -> Self {
        self.complex_pairs = count;
        self
    }

    pub fn value_for(&self, kind: BifurcationType) -> f64 {
        match kind {
            BifurcationType::Fold => self.fold,
            BifurcationType::Hopf => self.hopf,
            BifurcationType::NeutralSaddle => self.neutral_saddle,
            BifurcationType::CycleFold => self.cycle_fold,
            BifurcationType::PeriodDoubling => self.period_doubling,
            BifurcationType::NeimarkSacker => self.neimark_sacker,
            BifurcationType::None => 0.0,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.fold.is_finite()
            && self.hopf.is_finite()
            && self.neutral_saddle.is_finite()
            && self.cycle_fold.is_finite()
            && self.period_doubling.is_finite()
            && self.neimark_sacker.is_finite()
    }

    /// The bifurcation flagged between two consecutive points, if any.
    /// A Hopf sign change is attributed to a neutral saddle when both
    /// tests cross together. The neutral-saddle and Neimark-Sacker products
    /// are only compared while the number of factors they multiply is
    /// unchanged; a pair turning from complex to real resets them to 1.
    pub fn crossing(&self, next: &TestFunctionValues) -> Option<BifurcationType> {
        let comparable = |kind: BifurcationType| match kind {
            BifurcationType::NeutralSaddle => self.real_eigenvalues == next.real_eigenvalues,
            BifurcationType::NeimarkSacker => self.complex_pairs == next.complex_pairs,
            _ => true,
        };
        let crossed = |kind: BifurcationType| {
            comparable(kind) && self.value_for(kind) * next.value_for(kind) < 0.0
        };
        if crossed(BifurcationType::Fold) {
            Some(BifurcationType::Fold)
        } else if crossed(BifurcationType::Hopf) && !crossed(BifurcationType::NeutralSaddle) {
            Some(BifurcationType::Hopf)
        } else if crossed(BifurcationType::NeutralSaddle) {
            Some(BifurcationType::NeutralSaddle)
        } else if crossed(BifurcationType::CycleFold) {
            Some(BifurcationType::CycleFold)
        } else if crossed(BifurcationType::PeriodDoubling) {
            Some(BifurcationType::PeriodDoubling)
        } else if crossed(BifurcationType::NeimarkSacker) {
            Some(BifurcationType::NeimarkSacker)
        } else {
            None
        }
    }
}

/// Core interface implemented by any system that can be continued via PALC.
///
/// Augmented states are laid out as `[p, x...]`.
pub trait ContinuationProblem {
    /// Number of unknowns (excluding the continuation parameter).
    fn dimension(&self) -> usize;

    /// Evaluate the residual F(aug_state) and write into `out`.
    fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()>;

    /// Compute the extended Jacobian (derivative of F w.r.t. [p, x]).
    fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>>;

    /// Return diagnostics (test functions, eigenvalues, stability) for
    /// bifurcation detection.
    fn diagnostics(&mut self, aug_state: &DVector<f64>) -> Result<PointDiagnostics>;

    /// Optional hook called after each accepted continuation point.
    /// Used by some problems to update internal state (e.g., phase conditions for LCs).
    fn update_after_step(&mut self, _aug_state: &DVector<f64>) -> Result<()> {
        Ok(())
    }

    /// Optional per-point orbit profile stored on the branch.
    fn record(&mut self, _aug_state: &DVector<f64>) -> Result<Option<OrbitRecord>> {
        Ok(None)
    }
}

/// A borrowed system with an owned parameter vector in which the
/// continuation parameter is temporarily replaced.
pub(crate) struct FlowContext<'a, S: DynamicalSystem + ?Sized> {
    pub(crate) system: &'a S,
    params: Vec<f64>,
    pub(crate) param_index: usize,
}

impl<'a, S: DynamicalSystem + ?Sized> FlowContext<'a, S> {
    pub(crate) fn new(system: &'a S, params: &[f64], param_index: usize) -> Result<Self> {
        if param_index >= params.len() {
            anyhow::bail!(
                "Parameter index {} out of bounds for {} parameters",
                param_index,
                params.len()
            );
        }
        Ok(Self {
            system,
            params: params.to_vec(),
            param_index,
        })
    }

    pub(crate) fn dimension(&self) -> usize {
        self.system.dimension()
    }

    pub(crate) fn with_param<F, R>(&mut self, param: f64, f: F) -> R
    where
        F: FnOnce(&S, &[f64]) -> R,
    {
        let old = self.params[self.param_index];
        self.params[self.param_index] = param;
        let result = f(self.system, &self.params);
        self.params[self.param_index] = old;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hopf_crossing_is_suppressed_by_neutral_saddle() {
        let before = TestFunctionValues::equilibrium(1.0, 1.0, 1.0);
        let hopf = TestFunctionValues::equilibrium(1.0, -1.0, 1.0);
        let neutral = TestFunctionValues::equilibrium(1.0, -1.0, -1.0);
        assert_eq!(before.crossing(&hopf), Some(BifurcationType::Hopf));
        assert_eq!(before.crossing(&neutral), Some(BifurcationType::NeutralSaddle));
        assert_eq!(before.crossing(&before), None);
    }

    #[test]
    fn fold_takes_priority() {
        let before = TestFunctionValues::equilibrium(1.0, 1.0, 1.0);
        let after = TestFunctionValues::equilibrium(-1.0, -1.0, 1.0);
        assert_eq!(before.crossing(&after), Some(BifurcationType::Fold));
    }

    #[test]
    fn neutral_saddle_ignores_complex_pair_turning_real() {
        let focus = TestFunctionValues::equilibrium(1.0, -2.0, 1.0);
        let node = TestFunctionValues::equilibrium(1.0, -2.0, -2.0).with_real_eigenvalues(2);
        assert_eq!(focus.crossing(&node), None);

        let saddle = TestFunctionValues::equilibrium(-1.0, 0.5, 0.5).with_real_eigenvalues(2);
        let node = TestFunctionValues::equilibrium(-1.0, 0.5, -0.5).with_real_eigenvalues(2);
        assert_eq!(saddle.crossing(&node), Some(BifurcationType::NeutralSaddle));
    }

    #[test]
    fn neimark_sacker_requires_complex_pair_on_both_sides() {
        let complex = TestFunctionValues::limit_cycle(1.0, 1.0, -0.9).with_complex_pairs(1);
        let real = TestFunctionValues::limit_cycle(1.0, 1.0, 1.0);
        assert_eq!(complex.crossing(&real), None);

        let outside = TestFunctionValues::limit_cycle(1.0, 1.0, 0.2).with_complex_pairs(1);
        assert_eq!(complex.crossing(&outside), Some(BifurcationType::NeimarkSacker));
    }

    #[test]
    fn cycle_tests_never_flag_equilibrium_kinds() {
        let before = TestFunctionValues::limit_cycle(-0.5, 1.0, 1.0);
        let after = TestFunctionValues::limit_cycle(-0.5, -0.1, 1.0);
        assert_eq!(before.crossing(&after), Some(BifurcationType::PeriodDoubling));
        assert_eq!(before.value_for(BifurcationType::Hopf), 1.0);
    }
}
