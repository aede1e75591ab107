//! Core types for continuation analysis.
//!
//! This module contains the data structures shared by the equilibrium and
//! periodic-orbit continuation problems.

use crate::integrator::Trajectory;
use anyhow::{bail, Result};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// Settings controlling the pseudo-arclength continuation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationConfig {
    pub p_min: f64,
    pub p_max: f64,
    /// Initial arclength step.
    pub ds: f64,
    pub ds_min: f64,
    pub ds_max: f64,
    /// Number of points added after the starting point.
    pub max_steps: usize,
    /// Residual norm accepted by the corrector.
    pub newton_tol: f64,
    pub max_newton_iters: usize,
    /// Size of the last Newton update accepted by the corrector.
    pub step_tol: f64,
    /// Step growth factor after a successful correction.
    pub growth: f64,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            p_min: f64::NEG_INFINITY,
            p_max: f64::INFINITY,
            ds: 0.01,
            ds_min: 1e-5,
            ds_max: 0.1,
            max_steps: 100,
            newton_tol: 1e-9,
            max_newton_iters: 10,
            step_tol: 1e-7,
            growth: 1.5,
        }
    }
}

impl ContinuationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.p_min < self.p_max) {
            bail!(
                "Parameter bounds must satisfy p_min < p_max (got {} and {})",
                self.p_min,
                self.p_max
            );
        }
        if !(self.ds_min > 0.0) || !(self.ds_min <= self.ds) || !(self.ds <= self.ds_max) {
            bail!(
                "Step sizes must satisfy 0 < ds_min <= ds <= ds_max (got {}, {}, {})",
                self.ds_min,
                self.ds,
                self.ds_max
            );
        }
        if self.max_steps == 0 {
            bail!("max_steps must be at least 1");
        }
        if !(self.newton_tol > 0.0) || !(self.step_tol > 0.0) {
            bail!("Corrector tolerances must be positive");
        }
        if self.max_newton_iters == 0 {
            bail!("max_newton_iters must be at least 1");
        }
        if !(self.growth >= 1.0) {
            bail!("Step growth factor must be at least 1 (got {})", self.growth);
        }
        Ok(())
    }

    pub fn contains(&self, param: f64) -> bool {
        param >= self.p_min && param <= self.p_max
    }
}

/// Classification of bifurcation types detected during continuation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BifurcationType {
    #[default]
    None,
    Fold,
    Hopf,
    NeutralSaddle,
    CycleFold,
    PeriodDoubling,
    NeimarkSacker,
}

/// Time-stamped profile of a periodic orbit at one branch point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbitRecord {
    pub period: f64,
    pub trajectory: Trajectory,
}

/// A single point on a continuation branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationPoint {
    /// Equilibrium state, or the flattened collocation unknowns
    /// (mesh states, stage states, period) for a limit cycle.
    pub state: Vec<f64>,
    pub param_value: f64,
    /// Unit branch tangent in `[p, state]` coordinates.
    #[serde(default)]
    pub tangent: Vec<f64>,
    pub stable: bool,
    pub stability: BifurcationType,
    /// Jacobian eigenvalues (equilibria) or Floquet multipliers (cycles).
    #[serde(default)]
    pub eigenvalues: Vec<Complex<f64>>,
    #[serde(default)]
    pub orbit: Option<OrbitRecord>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SpecialPoint {
    pub kind: BifurcationType,
    /// Index into `ContinuationBranch::points`.
    pub index: usize,
}

/// Type of continuation branch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type")]
pub enum BranchType {
    #[default]
    Equilibrium,
    LimitCycle {
        mesh_intervals: usize,
        degree: usize,
    },
}

/// Why a branch stopped growing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TerminationReason {
    MaxSteps,
    ParameterBounds,
    CorrectorFailure,
}

/// A complete continuation branch containing multiple points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationBranch {
    pub points: Vec<ContinuationPoint>,
    pub special_points: Vec<SpecialPoint>,
    pub branch_type: BranchType,
    pub termination: TerminationReason,
}

impl ContinuationBranch {
    pub fn new(branch_type: BranchType) -> Self {
        Self {
            points: Vec::new(),
            special_points: Vec::new(),
            branch_type,
            termination: TerminationReason::MaxSteps,
        }
    }

    pub(crate) fn push(&mut self, point: ContinuationPoint) {
        if point.stability != BifurcationType::None {
            self.special_points.push(SpecialPoint {
                kind: point.stability,
                index: self.points.len(),
            });
        }
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Points tagged with the given bifurcation type.
    pub fn special_points_of(
        &self,
        kind: BifurcationType,
    ) -> impl Iterator<Item = &ContinuationPoint> + '_ {
        self.special_points
            .iter()
            .filter(move |sp| sp.kind == kind)
            .map(move |sp| &self.points[sp.index])
    }
}
