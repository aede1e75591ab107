use crate::integrator::SolverConfig;
use crate::lyapunov::{analyze, LyapunovConfig, LyapunovResult};
use crate::traits::DynamicalSystem;
use anyhow::{bail, Context, Result};
use log::{info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Values taken by one parameter across a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterAxis {
    pub index: usize,
    pub values: Vec<f64>,
}

impl ParameterAxis {
    pub fn new(index: usize, values: Vec<f64>) -> Self {
        Self { index, values }
    }

    /// `count` evenly spaced values from `start` to `end` inclusive.
    pub fn linspace(index: usize, start: f64, end: f64, count: usize) -> Self {
        let values = match count {
            0 => Vec::new(),
            1 => vec![start],
            _ => {
                let step = (end - start) / (count - 1) as f64;
                (0..count).map(|i| start + step * i as f64).collect()
            }
        };
        Self { index, values }
    }
}

/// Cartesian product of parameter axes over a base parameter vector.
/// Points are enumerated row-major: the last axis varies fastest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGrid {
    base: Vec<f64>,
    axes: Vec<ParameterAxis>,
}

impl ParameterGrid {
    pub fn new(base: Vec<f64>, axes: Vec<ParameterAxis>) -> Result<Self> {
        if axes.is_empty() {
            bail!("Parameter grid needs at least one axis.");
        }
        for (position, axis) in axes.iter().enumerate() {
            if axis.index >= base.len() {
                bail!(
                    "Axis {} targets parameter {} but only {} parameters exist.",
                    position,
                    axis.index,
                    base.len()
                );
            }
            if axis.values.is_empty() {
                bail!("Axis {} has no values.", position);
            }
            if axes[..position].iter().any(|other| other.index == axis.index) {
                bail!("Parameter {} appears on more than one axis.", axis.index);
            }
        }
        Ok(Self { base, axes })
    }

    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(|axis| axis.values.len()).collect()
    }

    pub fn len(&self) -> usize {
        self.axes.iter().map(|axis| axis.values.len()).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn axes(&self) -> &[ParameterAxis] {
        &self.axes
    }

    /// Full parameter vector at row-major position `flat`.
    pub fn point(&self, flat: usize) -> Vec<f64> {
        let mut params = self.base.clone();
        let mut remainder = flat;
        for axis in self.axes.iter().rev() {
            let count = axis.values.len();
            params[axis.index] = axis.values[remainder % count];
            remainder /= count;
        }
        params
    }

    /// Row-major position of a multi-index, if it lies inside the grid.
    pub fn flat_index(&self, indices: &[usize]) -> Option<usize> {
        if indices.len() != self.axes.len() {
            return None;
        }
        let mut flat = 0;
        for (axis, &i) in self.axes.iter().zip(indices) {
            if i >= axis.values.len() {
                return None;
            }
            flat = flat * axis.values.len() + i;
        }
        Some(flat)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepOptions {
    /// Size of a dedicated worker pool; the global rayon pool when unset.
    pub threads: Option<usize>,
}

impl SweepOptions {
    pub fn validate(&self) -> Result<()> {
        if self.threads == Some(0) {
            bail!("Sweep thread count must be positive.");
        }
        Ok(())
    }
}

/// Cooperative cancellation flag shared between a caller and a running sweep.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PointOutcome<T> {
    Completed(T),
    Failed(String),
    Cancelled,
}

impl<T> PointOutcome<T> {
    pub fn completed(&self) -> Option<&T> {
        match self {
            PointOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Outcomes aligned with the grid's row-major enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult<T> {
    pub shape: Vec<usize>,
    pub parameters: Vec<Vec<f64>>,
    pub outcomes: Vec<PointOutcome<T>>,
}

impl<T> SweepResult<T> {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.completed().is_some()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.outcomes.iter().enumerate().filter_map(|(i, o)| match o {
            PointOutcome::Failed(message) => Some((i, message.as_str())),
            _ => None,
        })
    }
}

/// Evaluates `compute` at every grid point in parallel.
///
/// Each worker clones its own copy of `system`. A point's error is recorded
/// as `PointOutcome::Failed` and does not stop other points; points not yet
/// started when `cancel` fires are marked `Cancelled`.
pub fn run_sweep<S, T, F>(
    system: &S,
    grid: &ParameterGrid,
    options: &SweepOptions,
    cancel: &CancellationToken,
    compute: F,
) -> Result<SweepResult<T>>
where
    S: DynamicalSystem + Clone + Send + Sync,
    T: Send,
    F: Fn(&S, &[f64]) -> Result<T> + Send + Sync,
{
    options.validate()?;
    let parameters: Vec<Vec<f64>> = (0..grid.len()).map(|i| grid.point(i)).collect();

    let evaluate = || -> Vec<PointOutcome<T>> {
        parameters
            .par_iter()
            .enumerate()
            .map_init(
                || system.clone(),
                |local, (index, params)| {
                    if cancel.is_cancelled() {
                        return PointOutcome::Cancelled;
                    }
                    match compute(local, params) {
                        Ok(value) => PointOutcome::Completed(value),
                        Err(err) => {
                            warn!("Sweep point {index} ({params:?}) failed: {err:#}");
                            PointOutcome::Failed(format!("{err:#}"))
                        }
                    }
                },
            )
            .collect()
    };

    let outcomes = match options.threads {
        Some(threads) => ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .context("Failed to build sweep thread pool")?
            .install(evaluate),
        None => evaluate(),
    };

    let result = SweepResult {
        shape: grid.shape(),
        parameters,
        outcomes,
    };
    info!(
        "Sweep finished: {} of {} points completed",
        result.completed_count(),
        result.len()
    );
    Ok(result)
}

/// Lyapunov spectrum and Kaplan-Yorke dimension at every grid point, each
/// started from `initial_state`.
#[allow(clippy::too_many_arguments)]
pub fn lyapunov_sweep<S>(
    system: &S,
    grid: &ParameterGrid,
    initial_state: &[f64],
    config: &LyapunovConfig,
    solver: &SolverConfig,
    options: &SweepOptions,
    cancel: &CancellationToken,
) -> Result<SweepResult<LyapunovResult>>
where
    S: DynamicalSystem + Clone + Send + Sync,
{
    config.validate()?;
    run_sweep(system, grid, options, cancel, |local, params| {
        analyze(local, params, initial_state, config, solver)
    })
}
