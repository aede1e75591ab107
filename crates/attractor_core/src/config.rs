use crate::continuation::{CollocationConfig, ContinuationConfig};
use crate::integrator::SolverConfig;
use crate::lyapunov::LyapunovConfig;
use crate::sweep::SweepOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// All tunable settings of an analysis run, one table per component.
///
/// ```toml
/// [solver]
/// abs_tol = 1e-10
///
/// [lyapunov]
/// Ttr = 50.0
/// N = 500
///
/// [collocation]
/// M = 40
/// d = 4
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub solver: SolverConfig,
    pub lyapunov: LyapunovConfig,
    pub continuation: ContinuationConfig,
    pub collocation: CollocationConfig,
    pub sweep: SweepOptions,
}

impl AnalysisConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Failed to parse analysis config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).context("Failed to serialize analysis config")
    }

    pub fn validate(&self) -> Result<()> {
        self.solver.validate().context("[solver]")?;
        self.lyapunov.validate().context("[lyapunov]")?;
        self.continuation.validate().context("[continuation]")?;
        self.collocation.validate().context("[collocation]")?;
        self.sweep.validate().context("[sweep]")?;
        Ok(())
    }
}
