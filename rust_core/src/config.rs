//! Sampler configuration, constructible in code or loaded from TOML.

use crate::error::{Error, Result};
use crate::hmc::HmcConfig;
use crate::nuts::NutsConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Gradient-based kernel used for variables without a conjugate update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradientKernel {
    #[default]
    Nuts,
    Hmc,
}

/// Configuration for the posterior sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub num_chains: usize,
    /// Retained draws per chain, after burn-in and thinning.
    pub num_samples: usize,
    /// Sweeps discarded at the start of each chain. Adaptation runs here.
    pub burn_in: usize,
    pub thin: usize,
    pub seed: u64,
    /// Number of threads. 0 means use Rayon's default (all cores).
    pub num_threads: usize,
    pub nonconjugate_kernel: GradientKernel,
    /// Gradient-kernel transitions per Gibbs sweep.
    pub inner_steps: usize,
    pub nuts: NutsConfig,
    pub hmc: HmcConfig,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_chains: 1,
            num_samples: 1000,
            burn_in: 200,
            thin: 1,
            seed: 42,
            num_threads: 0,
            nonconjugate_kernel: GradientKernel::Nuts,
            inner_steps: 1,
            nuts: NutsConfig::default(),
            hmc: HmcConfig::default(),
        }
    }
}

impl SamplerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: SamplerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_chains == 0 {
            return Err(Error::Validation("num_chains must be at least 1".to_string()));
        }
        if self.num_samples == 0 {
            return Err(Error::Validation("num_samples must be at least 1".to_string()));
        }
        if self.thin == 0 {
            return Err(Error::Validation("thin must be at least 1".to_string()));
        }
        if self.inner_steps == 0 {
            return Err(Error::Validation("inner_steps must be at least 1".to_string()));
        }
        self.nuts.validate()?;
        self.hmc.validate()?;
        Ok(())
    }

    /// Total sweeps per chain.
    pub fn num_sweeps(&self) -> usize {
        self.burn_in + self.num_samples * self.thin
    }
}
