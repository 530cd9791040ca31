use crate::centroid_init::InitStrategy;
use crate::error::{Error, Result};
use crate::utils::default_worker_count;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Tunables for one clustering run.
///
/// Every field has a default, so a YAML file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Iteration cap (default: 100).
    pub max_iter: usize,

    /// Convergence threshold on the mean centroid movement (default: 1e-4).
    pub epsilon: f64,

    /// Seed for initialization, normalization sampling and empty-cluster reseeding.
    pub seed: u64,

    /// Number of map tasks per iteration and of pool threads
    /// (default: host parallelism clamped to `[2, 8]`).
    pub worker_count: usize,

    pub init: InitStrategy,

    /// Compute normalization bounds from a seeded sample of this many points
    /// instead of the whole dataset.
    pub normalization_sample: Option<usize>,

    /// Rerun on the calling thread if the parallel run fails.
    pub fallback_to_inline: bool,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            max_iter: 100,
            epsilon: 1e-4,
            seed: 42,
            worker_count: default_worker_count(),
            init: InitStrategy::Random,
            normalization_sample: None,
            fallback_to_inline: true,
        }
    }
}

impl ClusteringConfig {
    /// Load config from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: ClusteringConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(Error::InvalidConfig("max_iter must be > 0".into()));
        }
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(Error::InvalidConfig(
                "epsilon must be a finite value >= 0".into(),
            ));
        }
        if self.worker_count == 0 {
            return Err(Error::InvalidConfig("worker_count must be > 0".into()));
        }
        if self.normalization_sample == Some(0) {
            return Err(Error::InvalidConfig(
                "normalization_sample must be > 0 when set".into(),
            ));
        }
        Ok(())
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_init(mut self, init: InitStrategy) -> Self {
        self.init = init;
        self
    }

    pub fn with_normalization_sample(mut self, sample: Option<usize>) -> Self {
        self.normalization_sample = sample;
        self
    }

    pub fn with_fallback_to_inline(mut self, fallback: bool) -> Self {
        self.fallback_to_inline = fallback;
        self
    }
}
