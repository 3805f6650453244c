//! Engine and cluster configuration
//!
//! Both sections can be loaded from one TOML file:
//!
//! ```toml
//! [engine]
//! bin_dir = "/opt/tinker/bin"
//! forcefield = "/opt/tinker/params/amber99.prm"
//! refinement = "annealing"
//!
//! [cluster]
//! failure_rate = 0.1
//! timeout_secs = 7200
//! native_spec = "-q all.q"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use foldrun_batch::GridEngine;

use crate::stage::EngineProgram;

/// Largest seed accepted by the embedding engine (exclusive).
pub const MAX_SEED: u64 = 2_000_000_000;

/// Relative slack absorbing the rounding error of `f * N`.
const PRODUCT_TOLERANCE: f64 = 4.0 * f64::EPSILON;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Refinement performed after embedding.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Refinement {
    /// Simulated annealing (slow, better models).
    #[default]
    Annealing,
    /// Plain minimization ("fast" mode).
    Minimization,
}

impl Refinement {
    /// Flag passed as last embedding argument.
    pub fn flag(&self) -> &'static str {
        match self {
            Refinement::Annealing => "A",
            Refinement::Minimization => "M",
        }
    }
}

/// Fixed embedding answers preceding the refinement flag.
const EMBED_ANSWERS: [&str; 6] = ["Y", "N", "Y", "Y", "N", "N"];

/// Location and behaviour of the external engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the engine programs.
    pub bin_dir: PathBuf,

    /// Force-field parameter file passed to every program.
    pub forcefield: PathBuf,

    pub refinement: Refinement,

    /// Attempts when waiting for an engine output file.
    pub probe_retries: u32,

    /// Delay between output probes (milliseconds).
    pub probe_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("/usr/local/tinker/bin"),
            forcefield: PathBuf::from("/usr/local/tinker/params/amber99.prm"),
            refinement: Refinement::Annealing,
            probe_retries: 10,
            probe_delay_ms: 2000,
        }
    }
}

impl EngineConfig {
    pub fn program(&self, program: EngineProgram) -> PathBuf {
        program.path_in(&self.bin_dir)
    }

    /// Embedding arguments following the xyz file and model count.
    pub fn embed_flags(&self) -> Vec<String> {
        EMBED_ANSWERS
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(self.refinement.flag().to_string()))
            .collect()
    }

    /// Check that the binary directory is readable and holds the embedding program.
    pub fn preflight(&self) -> Result<(), ConfigError> {
        std::fs::read_dir(&self.bin_dir).map_err(|source| ConfigError::Read {
            path: self.bin_dir.clone(),
            source,
        })?;
        let distgeom = self.program(EngineProgram::Distgeom);
        if !distgeom.is_file() {
            return Err(ConfigError::Invalid(format!(
                "embedding program {} not found",
                distgeom.display()
            )));
        }
        Ok(())
    }
}

/// Parameters of the cluster fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Tolerated fraction of failed jobs; also the over-provisioning factor.
    pub failure_rate: f64,

    /// Global polling timeout (seconds).
    pub timeout_secs: u64,

    pub poll_interval_ms: u64,

    /// Attempts when waiting for a job's output to become visible.
    pub output_retries: u32,

    pub output_retry_ms: u64,

    /// Prefix of remote job names.
    pub job_prefix: String,

    /// Scheduler resource selector.
    pub native_spec: String,

    /// Seed for the per-job random seeds; entropy when unset.
    pub seed: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.1,
            timeout_secs: 7200,
            poll_interval_ms: 2000,
            output_retries: 10,
            output_retry_ms: 2000,
            job_prefix: "RC_".to_string(),
            native_spec: "-q all.q".to_string(),
            seed: None,
        }
    }
}

impl ClusterConfig {
    /// Number of jobs submitted for `models` models: `ceil((1+f)*N)`.
    pub fn job_count(&self, models: usize) -> usize {
        let extra = (self.failure_rate * models as f64 * (1.0 - PRODUCT_TOLERANCE)).ceil();
        models + extra as usize
    }

    /// Failures tolerated for `models` models: `floor(f*N)`.
    pub fn failure_budget(&self, models: usize) -> usize {
        (self.failure_rate * models as f64 * (1.0 + PRODUCT_TOLERANCE)).floor() as usize
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.failure_rate) {
            return Err(ConfigError::Invalid(format!(
                "failure_rate must be in [0, 1), got {}",
                self.failure_rate
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FoldrunConfig {
    pub engine: EngineConfig,
    pub cluster: ClusterConfig,
    pub grid_engine: GridEngine,
}

impl FoldrunConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: FoldrunConfig = toml::from_str(s)?;
        config.cluster.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_count_and_budget() {
        // (models, failure rate, jobs, budget)
        let cases = [
            (10, 0.1, 11, 1),
            (1, 0.1, 2, 0),
            (40, 0.1, 44, 4),
            (3, 0.1, 4, 0),
            (3, 0.5, 5, 1),
            (10, 0.7, 17, 7),
            (100, 0.29, 129, 29),
            (7, 0.0, 7, 0),
            (1, 1e-10, 2, 0),
            (1_000_000, 1e-10, 1_000_001, 0),
            (4, 0.999, 8, 3),
        ];
        for (models, failure_rate, jobs, budget) in cases {
            let cfg = ClusterConfig {
                failure_rate,
                ..ClusterConfig::default()
            };
            assert_eq!(cfg.job_count(models), jobs, "job_count({models}) at f={failure_rate}");
            assert_eq!(
                cfg.failure_budget(models),
                budget,
                "failure_budget({models}) at f={failure_rate}"
            );
        }
    }

    #[test]
    fn test_embed_flags() {
        let mut cfg = EngineConfig::default();
        assert_eq!(cfg.embed_flags(), ["Y", "N", "Y", "Y", "N", "N", "A"]);
        cfg.refinement = Refinement::Minimization;
        assert_eq!(cfg.embed_flags().last().map(String::as_str), Some("M"));
    }

    #[test]
    fn test_load_partial_toml() {
        let cfg = FoldrunConfig::from_toml_str(
            r#"
            [engine]
            bin_dir = "/opt/tinker/bin"
            refinement = "minimization"

            [cluster]
            failure_rate = 0.2
            seed = 42
            "#,
        )
        .unwrap();

        assert_eq!(cfg.engine.bin_dir, PathBuf::from("/opt/tinker/bin"));
        assert_eq!(cfg.engine.refinement, Refinement::Minimization);
        assert_eq!(cfg.engine.probe_retries, 10);
        assert_eq!(cfg.cluster.failure_rate, 0.2);
        assert_eq!(cfg.cluster.seed, Some(42));
        assert_eq!(cfg.cluster.job_prefix, "RC_");
        assert_eq!(cfg.grid_engine, GridEngine::default());
    }

    #[test]
    fn test_invalid_failure_rate_rejected() {
        let err = FoldrunConfig::from_toml_str("[cluster]\nfailure_rate = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_preflight_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig {
            bin_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.preflight(), Err(ConfigError::Invalid(_))));

        std::fs::write(dir.path().join("distgeom"), "").unwrap();
        cfg.preflight().unwrap();
    }
}
