use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hamming::DistanceMetric;
use crate::minimizer::MinimizerConfig;
use crate::oracle::{CommandOracleConfig, InputDelivery};

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    Stdin,
    TempFile,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigMetric {
    #[default]
    Bytewise,
    Bitwise,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub crash_exit_codes: Vec<i32>,
    pub working_dir: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_retries() -> u32 {
    3
}

impl OracleSettings {
    pub fn to_oracle_config(&self) -> CommandOracleConfig {
        CommandOracleConfig {
            command: self.command.clone(),
            input_delivery: match self.input_delivery {
                ConfigInputDelivery::Stdin => InputDelivery::Stdin,
                ConfigInputDelivery::TempFile => InputDelivery::TempFile,
            },
            timeout: Duration::from_millis(self.timeout_ms),
            retries: self.retries,
            crash_exit_codes: self.crash_exit_codes.clone(),
            working_dir: self.working_dir.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MinimizerSettings {
    #[serde(default)]
    pub metric: ConfigMetric,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Wall-clock budget for one run; 0 disables the budget.
    #[serde(default = "default_max_time_ms")]
    pub max_time_ms: u64,
    #[serde(default = "default_max_other_crashes")]
    pub max_other_crashes: usize,
    #[serde(default = "default_ambiguous_tiebreak")]
    pub ambiguous_tiebreak: bool,
    /// Fixed rng seed for reproducible runs; absent means entropy.
    pub rng_seed: Option<u64>,
}

fn default_confidence() -> f64 {
    0.999
}

fn default_max_time_ms() -> u64 {
    3_600_000
}

fn default_max_other_crashes() -> usize {
    20
}

fn default_ambiguous_tiebreak() -> bool {
    true
}

impl Default for MinimizerSettings {
    fn default() -> Self {
        Self {
            metric: ConfigMetric::default(),
            confidence: default_confidence(),
            max_time_ms: default_max_time_ms(),
            max_other_crashes: default_max_other_crashes(),
            ambiguous_tiebreak: default_ambiguous_tiebreak(),
            rng_seed: None,
        }
    }
}

impl MinimizerSettings {
    pub fn to_minimizer_config(&self) -> MinimizerConfig {
        MinimizerConfig {
            metric: match self.metric {
                ConfigMetric::Bytewise => DistanceMetric::Bytewise,
                ConfigMetric::Bitwise => DistanceMetric::Bitwise,
            },
            confidence: self.confidence,
            max_time: (self.max_time_ms > 0).then(|| Duration::from_millis(self.max_time_ms)),
            max_other_crashes: self.max_other_crashes,
            ambiguous_tiebreak: self.ambiguous_tiebreak,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct WhittleConfig {
    pub oracle: OracleSettings,
    #[serde(default)]
    pub minimizer: MinimizerSettings,
}

impl WhittleConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: WhittleConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
