//! Pipeline configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is valid:
//!
//! ```toml
//! [upstream]
//! base_url = "https://olinda.bcb.gov.br/olinda/servico/IFDATA/versao/v1/odata"
//! registry_page_size = 5000
//!
//! [upstream.timeouts]
//! connect_secs = 10.0
//! read_secs = 120.0
//!
//! [upstream.retry]
//! max_attempts = 5
//!
//! [ingest]
//! entity_type = 1
//! reports = ["1", "4", "5"]
//! page_sizes = [5000, 2000, 1000, 500]
//! batch_size = 10000
//!
//! [storage]
//! data_dir = "data"
//! checkpoint_dir = "data/checkpoints"
//!
//! [classifier]
//! rules_file = "rules.toml"
//! ```

use crate::data::ingest::IngestConfig;
use crate::data::retry::RetryPolicy;
use crate::data::transport::TimeoutTiers;
use crate::data::upstream::DEFAULT_BASE_URL;
use crate::semantic::rules::{RuleError, RuleSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeouts: TimeoutTiers,
    pub retry: RetryPolicy,
    /// Page size for registry scans.
    pub registry_page_size: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeouts: TimeoutTiers::default(),
            retry: RetryPolicy::default(),
            registry_page_size: 5000,
        }
    }
}

/// Latest-period detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    pub sample_report: String,
    pub entity_types: Vec<u32>,
    pub quarters: usize,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            sample_report: "1".into(),
            entity_types: vec![1, 2, 3, 4],
            quarters: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            checkpoint_dir: PathBuf::from("data/checkpoints"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Alternate rule table; the embedded one is used when absent.
    pub rules_file: Option<PathBuf>,
}

impl ClassifierConfig {
    pub fn load_rules(&self) -> Result<RuleSet, RuleError> {
        match &self.rules_file {
            Some(path) => RuleSet::from_file(path),
            None => RuleSet::builtin(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub upstream: UpstreamConfig,
    pub detect: DetectConfig,
    pub ingest: IngestConfig,
    pub storage: StorageConfig,
    pub classifier: ClassifierConfig,
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.upstream.base_url.trim().is_empty() {
            return invalid("upstream.base_url is empty");
        }
        if self.upstream.timeouts.read_secs <= 0.0 || self.upstream.timeouts.connect_secs <= 0.0 {
            return invalid("upstream.timeouts must be positive");
        }
        if self.upstream.retry.jitter_min < 0.0 || self.upstream.retry.jitter_max < self.upstream.retry.jitter_min {
            return invalid("upstream.retry jitter range is inverted or negative");
        }
        if self.ingest.reports.iter().all(|r| r.trim().is_empty()) {
            return invalid("ingest.reports is empty");
        }
        if self.ingest.page_sizes.is_empty() || self.ingest.page_sizes.contains(&0) {
            return invalid("ingest.page_sizes must be non-empty and positive");
        }
        if self.ingest.batch_size == 0 {
            return invalid("ingest.batch_size must be positive");
        }
        Ok(())
    }
}
