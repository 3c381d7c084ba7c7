//! Configuration file handling.
//!
//! Settings come from an optional `funnel-dashboard.toml`; command-line flags
//! are layered on top in `main.rs`.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "funnel-dashboard.toml";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid stage list: {0}")]
    InvalidStages(String),
    #[error("z-score threshold must be a positive finite number, got {0}")]
    InvalidThreshold(f64),
    #[error("control and test cohort labels must differ (both are \"{0}\")")]
    SameCohortLabels(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub analyzer: AnalyzerSettings,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Which daily value the anomaly detector scores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyMetric {
    /// Sum of every stage count on the day.
    #[default]
    TotalCount,
    /// Last-stage count over first-stage count on the day.
    OverallConversion,
}

impl AnomalyMetric {
    pub fn label(self) -> &'static str {
        match self {
            AnomalyMetric::TotalCount => "total_count",
            AnomalyMetric::OverallConversion => "overall_conversion",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerSettings {
    /// Funnel stages, in order.
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,

    #[serde(default = "default_control_label")]
    pub control_label: String,

    #[serde(default = "default_test_label")]
    pub test_label: String,

    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,

    #[serde(default)]
    pub anomaly_metric: AnomalyMetric,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            control_label: default_control_label(),
            test_label: default_test_label(),
            z_threshold: default_z_threshold(),
            anomaly_metric: AnomalyMetric::default(),
        }
    }
}

fn default_stages() -> Vec<String> {
    ["impression", "click", "apply", "approve"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_control_label() -> String {
    "control".to_string()
}

fn default_test_label() -> String {
    "test".to_string()
}

fn default_z_threshold() -> f64 {
    2.0
}

impl AnalyzerSettings {
    /// Lower-cases labels and stage names so they match normalized CSV values,
    /// then checks the invariants the analyzer relies on.
    pub fn normalized(mut self) -> Result<Self, ConfigError> {
        self.stages = self
            .stages
            .iter()
            .map(|stage| stage.trim().to_lowercase())
            .collect();
        self.control_label = self.control_label.trim().to_lowercase();
        self.test_label = self.test_label.trim().to_lowercase();
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::InvalidStages(
                "at least one stage is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.is_empty() {
                return Err(ConfigError::InvalidStages(
                    "stage names must not be blank".to_string(),
                ));
            }
            if !seen.insert(stage.as_str()) {
                return Err(ConfigError::InvalidStages(format!(
                    "stage \"{stage}\" appears more than once"
                )));
            }
        }
        if !self.z_threshold.is_finite() || self.z_threshold <= 0.0 {
            return Err(ConfigError::InvalidThreshold(self.z_threshold));
        }
        if self.control_label == self.test_label {
            return Err(ConfigError::SameCohortLabels(self.control_label.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Largest accepted upload body, in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Loads `path` when given, otherwise the default file if it exists,
    /// otherwise built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn default_toml() -> anyhow::Result<String> {
        toml::to_string_pretty(&AppConfig::default()).context("failed to serialize default config")
    }
}
