use std::path::{Path, PathBuf};
use std::time::Duration;

use duration_string::DurationString;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::readiness_gate::GateKind;
use crate::reconciler::condition::MissingConditionPolicy;

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("errorBackoff.initial must not be zero or exceed errorBackoff.max")]
    InvalidErrorBackoff,
}

/// Settings of the long-running Pod-condition reconciler.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerConfig {
    /// Watch a single namespace instead of the whole cluster.
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub error_backoff: ErrorBackoffConfig,

    #[serde(default)]
    pub bootstrap: GateConfig,

    #[serde(default)]
    pub post_provision: GateConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErrorBackoffConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_error_backoff_initial"
    )]
    pub initial: Duration,

    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_error_backoff_max"
    )]
    pub max: Duration,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GateConfig {
    #[serde(default)]
    pub missing_condition: MissingConditionPolicy,

    /// Used by [`MissingConditionPolicy::RequeueUntilComplete`].
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_requeue_interval"
    )]
    pub requeue_interval: Duration,
}

impl Default for ErrorBackoffConfig {
    fn default() -> Self {
        Self {
            initial: default_error_backoff_initial(),
            max: default_error_backoff_max(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            missing_condition: MissingConditionPolicy::default(),
            requeue_interval: default_requeue_interval(),
        }
    }
}

const fn default_error_backoff_initial() -> Duration {
    Duration::from_secs(5)
}
const fn default_error_backoff_max() -> Duration {
    Duration::from_secs(300)
}
const fn default_requeue_interval() -> Duration {
    Duration::from_secs(10)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    DurationString::deserialize(deserializer).map(Duration::from)
}

impl ReconcilerConfig {
    /// Loads the config from `path`, or returns the defaults when there is none.
    pub async fn new_from_file(path: Option<&Path>) -> Result<Self, ConfigLoadError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigLoadError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::parse(&content).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        // an empty document deserializes as unit, not as an empty map
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.error_backoff.initial.is_zero() || self.error_backoff.initial > self.error_backoff.max
        {
            return Err(ConfigLoadError::InvalidErrorBackoff);
        }
        Ok(())
    }

    pub fn gate(&self, kind: GateKind) -> &GateConfig {
        match kind {
            GateKind::Bootstrap => &self.bootstrap,
            GateKind::PostProvision => &self.post_provision,
        }
    }
}
