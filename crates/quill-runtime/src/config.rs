//! Engine configuration.
//!
//! Durations are written as human-readable strings ("30s", "2m", "750ms").

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use quill_core::ConfigurationError;

use crate::recorder::RecorderConfig;
use crate::resilience::CircuitBreakerConfig;

/// Runtime settings shared by every run of an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout for a single backend invocation
    #[serde(with = "duration_str")]
    pub backend_timeout: Duration,

    /// Per-backend overrides of `backend_timeout`
    #[serde(with = "duration_map")]
    pub backend_timeouts: BTreeMap<String, Duration>,

    /// Wall-clock limit for a whole run
    #[serde(with = "duration_str")]
    pub run_timeout: Duration,

    /// Backend invocations allowed per run, regeneration included
    pub max_attempts: usize,

    /// Optional ceiling on tokens emitted per run
    pub token_budget: Option<u32>,

    pub circuit_breaker: CircuitBreakerConfig,

    pub recorder: RecorderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend_timeout: Duration::from_secs(30),
            backend_timeouts: BTreeMap::new(),
            run_timeout: Duration::from_secs(120),
            max_attempts: 4,
            token_budget: None,
            circuit_breaker: CircuitBreakerConfig::default(),
            recorder: RecorderConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigurationError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Invocation timeout for a backend.
    pub fn timeout_for(&self, backend_id: &str) -> Duration {
        self.backend_timeouts
            .get(backend_id)
            .copied()
            .unwrap_or(self.backend_timeout)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.backend_timeout.is_zero() {
            return Err(ConfigurationError::Invalid(
                "backend_timeout must be positive".to_string(),
            ));
        }
        if let Some((id, _)) = self.backend_timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(ConfigurationError::Invalid(format!(
                "timeout for backend '{}' must be positive",
                id
            )));
        }
        if self.run_timeout.is_zero() {
            return Err(ConfigurationError::Invalid(
                "run_timeout must be positive".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigurationError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.token_budget == Some(0) {
            return Err(ConfigurationError::Invalid(
                "token_budget must be positive when set".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0
            || self.circuit_breaker.success_threshold == 0
        {
            return Err(ConfigurationError::Invalid(
                "circuit breaker thresholds must be at least 1".to_string(),
            ));
        }
        if self.recorder.history_limit == 0 {
            return Err(ConfigurationError::Invalid(
                "recorder.history_limit must be at least 1".to_string(),
            ));
        }
        if self.recorder.write_timeout.is_zero() {
            return Err(ConfigurationError::Invalid(
                "recorder.write_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helper for a `Duration` written as a humantime string.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

/// Serde helper for a map of humantime strings.
pub(crate) mod duration_map {
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub fn serialize<S>(map: &BTreeMap<String, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, duration) in map {
            out.serialize_entry(key, &humantime::format_duration(*duration).to_string())?;
        }
        out.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, text)| {
                humantime::parse_duration(&text)
                    .map(|duration| (key, duration))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
