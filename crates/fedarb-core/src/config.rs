//! # Arbitration Configuration
//!
//! The read-only configuration surface consumed by the arbitration
//! authority: suspicion weights, decision thresholds, and the time windows
//! that bound history and memory.
//!
//! Configuration is loaded from YAML (every field optional, durations in
//! milliseconds under an `_ms` key) and validated before use. A running
//! authority reads it through a [`ConfigHandle`], which can be swapped
//! atomically for hot reload; each arbitration call works from one
//! snapshot so a single decision never mixes two configurations.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Suspicion weights, thresholds, and time windows for arbitration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArbitrationConfig {
    /// Weight of a record in the weak tier (Pending, Reported2).
    pub weak_suspicion_level: i64,
    /// Weight of a record in the strong tier (Reported).
    pub strong_suspicion_level: i64,
    /// Weight of a record in the reject tier (Rejected).
    pub reject_suspicion_level: i64,
    /// Level at which a node without recent keep-alives is suspicious.
    pub suspicion_level_threshold: i64,
    /// Level at which a node with recent keep-alives is suspicious.
    pub keep_alive_suspicion_level_threshold: i64,
    /// Margin by which one side must exceed the other to be "clearly" more suspicious.
    pub suspicion_level_comparison_threshold: i64,
    /// Number of Reported records on one node at which the peers of those records escalate to Reported2.
    pub suspicion_report_threshold: usize,

    /// Age after which a record stops contributing suspicion.
    #[serde(rename = "record_suspicion_expire_interval_ms", with = "crate::temporal::serde_millis")]
    pub record_suspicion_expire_interval: Duration,
    /// How long a deferred grant waits before it is finalized.
    #[serde(rename = "delay_interval_ms", with = "crate::temporal::serde_millis")]
    pub delay_interval: Duration,
    /// Minimum spacing between retention sweeps.
    #[serde(rename = "cleanup_interval_ms", with = "crate::temporal::serde_millis")]
    pub cleanup_interval: Duration,
    /// Upper bound on one arbitration round trip.
    #[serde(rename = "max_arbitration_timeout_ms", with = "crate::temporal::serde_millis")]
    pub max_arbitration_timeout: Duration,
    /// Upper bound on a lease duration; also the liveness window.
    #[serde(rename = "max_lease_duration_ms", with = "crate::temporal::serde_millis")]
    pub max_lease_duration: Duration,
    /// Upper bound on the implicit lease heartbeat interval.
    #[serde(rename = "max_implicit_lease_interval_ms", with = "crate::temporal::serde_millis")]
    pub max_implicit_lease_interval: Duration,
    /// Wall-clock budget for one retention sweep.
    #[serde(rename = "compaction_budget_ms", with = "crate::temporal::serde_millis")]
    pub compaction_budget: Duration,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            weak_suspicion_level: 1,
            strong_suspicion_level: 3,
            reject_suspicion_level: 5,
            suspicion_level_threshold: 1,
            keep_alive_suspicion_level_threshold: 4,
            suspicion_level_comparison_threshold: 1,
            suspicion_report_threshold: 3,
            record_suspicion_expire_interval: Duration::from_secs(300),
            delay_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30),
            max_arbitration_timeout: Duration::from_secs(40),
            max_lease_duration: Duration::from_secs(40),
            max_implicit_lease_interval: Duration::from_secs(120),
            compaction_budget: Duration::from_millis(100),
        }
    }
}

impl ArbitrationConfig {
    /// Parse and validate a configuration from YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed YAML or unknown keys and
    /// [`ConfigError::InvalidValue`] if validation fails.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a configuration file.
    ///
    /// # Errors
    ///
    /// As [`from_yaml_str`](Self::from_yaml_str), plus [`ConfigError::Read`]
    /// if the file cannot be read.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Render as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if serialization fails.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check value ranges.
    ///
    /// The reject weight must be at least the strong weight: the staleness
    /// sweep moves old Rejected records back to Reported, and the cheap
    /// suspicion test assumes a sweep never raises a level.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("weak_suspicion_level", self.weak_suspicion_level),
            ("strong_suspicion_level", self.strong_suspicion_level),
            ("reject_suspicion_level", self.reject_suspicion_level),
            (
                "suspicion_level_comparison_threshold",
                self.suspicion_level_comparison_threshold,
            ),
        ] {
            if value < 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("must not be negative, got {value}"),
                });
            }
        }
        if self.reject_suspicion_level < self.strong_suspicion_level {
            return Err(ConfigError::InvalidValue {
                field: "reject_suspicion_level",
                reason: format!(
                    "must be at least strong_suspicion_level ({}), got {}",
                    self.strong_suspicion_level, self.reject_suspicion_level
                ),
            });
        }
        for (field, value) in [
            ("delay_interval_ms", self.delay_interval),
            ("cleanup_interval_ms", self.cleanup_interval),
            ("max_lease_duration_ms", self.max_lease_duration),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }

    /// Default history requirement for requests that do not state one.
    pub fn default_history_needed(&self) -> Duration {
        self.max_lease_duration + self.max_arbitration_timeout
    }
}

/// Shared, atomically swappable configuration.
///
/// Cloning the handle shares the underlying slot; a [`replace`](Self::replace)
/// through any clone is visible to all of them on their next
/// [`snapshot`](Self::snapshot).
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<ArbitrationConfig>>>,
}

impl ConfigHandle {
    /// Wrap a configuration. The value is assumed to be validated.
    pub fn new(config: ArbitrationConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// The configuration in effect right now.
    pub fn snapshot(&self) -> Arc<ArbitrationConfig> {
        Arc::clone(&self.current.read())
    }

    /// Validate and install a new configuration.
    ///
    /// # Errors
    ///
    /// Returns the validation error and leaves the current configuration
    /// in place.
    pub fn replace(&self, config: ArbitrationConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.current.write() = Arc::new(config);
        Ok(())
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(ArbitrationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ArbitrationConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = ArbitrationConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, ArbitrationConfig::default());
    }

    #[test]
    fn partial_yaml_overrides_fields() {
        let config = ArbitrationConfig::from_yaml_str(
            "delay_interval_ms: 2500\nstrong_suspicion_level: 4\n",
        )
        .unwrap();
        assert_eq!(config.delay_interval, Duration::from_millis(2_500));
        assert_eq!(config.strong_suspicion_level, 4);
        assert_eq!(config.weak_suspicion_level, 1);
    }

    #[test]
    fn unknown_key_rejected() {
        let err = ArbitrationConfig::from_yaml_str("delay_interval: 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn reject_weight_below_strong_rejected() {
        let err = ArbitrationConfig::from_yaml_str(
            "strong_suspicion_level: 5\nreject_suspicion_level: 2\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "reject_suspicion_level",
                ..
            }
        ));
    }

    #[test]
    fn negative_weight_rejected() {
        let config = ArbitrationConfig {
            weak_suspicion_level: -1,
            ..ArbitrationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_delay_interval_rejected() {
        let config = ArbitrationConfig {
            delay_interval: Duration::ZERO,
            ..ArbitrationConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "delay_interval_ms",
                ..
            })
        ));
    }

    #[test]
    fn yaml_roundtrip_preserves_values() {
        let config = ArbitrationConfig {
            cleanup_interval: Duration::from_millis(1_234),
            ..ArbitrationConfig::default()
        };
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("cleanup_interval_ms: 1234"));
        assert_eq!(ArbitrationConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn default_history_needed_is_lease_plus_timeout() {
        let config = ArbitrationConfig::default();
        assert_eq!(config.default_history_needed(), Duration::from_secs(80));
    }

    #[test]
    fn handle_replace_visible_to_clones() {
        let handle = ConfigHandle::default();
        let other = handle.clone();
        let before = other.snapshot();
        handle
            .replace(ArbitrationConfig {
                delay_interval: Duration::from_secs(9),
                ..ArbitrationConfig::default()
            })
            .unwrap();
        assert_eq!(other.snapshot().delay_interval, Duration::from_secs(9));
        // Snapshots taken earlier are unaffected.
        assert_eq!(before.delay_interval, Duration::from_secs(5));
    }

    #[test]
    fn handle_replace_rejects_invalid() {
        let handle = ConfigHandle::default();
        let bad = ArbitrationConfig {
            cleanup_interval: Duration::ZERO,
            ..ArbitrationConfig::default()
        };
        assert!(handle.replace(bad).is_err());
        assert_eq!(handle.snapshot().cleanup_interval, Duration::from_secs(30));
    }
}
