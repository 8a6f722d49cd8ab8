//! Configuration parsing and validation.
//!
//! Every tunable of the gate is supplied here; nothing is hardcoded in the
//! runtime. Durations use humantime spelling (`"300ms"`, `"2s"`).
//!
//! ```toml
//! [gate]
//! policy = "fail-closed"
//! max_attempts = 3
//! per_attempt_timeout = "300ms"
//! overall_deadline = "2500ms"
//!
//! [gate.backoff]
//! type = "schedule"
//! delays = ["0ms", "200ms", "500ms"]
//!
//! [gate.envelope]
//! target = "500ms"
//! jitter = "50ms"
//!
//! [[stores]]
//! name = "orgs"
//! required = true
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::policy::PolicyMode;

/// Upper bound on `max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 16;

/// Maximum length of a store name.
pub const MAX_STORE_NAME_LENGTH: usize = 64;

/// Maximum number of configured linkage stores.
pub const MAX_STORES: usize = 16;

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LinkgateConfig {
    /// Gate behaviour.
    #[serde(default)]
    pub gate: GateConfig,

    /// Recovery dispatcher settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Linkage stores probed for every principal.
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
}

impl LinkgateConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validates the whole configuration, including the store list.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gate.validate()?;
        self.recovery.validate()?;
        validate_stores(&self.stores)
    }
}

/// Gate behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Treatment of indeterminate outcomes.
    #[serde(default)]
    pub policy: PolicyMode,

    /// Maximum number of probe attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Time bound for one probe fan-out.
    #[serde(default = "default_per_attempt_timeout")]
    #[serde(with = "humantime_serde")]
    pub per_attempt_timeout: Duration,

    /// Hard ceiling covering every attempt, backoff delay and shaping pad.
    #[serde(default = "default_overall_deadline")]
    #[serde(with = "humantime_serde")]
    pub overall_deadline: Duration,

    /// Delays between attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Response-time envelope for the timing shaper.
    #[serde(default)]
    pub envelope: EnvelopeConfig,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_per_attempt_timeout() -> Duration {
    Duration::from_millis(300)
}

const fn default_overall_deadline() -> Duration {
    Duration::from_millis(2500)
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            policy: PolicyMode::default(),
            max_attempts: default_max_attempts(),
            per_attempt_timeout: default_per_attempt_timeout(),
            overall_deadline: default_overall_deadline(),
            backoff: BackoffConfig::default(),
            envelope: EnvelopeConfig::default(),
        }
    }
}

impl GateConfig {
    /// Validates the gate settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(ConfigError::Validation(format!(
                "gate.max_attempts must be within 1..={MAX_ATTEMPTS_LIMIT}, got {}",
                self.max_attempts
            )));
        }
        if self.per_attempt_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "gate.per_attempt_timeout must be greater than zero".to_string(),
            ));
        }
        if self.overall_deadline < self.per_attempt_timeout {
            return Err(ConfigError::Validation(format!(
                "gate.overall_deadline ({:?}) must cover at least one attempt ({:?})",
                self.overall_deadline, self.per_attempt_timeout
            )));
        }
        self.backoff
            .validate()
            .map_err(|e| ConfigError::Validation(format!("gate.backoff: {e}")))?;
        self.envelope.validate()
    }
}

/// Response-time envelope: every decision is returned no earlier than
/// `target ± jitter` after the invocation started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeConfig {
    /// Centre of the envelope.
    #[serde(default = "default_envelope_target")]
    #[serde(with = "humantime_serde")]
    pub target: Duration,

    /// Half-width of the jitter band.
    #[serde(default = "default_envelope_jitter")]
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
}

const fn default_envelope_target() -> Duration {
    Duration::from_millis(500)
}

const fn default_envelope_jitter() -> Duration {
    Duration::from_millis(50)
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            target: default_envelope_target(),
            jitter: default_envelope_jitter(),
        }
    }
}

impl EnvelopeConfig {
    /// Validates the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] when the jitter is not smaller
    /// than the target.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.target.is_zero() && self.jitter >= self.target {
            return Err(ConfigError::Validation(format!(
                "gate.envelope.jitter ({:?}) must be smaller than gate.envelope.target ({:?})",
                self.jitter, self.target
            )));
        }
        Ok(())
    }
}

/// Recovery dispatcher settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Capacity of the queue feeding the recovery worker.
    #[serde(default = "default_recovery_queue_capacity")]
    pub queue_capacity: usize,
}

const fn default_recovery_queue_capacity() -> usize {
    256
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_recovery_queue_capacity(),
        }
    }
}

impl RecoveryConfig {
    /// Validates the recovery settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for a zero queue capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "recovery.queue_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One linkage store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Store name used in logs, metrics and probe records.
    pub name: String,

    /// Whether a row in this store is required for consistency.
    #[serde(default = "default_required")]
    pub required: bool,

    /// SQLite backing for the command-line adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite: Option<SqliteStoreConfig>,
}

const fn default_required() -> bool {
    true
}

/// SQLite table holding linkage rows keyed by principal id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteStoreConfig {
    /// Database file.
    pub path: PathBuf,
    /// Table name.
    pub table: String,
    /// Column holding the principal id.
    pub column: String,
}

/// Returns whether `value` is a plain SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`).
#[must_use]
pub fn is_sql_identifier(value: &str) -> bool {
    let mut bytes = value.bytes();
    matches!(bytes.next(), Some(b) if b.is_ascii_alphabetic() || b == b'_')
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
        && value.len() <= MAX_STORE_NAME_LENGTH
}

fn validate_stores(stores: &[StoreConfig]) -> Result<(), ConfigError> {
    if stores.is_empty() {
        return Err(ConfigError::Validation(
            "at least one [[stores]] entry is required".to_string(),
        ));
    }
    if stores.len() > MAX_STORES {
        return Err(ConfigError::Validation(format!(
            "too many stores: {} > {MAX_STORES}",
            stores.len()
        )));
    }
    let mut seen = HashSet::new();
    for store in stores {
        if store.name.is_empty()
            || store.name.len() > MAX_STORE_NAME_LENGTH
            || !store
                .name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-'))
        {
            return Err(ConfigError::Validation(format!(
                "invalid store name '{}': use 1..={MAX_STORE_NAME_LENGTH} characters from [A-Za-z0-9_-]",
                store.name
            )));
        }
        if !seen.insert(store.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate store name '{}'",
                store.name
            )));
        }
        if let Some(sqlite) = &store.sqlite {
            for (field, value) in [("table", &sqlite.table), ("column", &sqlite.column)] {
                if !is_sql_identifier(value) {
                    return Err(ConfigError::Validation(format!(
                        "store '{}': sqlite.{field} '{value}' is not a plain SQL identifier",
                        store.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

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
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod list {
        use std::time::Duration;

        use serde::ser::SerializeSeq;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut seq = serializer.serialize_seq(Some(durations.len()))?;
            for duration in durations {
                seq.serialize_element(&humantime::format_duration(*duration).to_string())?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Vec::<String>::deserialize(deserializer)?
                .iter()
                .map(|s| humantime::parse_duration(s).map_err(serde::de::Error::custom))
                .collect()
        }
    }
}
