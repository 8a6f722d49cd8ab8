//! Validated identifiers threaded through a gate invocation.
//!
//! [`PrincipalId`] is opaque and supplied by the identity provider. It is
//! never written to logs verbatim; [`PrincipalId::fingerprint`] yields a short
//! domain-separated digest suitable for correlating log lines without
//! disclosing which accounts exist.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Maximum length of a principal identifier in bytes.
pub const MAX_PRINCIPAL_ID_LENGTH: usize = 256;

/// Maximum length of a caller-supplied correlation identifier in bytes.
pub const MAX_CORRELATION_ID_LENGTH: usize = 128;

/// Domain separator for principal fingerprints.
const FINGERPRINT_DOMAIN: &[u8] = b"LINKGATE_PRINCIPAL_FINGERPRINT:";

/// Number of digest bytes kept in a fingerprint.
const FINGERPRINT_BYTES: usize = 8;

/// Identifier validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// Identifier is empty.
    #[error("{field} must not be empty")]
    Empty {
        /// Field name.
        field: &'static str,
    },

    /// Identifier exceeds its maximum length.
    #[error("{field} exceeds max length: {actual} > {max}")]
    TooLong {
        /// Field name.
        field: &'static str,
        /// Actual length.
        actual: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Identifier contains a character outside its allowed set.
    #[error("{field} contains a disallowed character at byte {position}")]
    InvalidCharacter {
        /// Field name.
        field: &'static str,
        /// Byte offset of the offending character.
        position: usize,
    },
}

/// Opaque identifier of an authenticated principal.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PrincipalId(String);

impl PrincipalId {
    /// Creates a principal identifier.
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] if the value is empty, longer than
    /// [`MAX_PRINCIPAL_ID_LENGTH`], or contains control characters.
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdError::Empty {
                field: "principal_id",
            });
        }
        if value.len() > MAX_PRINCIPAL_ID_LENGTH {
            return Err(IdError::TooLong {
                field: "principal_id",
                actual: value.len(),
                max: MAX_PRINCIPAL_ID_LENGTH,
            });
        }
        if let Some((position, _)) = value.char_indices().find(|(_, c)| c.is_control()) {
            return Err(IdError::InvalidCharacter {
                field: "principal_id",
                position,
            });
        }
        Ok(Self(value))
    }

    /// Returns the raw identifier for store lookups.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short hex fingerprint for logs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(self.0.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..FINGERPRINT_BYTES])
    }
}

// Debug prints the fingerprint, never the raw identifier.
impl fmt::Debug for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrincipalId").field(&self.fingerprint()).finish()
    }
}

impl TryFrom<String> for PrincipalId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PrincipalId> for String {
    fn from(value: PrincipalId) -> Self {
        value.0
    }
}

/// Identifier threading logs, metrics and the recovery call for one gate
/// invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generates a fresh random correlation identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parses a caller-supplied correlation identifier.
    ///
    /// Accepted values are non-empty, at most [`MAX_CORRELATION_ID_LENGTH`]
    /// bytes, and drawn from `[A-Za-z0-9._:-]`.
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] when the value violates those rules.
    pub fn parse(value: &str) -> Result<Self, IdError> {
        if value.is_empty() {
            return Err(IdError::Empty {
                field: "correlation_id",
            });
        }
        if value.len() > MAX_CORRELATION_ID_LENGTH {
            return Err(IdError::TooLong {
                field: "correlation_id",
                actual: value.len(),
                max: MAX_CORRELATION_ID_LENGTH,
            });
        }
        if let Some(position) = value
            .bytes()
            .position(|b| !(b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-')))
        {
            return Err(IdError::InvalidCharacter {
                field: "correlation_id",
                position,
            });
        }
        Ok(Self(value.to_string()))
    }

    /// Uses the caller-supplied identifier when valid, otherwise generates
    /// one. The rejection reason is returned for logging.
    #[must_use]
    pub fn adopt_or_generate(supplied: Option<&str>) -> (Self, Option<IdError>) {
        match supplied.map(Self::parse) {
            Some(Ok(id)) => (id, None),
            Some(Err(err)) => (Self::generate(), Some(err)),
            None => (Self::generate(), None),
        }
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CorrelationId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CorrelationId> for String {
    fn from(value: CorrelationId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_rejects_empty_and_oversized() {
        assert_eq!(
            PrincipalId::new(""),
            Err(IdError::Empty {
                field: "principal_id"
            })
        );
        let long = "a".repeat(MAX_PRINCIPAL_ID_LENGTH + 1);
        assert!(matches!(
            PrincipalId::new(long),
            Err(IdError::TooLong { actual: 257, .. })
        ));
    }

    #[test]
    fn principal_rejects_control_characters() {
        assert_eq!(
            PrincipalId::new("user\n1"),
            Err(IdError::InvalidCharacter {
                field: "principal_id",
                position: 4
            })
        );
    }

    #[test]
    fn principal_debug_does_not_leak_raw_id() {
        let id = PrincipalId::new("alice@example.com").unwrap();
        let rendered = format!("{id:?}");
        assert!(!rendered.contains("alice"));
        assert!(rendered.contains(&id.fingerprint()));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = PrincipalId::new("P1").unwrap();
        let b = PrincipalId::new("P1").unwrap();
        let c = PrincipalId::new("P2").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), FINGERPRINT_BYTES * 2);
    }

    #[test]
    fn correlation_id_accepts_upstream_trace_ids() {
        let id = CorrelationId::parse("req-7f3a:edge.01").unwrap();
        assert_eq!(id.as_str(), "req-7f3a:edge.01");
    }

    #[test]
    fn correlation_id_rejects_injection_characters() {
        assert!(matches!(
            CorrelationId::parse("abc\" level=error"),
            Err(IdError::InvalidCharacter { position: 3, .. })
        ));
    }

    #[test]
    fn adopt_or_generate_replaces_invalid_values() {
        let (id, rejected) = CorrelationId::adopt_or_generate(Some(""));
        assert!(rejected.is_some());
        assert!(Uuid::parse_str(id.as_str()).is_ok());

        let (id, rejected) = CorrelationId::adopt_or_generate(Some("trace-1"));
        assert!(rejected.is_none());
        assert_eq!(id.as_str(), "trace-1");

        let (id, rejected) = CorrelationId::adopt_or_generate(None);
        assert!(rejected.is_none());
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }
}
