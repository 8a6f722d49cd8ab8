//! Policy Decision: turns a terminal [`ConsistencyOutcome`] into the
//! externally visible [`GateDecision`].
//!
//! | Outcome | fail-closed | fail-open |
//! |---------|-------------|-----------|
//! | `Consistent` | `Allow` | `Allow` |
//! | `OrphanIncompleteLinkage` | `BlockRecover` | `BlockRecover` |
//! | `OrphanUnverifiedIdentity` | `BlockRecover` | `BlockRecover` |
//! | `Indeterminate` | `BlockUnavailable` | `Allow` (degraded) |
//!
//! Policy mode is configuration, never inferred.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::classify::ConsistencyOutcome;
use crate::ids::CorrelationId;

/// How an indeterminate consistency check is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyMode {
    /// Deny access when consistency cannot be confirmed.
    #[default]
    FailClosed,
    /// Allow access when consistency cannot be confirmed, flagged as degraded.
    FailOpen,
}

impl PolicyMode {
    /// Returns the configuration spelling of the mode.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FailClosed => "fail-closed",
            Self::FailOpen => "fail-open",
        }
    }
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail-closed" => Ok(Self::FailClosed),
            "fail-open" => Ok(Self::FailOpen),
            other => Err(format!(
                "unknown policy mode '{other}' (expected 'fail-closed' or 'fail-open')"
            )),
        }
    }
}

/// Why a principal was routed to recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Required linkage records are missing for a verified identity.
    IncompleteLinkage,
    /// The identity record has not been verified.
    UnverifiedIdentity,
}

impl BlockReason {
    /// Returns the metric/log label for this reason.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::IncompleteLinkage => "incomplete_linkage",
            Self::UnverifiedIdentity => "unverified_identity",
        }
    }
}

/// Result surfaced to the authentication flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    /// Proceed with the session.
    Allow,
    /// Deny and direct the user to account recovery.
    BlockRecover {
        /// Why recovery is required.
        reason: BlockReason,
        /// Correlation id for support reference.
        correlation_id: CorrelationId,
    },
    /// Deny without revealing whether the account exists.
    BlockUnavailable {
        /// Correlation id for support reference.
        correlation_id: CorrelationId,
    },
}

impl GateDecision {
    /// Returns the metric/log label for this decision.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::BlockRecover { .. } => "block_recover",
            Self::BlockUnavailable { .. } => "block_unavailable",
        }
    }

    /// Whether the decision grants access.
    #[must_use]
    pub const fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Correlation id carried by a blocking decision.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::Allow => None,
            Self::BlockRecover { correlation_id, .. }
            | Self::BlockUnavailable { correlation_id } => Some(correlation_id),
        }
    }

    /// User-facing message for this decision.
    ///
    /// `BlockUnavailable` is generic and identical whether or not the account
    /// exists.
    #[must_use]
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::Allow => None,
            Self::BlockRecover {
                reason: BlockReason::IncompleteLinkage,
                correlation_id,
            } => Some(format!(
                "Your account setup was not completed. Follow the recovery link sent to your \
                 email to finish registration. Reference: {correlation_id}"
            )),
            Self::BlockRecover {
                reason: BlockReason::UnverifiedIdentity,
                correlation_id,
            } => Some(format!(
                "Your email address has not been confirmed. Follow the recovery link sent to \
                 your email to continue. Reference: {correlation_id}"
            )),
            Self::BlockUnavailable { correlation_id } => Some(format!(
                "Sign-in is temporarily unavailable. Please try again later or contact \
                 support. Reference: {correlation_id}"
            )),
        }
    }
}

/// Decision plus the internal confidence flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVerdict {
    /// The decision returned to the caller.
    pub decision: GateDecision,
    /// `true` for a fail-open allow of an indeterminate outcome.
    pub degraded: bool,
}

/// Applies the configured policy to a terminal outcome.
#[must_use]
pub fn decide(
    outcome: ConsistencyOutcome,
    mode: PolicyMode,
    correlation_id: &CorrelationId,
) -> PolicyVerdict {
    let (decision, degraded) = match (outcome, mode) {
        (ConsistencyOutcome::Consistent, _) => (GateDecision::Allow, false),
        (ConsistencyOutcome::OrphanIncompleteLinkage, _) => (
            GateDecision::BlockRecover {
                reason: BlockReason::IncompleteLinkage,
                correlation_id: correlation_id.clone(),
            },
            false,
        ),
        (ConsistencyOutcome::OrphanUnverifiedIdentity, _) => (
            GateDecision::BlockRecover {
                reason: BlockReason::UnverifiedIdentity,
                correlation_id: correlation_id.clone(),
            },
            false,
        ),
        (ConsistencyOutcome::Indeterminate, PolicyMode::FailClosed) => (
            GateDecision::BlockUnavailable {
                correlation_id: correlation_id.clone(),
            },
            false,
        ),
        (ConsistencyOutcome::Indeterminate, PolicyMode::FailOpen) => (GateDecision::Allow, true),
    };
    PolicyVerdict { decision, degraded }
}
