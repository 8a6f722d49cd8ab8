//! Records produced while probing linkage stores.
//!
//! A [`ProbeResult`] exists for exactly one attempt: it is built once every
//! check has resolved or the attempt deadline has fired, handed to the
//! classifier, and then reduced to an [`AttemptMetrics`] entry. Only the
//! metrics survive the invocation.

use std::time::Duration;

use serde::Serialize;

use crate::classify::ConsistencyOutcome;

/// Resolution of a single existence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// The store holds a row for the principal.
    Found,
    /// The store definitively reported that no row exists.
    Absent,
    /// The store could not determine existence (I/O, permission, backend).
    Errored,
    /// The check had not returned when the attempt deadline fired.
    Outstanding,
}

impl CheckStatus {
    /// Returns the metric/log label for this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::Absent => "absent",
            Self::Errored => "errored",
            Self::Outstanding => "outstanding",
        }
    }

    /// Whether the status is a definitive answer from the store.
    #[must_use]
    pub const fn is_definitive(&self) -> bool {
        matches!(self, Self::Found | Self::Absent)
    }
}

/// Existence-only projection of one linkage store for one principal.
///
/// Row content never reaches the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkageRecord {
    /// Configured store name.
    pub store_name: String,
    /// Whether a row in this store is required for consistency.
    pub required: bool,
    /// How the check resolved.
    pub status: CheckStatus,
    /// Time spent on the check (up to the deadline for outstanding checks).
    pub query_duration: Duration,
}

impl LinkageRecord {
    /// Whether the store reported a row. Outstanding and errored checks count
    /// as not found.
    #[must_use]
    pub fn found(&self) -> bool {
        self.status == CheckStatus::Found
    }
}

/// Aggregate of all checks issued during one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    /// Zero-based attempt index.
    pub attempt_index: u32,
    /// One record per configured store, in configuration order.
    pub records: Vec<LinkageRecord>,
    /// At least one check was still outstanding at the attempt deadline.
    pub timed_out: bool,
    /// At least one check failed without a definitive answer.
    pub errored: bool,
    /// Wall time of the whole fan-out.
    pub duration: Duration,
}

impl ProbeResult {
    /// Builds a probe result, deriving `timed_out` and `errored` from the
    /// records.
    #[must_use]
    pub fn from_records(attempt_index: u32, records: Vec<LinkageRecord>, duration: Duration) -> Self {
        let timed_out = records
            .iter()
            .any(|r| r.status == CheckStatus::Outstanding);
        let errored = records.iter().any(|r| r.status == CheckStatus::Errored);
        Self {
            attempt_index,
            records,
            timed_out,
            errored,
            duration,
        }
    }

    /// Stores whose checks had not returned at the deadline.
    pub fn outstanding_stores(&self) -> impl Iterator<Item = &str> {
        self.records
            .iter()
            .filter(|r| r.status == CheckStatus::Outstanding)
            .map(|r| r.store_name.as_str())
    }

    /// Stores whose checks failed indeterminately.
    pub fn errored_stores(&self) -> impl Iterator<Item = &str> {
        self.records
            .iter()
            .filter(|r| r.status == CheckStatus::Errored)
            .map(|r| r.store_name.as_str())
    }

    /// Number of checks that reported a row.
    #[must_use]
    pub fn found_count(&self) -> usize {
        self.records.iter().filter(|r| r.found()).count()
    }
}

/// Metrics retained for one Retry Controller cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptMetrics {
    /// Zero-based attempt index.
    pub attempt_index: u32,
    /// Backoff delay plus probe plus classification.
    pub total_duration: Duration,
    /// Probe fan-out duration.
    pub query_duration: Duration,
    /// The attempt hit its deadline with checks outstanding.
    pub timed_out: bool,
    /// At least one check failed indeterminately.
    pub errored: bool,
    /// Classification of this attempt.
    pub outcome: ConsistencyOutcome,
}
