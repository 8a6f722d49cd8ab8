//! Classifier: maps one [`ProbeResult`] to a [`ConsistencyOutcome`].
//!
//! Classification is pure and performs no I/O. It is kept separate
//! from policy: [`ConsistencyOutcome::Indeterminate`] says nothing about
//! whether access is granted; that belongs to [`crate::policy::decide`].
//!
//! # Precedence
//!
//! 1. Every required store reported a row (or, with no required stores, at
//!    least one store did): [`ConsistencyOutcome::Consistent`].
//! 2. The identity is unverified: [`ConsistencyOutcome::OrphanUnverifiedIdentity`].
//!    The flag comes from the caller, so no retry can change it.
//! 3. Any check errored or was outstanding at the deadline:
//!    [`ConsistencyOutcome::Indeterminate`]. A transient failure is never
//!    read as "no such row".
//! 4. Otherwise: [`ConsistencyOutcome::OrphanIncompleteLinkage`].

use serde::Serialize;

use crate::model::{LinkageRecord, ProbeResult};

/// Closed set of consistency outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyOutcome {
    /// All required linkage records exist.
    Consistent,
    /// The identity record is unverified and linkage is missing.
    ///
    /// Verification gating normally runs before the consistency gate; this
    /// outcome covers callers that skipped it.
    OrphanUnverifiedIdentity,
    /// The identity is verified but required linkage records are definitively
    /// absent.
    OrphanIncompleteLinkage,
    /// At least one check could not be resolved.
    Indeterminate,
}

impl ConsistencyOutcome {
    /// Returns the metric/log label for this outcome.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Consistent => "consistent",
            Self::OrphanUnverifiedIdentity => "orphan_unverified_identity",
            Self::OrphanIncompleteLinkage => "orphan_incomplete_linkage",
            Self::Indeterminate => "indeterminate",
        }
    }

    /// Whether the Retry Controller stops on this outcome.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Indeterminate)
    }

    /// Whether the outcome identifies an orphaned principal.
    #[must_use]
    pub const fn is_orphan(&self) -> bool {
        matches!(
            self,
            Self::OrphanUnverifiedIdentity | Self::OrphanIncompleteLinkage
        )
    }
}

/// Classifies a fully resolved probe result.
///
/// `identity_verified` is the caller-supplied verification flag of the
/// identity record (for example "email confirmed").
#[must_use]
pub fn classify(result: &ProbeResult, identity_verified: bool) -> ConsistencyOutcome {
    if result.records.is_empty() {
        // Nothing was probed, so nothing is proven either way.
        return ConsistencyOutcome::Indeterminate;
    }

    if linkage_satisfied(result) {
        return ConsistencyOutcome::Consistent;
    }

    if !identity_verified {
        return ConsistencyOutcome::OrphanUnverifiedIdentity;
    }

    if result.errored || result.timed_out {
        return ConsistencyOutcome::Indeterminate;
    }

    ConsistencyOutcome::OrphanIncompleteLinkage
}

fn linkage_satisfied(result: &ProbeResult) -> bool {
    let mut required = result.records.iter().filter(|r| r.required).peekable();
    if required.peek().is_some() {
        required.all(LinkageRecord::found)
    } else {
        result.records.iter().any(LinkageRecord::found)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::model::CheckStatus;

    fn record(name: &str, required: bool, status: CheckStatus) -> LinkageRecord {
        LinkageRecord {
            store_name: name.to_string(),
            required,
            status,
            query_duration: Duration::from_millis(1),
        }
    }

    fn probe(records: Vec<LinkageRecord>) -> ProbeResult {
        ProbeResult::from_records(0, records, Duration::from_millis(5))
    }

    #[test]
    fn all_required_found_is_consistent() {
        let result = probe(vec![
            record("orgs", true, CheckStatus::Found),
            record("admins", true, CheckStatus::Found),
        ]);
        assert_eq!(classify(&result, true), ConsistencyOutcome::Consistent);
    }

    #[test]
    fn optional_store_absent_does_not_block() {
        let result = probe(vec![
            record("orgs", true, CheckStatus::Found),
            record("admins", false, CheckStatus::Absent),
        ]);
        assert_eq!(classify(&result, true), ConsistencyOutcome::Consistent);
    }

    #[test]
    fn verified_with_no_rows_is_incomplete_linkage() {
        let result = probe(vec![
            record("orgs", true, CheckStatus::Absent),
            record("admins", true, CheckStatus::Absent),
        ]);
        assert_eq!(
            classify(&result, true),
            ConsistencyOutcome::OrphanIncompleteLinkage
        );
    }

    #[test]
    fn partial_required_linkage_is_incomplete() {
        let result = probe(vec![
            record("orgs", true, CheckStatus::Found),
            record("profiles", true, CheckStatus::Absent),
        ]);
        assert_eq!(
            classify(&result, true),
            ConsistencyOutcome::OrphanIncompleteLinkage
        );
    }

    #[test]
    fn unverified_without_rows_is_unverified_orphan() {
        let result = probe(vec![record("orgs", true, CheckStatus::Absent)]);
        assert_eq!(
            classify(&result, false),
            ConsistencyOutcome::OrphanUnverifiedIdentity
        );
    }

    #[test]
    fn unverified_with_transient_error_is_still_unverified_orphan() {
        let result = probe(vec![
            record("orgs", true, CheckStatus::Absent),
            record("admins", true, CheckStatus::Errored),
        ]);
        assert_eq!(
            classify(&result, false),
            ConsistencyOutcome::OrphanUnverifiedIdentity
        );
    }

    #[test]
    fn transient_error_on_one_of_two_checks_is_indeterminate() {
        let result = probe(vec![
            record("orgs", true, CheckStatus::Absent),
            record("admins", true, CheckStatus::Errored),
        ]);
        assert_eq!(classify(&result, true), ConsistencyOutcome::Indeterminate);
    }

    #[test]
    fn timeout_is_indeterminate() {
        let result = probe(vec![
            record("orgs", true, CheckStatus::Outstanding),
            record("admins", true, CheckStatus::Outstanding),
        ]);
        assert!(result.timed_out);
        assert_eq!(classify(&result, true), ConsistencyOutcome::Indeterminate);
    }

    #[test]
    fn no_required_stores_accepts_any_found() {
        let result = probe(vec![
            record("orgs", false, CheckStatus::Absent),
            record("admins", false, CheckStatus::Found),
        ]);
        assert_eq!(classify(&result, true), ConsistencyOutcome::Consistent);
    }

    #[test]
    fn empty_probe_is_indeterminate() {
        assert_eq!(
            classify(&probe(Vec::new()), true),
            ConsistencyOutcome::Indeterminate
        );
    }

    #[test]
    fn only_indeterminate_is_retryable() {
        assert!(ConsistencyOutcome::Consistent.is_terminal());
        assert!(ConsistencyOutcome::OrphanIncompleteLinkage.is_terminal());
        assert!(ConsistencyOutcome::OrphanUnverifiedIdentity.is_terminal());
        assert!(!ConsistencyOutcome::Indeterminate.is_terminal());
    }

    fn any_status() -> impl Strategy<Value = CheckStatus> {
        prop_oneof![
            Just(CheckStatus::Found),
            Just(CheckStatus::Absent),
            Just(CheckStatus::Errored),
            Just(CheckStatus::Outstanding),
        ]
    }

    fn any_records() -> impl Strategy<Value = Vec<LinkageRecord>> {
        prop::collection::vec((any::<bool>(), any_status()), 1..6).prop_map(|items| {
            items
                .into_iter()
                .enumerate()
                .map(|(i, (required, status))| record(&format!("store{i}"), required, status))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn every_record_found_is_consistent(
            required in prop::collection::vec(any::<bool>(), 1..6),
            verified in any::<bool>(),
        ) {
            let records = required
                .into_iter()
                .enumerate()
                .map(|(i, req)| record(&format!("store{i}"), req, CheckStatus::Found))
                .collect();
            prop_assert_eq!(classify(&probe(records), verified), ConsistencyOutcome::Consistent);
        }

        #[test]
        fn unresolved_checks_never_classify_verified_identity_as_orphan(records in any_records()) {
            let result = probe(records);
            let outcome = classify(&result, true);
            if result.errored || result.timed_out {
                prop_assert!(!outcome.is_orphan());
            }
        }

        #[test]
        fn unverified_identity_is_never_retried(records in any_records()) {
            let outcome = classify(&probe(records), false);
            prop_assert!(outcome.is_terminal());
            prop_assert_ne!(outcome, ConsistencyOutcome::OrphanIncompleteLinkage);
        }

        #[test]
        fn classification_is_deterministic(records in any_records(), verified in any::<bool>()) {
            let result = probe(records);
            prop_assert_eq!(classify(&result, verified), classify(&result, verified));
        }
    }
}
