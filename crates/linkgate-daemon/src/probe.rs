//! Consistency probe: concurrent existence checks against every configured
//! store for one attempt.
//!
//! All checks start together and are awaited until they resolve, the
//! attempt deadline fires or the invocation is cancelled. Checks still running
//! at that point are recorded as [`CheckStatus::Outstanding`] and aborted; the
//! returned [`ProbeResult`] is only built once every check has either
//! resolved or been aborted, so the classifier never sees a partially
//! resolved result.

use std::sync::Arc;
use std::time::Duration;

use linkgate_core::{CheckStatus, CorrelationId, LinkageRecord, PrincipalId, ProbeResult};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::emitter::Emitter;
use crate::store::{Presence, StoreError, StoreRef};

/// Resolution of one spawned check.
#[derive(Debug, Clone, Copy)]
struct Resolved {
    status: CheckStatus,
    duration: Duration,
    error_kind: Option<&'static str>,
}

impl Resolved {
    fn from_result(result: Result<Presence, StoreError>, duration: Duration) -> Self {
        let (status, error_kind) = match result {
            Ok(Presence::Found) => (CheckStatus::Found, None),
            Ok(Presence::Absent) => (CheckStatus::Absent, None),
            Err(err) => (CheckStatus::Errored, Some(err.kind())),
        };
        Self {
            status,
            duration,
            error_kind,
        }
    }
}

/// Fans existence checks out over the configured stores.
#[derive(Debug, Clone)]
pub struct ConsistencyProbe {
    stores: Vec<StoreRef>,
    emitter: Arc<Emitter>,
}

impl ConsistencyProbe {
    /// Creates a probe over `stores`, reporting timing samples to `emitter`.
    #[must_use]
    pub fn new(stores: Vec<StoreRef>, emitter: Arc<Emitter>) -> Self {
        Self { stores, emitter }
    }

    /// Configured stores, in probe order.
    #[must_use]
    pub fn stores(&self) -> &[StoreRef] {
        &self.stores
    }

    /// Runs one attempt.
    ///
    /// Returns after every check has resolved, at `deadline`, or when
    /// `cancel` fires, whichever is first. Dropping the returned future aborts
    /// every in-flight check.
    pub async fn probe(
        &self,
        principal: &PrincipalId,
        attempt_index: u32,
        deadline: Instant,
        cancel: &CancelToken,
        correlation_id: &CorrelationId,
    ) -> ProbeResult {
        let started = Instant::now();
        let mut slots: Vec<Option<Resolved>> = vec![None; self.stores.len()];
        let mut checks = JoinSet::new();

        for (index, store_ref) in self.stores.iter().enumerate() {
            let store = store_ref.store();
            let principal = principal.clone();
            checks.spawn(async move {
                let check_started = Instant::now();
                let result = store.exists(&principal).await;
                (index, Resolved::from_result(result, check_started.elapsed()))
            });
        }

        let cut_short = loop {
            tokio::select! {
                joined = checks.join_next() => match joined {
                    Some(Ok((index, resolved))) => slots[index] = Some(resolved),
                    Some(Err(err)) => {
                        warn!(
                            correlation_id = %correlation_id,
                            attempt_index,
                            error = %err,
                            "linkage check task failed"
                        );
                    },
                    None => break false,
                },
                () = tokio::time::sleep_until(deadline) => break true,
                () = cancel.cancelled() => break true,
            }
        };

        if cut_short {
            // Aborts the stragglers and waits for them to drop their resources.
            checks.shutdown().await;
        }

        let elapsed = started.elapsed();
        let unresolved = if cut_short {
            CheckStatus::Outstanding
        } else {
            CheckStatus::Errored
        };
        let records = self
            .stores
            .iter()
            .zip(slots)
            .map(|(store_ref, slot)| {
                let resolved = slot.unwrap_or(Resolved {
                    status: unresolved,
                    duration: elapsed,
                    error_kind: (unresolved == CheckStatus::Errored).then_some("task_failed"),
                });
                let record = LinkageRecord {
                    store_name: store_ref.name().to_string(),
                    required: store_ref.is_required(),
                    status: resolved.status,
                    query_duration: resolved.duration,
                };
                self.emitter
                    .store_check(correlation_id, attempt_index, &record, resolved.error_kind);
                record
            })
            .collect();

        ProbeResult::from_records(attempt_index, records, elapsed)
    }
}
