//! Per-invocation correlation context.

use std::time::Duration;

use chrono::{DateTime, Utc};
use linkgate_core::{AttemptMetrics, CorrelationId, GatePhase};
use tokio::time::Instant;

use crate::cancel::CancelToken;

/// State owned by exactly one gate invocation.
///
/// Created when the gate starts and discarded when it returns; nothing here
/// is shared between invocations. Attempts and phases are append-only.
#[derive(Debug)]
pub struct CorrelationContext {
    id: CorrelationId,
    started_at: DateTime<Utc>,
    started: Instant,
    deadline: Instant,
    overall_deadline: Duration,
    cancel: CancelToken,
    attempts: Vec<AttemptMetrics>,
    phases: Vec<GatePhase>,
}

impl CorrelationContext {
    /// Starts a context whose hard deadline is `overall_deadline` from now.
    #[must_use]
    pub fn new(id: CorrelationId, overall_deadline: Duration) -> Self {
        let started = Instant::now();
        Self {
            id,
            started_at: Utc::now(),
            started,
            deadline: started + overall_deadline,
            overall_deadline,
            cancel: CancelToken::new(),
            attempts: Vec::new(),
            phases: vec![GatePhase::Started],
        }
    }

    /// Ties the invocation to a caller-held token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancellation token raced by every wait in the invocation.
    #[must_use]
    pub const fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    /// Correlation identifier.
    #[must_use]
    pub const fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wall-clock start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time since the invocation started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Instant at which the overall deadline expires.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Configured overall deadline.
    #[must_use]
    pub const fn overall_deadline(&self) -> Duration {
        self.overall_deadline
    }

    /// Attempts recorded so far, in order.
    #[must_use]
    pub fn attempts(&self) -> &[AttemptMetrics] {
        &self.attempts
    }

    /// Phases entered so far, starting with [`GatePhase::Started`].
    #[must_use]
    pub fn phases(&self) -> &[GatePhase] {
        &self.phases
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> GatePhase {
        self.phases.last().copied().unwrap_or(GatePhase::Started)
    }

    pub(crate) fn enter(&mut self, next: GatePhase) {
        debug_assert!(
            self.phase().can_transition_to(next),
            "illegal gate phase transition {} -> {next}",
            self.phase()
        );
        self.phases.push(next);
    }

    pub(crate) fn record_attempt(&mut self, metrics: AttemptMetrics) {
        debug_assert_eq!(metrics.attempt_index as usize, self.attempts.len());
        self.attempts.push(metrics);
    }

    pub(crate) fn into_parts(self) -> (CorrelationId, Vec<AttemptMetrics>, Vec<GatePhase>) {
        (self.id, self.attempts, self.phases)
    }
}
