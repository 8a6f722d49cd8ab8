//! Retry controller: repeats probe-then-classify until a terminal outcome,
//! the attempt budget, the overall deadline, or cancellation.

use std::sync::Arc;
use std::time::Duration;

use linkgate_core::{
    AttemptMetrics, BackoffConfig, ConsistencyOutcome, GateConfig, GatePhase, PrincipalId,
    classify,
};
use tokio::time::Instant;
use tracing::debug;

use crate::context::CorrelationContext;
use crate::emitter::Emitter;
use crate::probe::ConsistencyProbe;

/// How the retry loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Terminal outcome handed to the policy.
    pub outcome: ConsistencyOutcome,
    /// The overall deadline stopped the loop before the attempt budget was
    /// spent.
    pub deadline_exceeded: bool,
    /// The invocation's cancel token fired.
    pub cancelled: bool,
}

impl RetryOutcome {
    const fn indeterminate(deadline_exceeded: bool, cancelled: bool) -> Self {
        Self {
            outcome: ConsistencyOutcome::Indeterminate,
            deadline_exceeded,
            cancelled,
        }
    }
}

/// Drives attempts against the probe.
///
/// Only [`ConsistencyOutcome::Indeterminate`] is retried. Orphan outcomes are
/// terminal on the first observation.
#[derive(Debug, Clone)]
pub struct RetryController {
    probe: ConsistencyProbe,
    max_attempts: u32,
    per_attempt_timeout: Duration,
    backoff: BackoffConfig,
    emitter: Arc<Emitter>,
}

impl RetryController {
    /// Creates a controller from the gate settings.
    #[must_use]
    pub fn new(probe: ConsistencyProbe, config: &GateConfig, emitter: Arc<Emitter>) -> Self {
        Self {
            probe,
            max_attempts: config.max_attempts,
            per_attempt_timeout: config.per_attempt_timeout,
            backoff: config.backoff.clone(),
            emitter,
        }
    }

    /// Returns the probe.
    #[must_use]
    pub const fn probe(&self) -> &ConsistencyProbe {
        &self.probe
    }

    /// Runs attempts until an outcome is terminal or the budget is spent.
    ///
    /// Attempts are appended to `ctx` in order. Leaves `ctx` in
    /// [`GatePhase::Classifying`] or [`GatePhase::Retrying`]. Cancelling the
    /// context's token interrupts the backoff delay or the running probe and
    /// ends the loop as indeterminate.
    pub async fn run(
        &self,
        principal: &PrincipalId,
        identity_verified: bool,
        ctx: &mut CorrelationContext,
    ) -> RetryOutcome {
        let cancel = ctx.cancel().clone();
        let mut deadline_exceeded = false;

        for attempt_index in 0..self.max_attempts {
            let attempt_started = Instant::now();

            if attempt_index > 0 {
                ctx.enter(GatePhase::Retrying);
                let delay = self.backoff.delay_before_attempt(attempt_index);
                if attempt_started + delay >= ctx.deadline() {
                    deadline_exceeded = true;
                    break;
                }
                if !delay.is_zero() {
                    debug!(
                        correlation_id = %ctx.id(),
                        attempt_index,
                        delay = ?delay,
                        "backing off before retry"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {},
                        () = cancel.cancelled() => return RetryOutcome::indeterminate(false, true),
                    }
                }
            }

            ctx.enter(GatePhase::Probing);
            let attempt_deadline = (Instant::now() + self.per_attempt_timeout).min(ctx.deadline());
            let result = self
                .probe
                .probe(principal, attempt_index, attempt_deadline, &cancel, ctx.id())
                .await;

            ctx.enter(GatePhase::Classifying);
            let outcome = classify(&result, identity_verified);
            let metrics = AttemptMetrics {
                attempt_index,
                total_duration: attempt_started.elapsed(),
                query_duration: result.duration,
                timed_out: result.timed_out,
                errored: result.errored,
                outcome,
            };
            self.emitter.attempt(ctx.id(), &metrics);
            ctx.record_attempt(metrics);

            if cancel.is_cancelled() {
                return RetryOutcome::indeterminate(false, true);
            }
            if outcome.is_terminal() {
                return RetryOutcome {
                    outcome,
                    deadline_exceeded: false,
                    cancelled: false,
                };
            }
            if Instant::now() >= ctx.deadline() {
                deadline_exceeded = attempt_index + 1 < self.max_attempts;
                break;
            }
        }

        if deadline_exceeded {
            self.emitter.deadline_exceeded(
                ctx.id(),
                ctx.attempts().len(),
                ctx.elapsed(),
                ctx.overall_deadline(),
            );
        }
        RetryOutcome::indeterminate(deadline_exceeded, false)
    }
}

#[cfg(test)]
mod tests {
    use linkgate_core::CorrelationId;

    use super::*;
    use crate::cancel::CancelToken;
    use crate::emitter::{RecordingSink, events};
    use crate::store::{InMemoryLinkageStore, ScriptedFailure, StoreError, StoreRef};

    fn principal(id: &str) -> PrincipalId {
        PrincipalId::new(id).unwrap()
    }

    fn controller(
        config: &GateConfig,
        stores: Vec<StoreRef>,
    ) -> (RetryController, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let emitter = Arc::new(Emitter::new(sink.clone(), None));
        let probe = ConsistencyProbe::new(stores, Arc::clone(&emitter));
        (RetryController::new(probe, config, emitter), sink)
    }

    fn context(config: &GateConfig) -> CorrelationContext {
        CorrelationContext::new(CorrelationId::generate(), config.overall_deadline)
    }

    #[tokio::test(start_paused = true)]
    async fn orphan_is_terminal_on_first_attempt() {
        let config = GateConfig::default();
        let orgs = Arc::new(InMemoryLinkageStore::new("orgs"));
        let (retry, _sink) = controller(&config, vec![StoreRef::required(orgs.clone())]);
        let mut ctx = context(&config);

        let run = retry.run(&principal("P1"), true, &mut ctx).await;

        assert_eq!(run.outcome, ConsistencyOutcome::OrphanIncompleteLinkage);
        assert_eq!(ctx.attempts().len(), 1);
        assert_eq!(orgs.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_on_retry() {
        let config = GateConfig::default();
        let orgs = Arc::new(
            InMemoryLinkageStore::new("orgs")
                .with_principals(["P2"])
                .with_failure(ScriptedFailure::Next(
                    1,
                    StoreError::Unavailable("locked".to_string()),
                )),
        );
        let (retry, _sink) = controller(&config, vec![StoreRef::required(orgs)]);
        let mut ctx = context(&config);

        let run = retry.run(&principal("P2"), true, &mut ctx).await;

        assert_eq!(run.outcome, ConsistencyOutcome::Consistent);
        let outcomes: Vec<_> = ctx.attempts().iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            [ConsistencyOutcome::Indeterminate, ConsistencyOutcome::Consistent]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_follows_backoff_schedule() {
        let config = GateConfig::default();
        let slow = Arc::new(
            InMemoryLinkageStore::new("orgs").with_latency(Duration::from_secs(10)),
        );
        let (retry, sink) = controller(&config, vec![StoreRef::required(slow)]);
        let mut ctx = context(&config);

        let run = retry.run(&principal("P3"), true, &mut ctx).await;

        assert_eq!(run.outcome, ConsistencyOutcome::Indeterminate);
        assert!(!run.deadline_exceeded);
        assert_eq!(ctx.attempts().len(), 3);
        assert!(ctx.attempts().iter().all(|a| a.timed_out));
        // 3 x 300ms probes plus the 200ms and 500ms delays.
        let elapsed = ctx.elapsed();
        assert!(elapsed >= Duration::from_millis(1600), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1650), "{elapsed:?}");
        assert!(sink.named(events::DEADLINE_EXCEEDED).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overall_deadline_aborts_remaining_retries() {
        let config = GateConfig {
            max_attempts: 5,
            overall_deadline: Duration::from_millis(900),
            ..GateConfig::default()
        };
        let slow = Arc::new(
            InMemoryLinkageStore::new("orgs").with_latency(Duration::from_secs(10)),
        );
        let (retry, sink) = controller(&config, vec![StoreRef::required(slow)]);
        let mut ctx = context(&config);

        let run = retry.run(&principal("P3"), true, &mut ctx).await;

        assert_eq!(run.outcome, ConsistencyOutcome::Indeterminate);
        assert!(run.deadline_exceeded);
        // 300ms, 200ms delay, 300ms; the 500ms delay would overrun the 900ms
        // deadline.
        assert_eq!(ctx.attempts().len(), 2);
        assert!(ctx.elapsed() < Duration::from_millis(900));
        let warnings = sink.named(events::DEADLINE_EXCEEDED);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, tracing::Level::WARN);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let config = GateConfig {
            backoff: BackoffConfig::Schedule {
                delays: vec![Duration::ZERO, Duration::from_secs(5)],
            },
            overall_deadline: Duration::from_secs(30),
            ..GateConfig::default()
        };
        let slow = Arc::new(
            InMemoryLinkageStore::new("orgs").with_latency(Duration::from_secs(10)),
        );
        let (retry, sink) = controller(&config, vec![StoreRef::required(slow.clone())]);
        let cancel = CancelToken::new();
        let mut ctx = context(&config).with_cancel(cancel.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            cancel.cancel();
        });

        let run = retry.run(&principal("P3"), true, &mut ctx).await;

        assert!(run.cancelled);
        assert!(!run.deadline_exceeded);
        assert_eq!(run.outcome, ConsistencyOutcome::Indeterminate);
        // First attempt timed out at 300ms; the 5s delay was cut at 400ms.
        assert_eq!(ctx.attempts().len(), 1);
        assert!(ctx.elapsed() < Duration::from_millis(410), "{:?}", ctx.elapsed());
        assert_eq!(slow.calls(), 1);
        assert!(sink.named(events::DEADLINE_EXCEEDED).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cut_short_by_overall_deadline_times_out() {
        let config = GateConfig {
            max_attempts: 2,
            per_attempt_timeout: Duration::from_millis(300),
            overall_deadline: Duration::from_millis(450),
            backoff: BackoffConfig::Schedule {
                delays: vec![Duration::ZERO],
            },
            ..GateConfig::default()
        };
        let slow = Arc::new(
            InMemoryLinkageStore::new("orgs").with_latency(Duration::from_secs(10)),
        );
        let (retry, _sink) = controller(&config, vec![StoreRef::required(slow.clone())]);
        let mut ctx = context(&config);

        let run = retry.run(&principal("P3"), true, &mut ctx).await;

        assert_eq!(run.outcome, ConsistencyOutcome::Indeterminate);
        assert_eq!(ctx.attempts().len(), 2);
        let second = &ctx.attempts()[1];
        assert!(second.timed_out);
        assert!(second.query_duration < Duration::from_millis(300));
        assert!(ctx.elapsed() < Duration::from_millis(460));
        assert_eq!(slow.in_flight(), 0);
    }
}
