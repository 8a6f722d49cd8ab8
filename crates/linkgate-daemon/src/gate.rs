//! Gate orchestrator.
//!
//! One [`ConsistencyGate`] serves any number of concurrent invocations. Each
//! invocation owns its [`CorrelationContext`] and walks the phase machine:
//!
//! ```text
//! Started -> Probing -> Classifying -> (Retrying -> Probing)* -> Deciding -> Shaping -> Returned
//! ```
//!
//! Dropping the future returned by [`ConsistencyGate::check`] abandons the
//! invocation; in-flight store checks are aborted with it and no decision is
//! emitted. [`ConsistencyGate::check_with_cancel`] ties the invocation to a
//! [`CancelToken`] instead: firing it interrupts whichever wait is running
//! (probe, backoff or shaping) and the invocation returns
//! `BlockUnavailable` under either policy, without a recovery request.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use linkgate_core::config::MAX_STORES;
use linkgate_core::{
    AttemptMetrics, ConfigError, ConsistencyOutcome, CorrelationId, GateConfig, GateDecision,
    GatePhase, PolicyMode, PrincipalId, RecoveryConfig, decide,
};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::context::CorrelationContext;
use crate::emitter::{Emitter, ObservabilitySink, TracingSink};
use crate::metrics::GateMetrics;
use crate::probe::ConsistencyProbe;
use crate::recovery::{RecoveryDispatcher, RecoveryHandle, RecoveryTrigger};
use crate::retry::RetryController;
use crate::shaper::TimingShaper;
use crate::store::StoreRef;

/// Errors raised while assembling a gate.
#[derive(Debug, Error)]
pub enum GateBuildError {
    /// Gate or recovery settings are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No linkage store was supplied.
    #[error("at least one linkage store is required")]
    NoStores,

    /// Too many linkage stores were supplied.
    #[error("too many linkage stores: {actual} (max {max})")]
    TooManyStores {
        /// Number supplied.
        actual: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Two stores share a name.
    #[error("duplicate linkage store name: {0}")]
    DuplicateStore(String),

    /// A recovery trigger was configured outside a tokio runtime.
    #[error("recovery dispatch requires a running tokio runtime")]
    NoRuntime,
}

/// Everything one invocation produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateReport {
    /// Correlation id threading logs and the recovery request.
    pub correlation_id: CorrelationId,
    /// Decision returned to the authentication flow.
    pub decision: GateDecision,
    /// Terminal consistency outcome.
    pub outcome: ConsistencyOutcome,
    /// Fail-open allow of an indeterminate outcome.
    pub degraded: bool,
    /// The overall deadline stopped retries early.
    pub deadline_exceeded: bool,
    /// The caller cancelled the invocation before a decision was reached.
    pub cancelled: bool,
    /// Attempt history, in order.
    pub attempts: Vec<AttemptMetrics>,
    /// Phase trail, starting with `started` and ending with `returned`.
    pub phases: Vec<GatePhase>,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    /// Total response time including shaping.
    pub elapsed: Duration,
    /// Padding added by the timing shaper.
    pub padding: Duration,
    /// Recovery request state for `BlockRecover` decisions.
    pub recovery: Option<RecoveryHandle>,
}

/// Post-authentication consistency gate.
pub struct ConsistencyGate {
    config: GateConfig,
    retry: RetryController,
    shaper: TimingShaper,
    emitter: Arc<Emitter>,
    recovery: Option<RecoveryDispatcher>,
    recovery_worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for ConsistencyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsistencyGate")
            .field("config", &self.config)
            .field("stores", &self.retry.probe().stores())
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}

impl ConsistencyGate {
    /// Starts building a gate with the given settings.
    #[must_use]
    pub fn builder(config: GateConfig) -> GateBuilder {
        GateBuilder::new(config)
    }

    /// Gate settings.
    #[must_use]
    pub const fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Stops accepting recovery requests and waits until the queued ones have
    /// been handed to the trigger.
    pub async fn shutdown(self) {
        drop(self.recovery);
        if let Some(worker) = self.recovery_worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "recovery worker terminated abnormally");
            }
        }
    }

    /// Runs the gate and returns only the decision.
    pub async fn authenticate_and_check(
        &self,
        principal: &PrincipalId,
        identity_verified: bool,
        correlation_id: Option<&str>,
    ) -> GateDecision {
        self.check(principal, identity_verified, correlation_id)
            .await
            .decision
    }

    /// Runs the gate for a principal whose credentials have been verified.
    ///
    /// `correlation_id` is adopted when valid; otherwise a fresh one is
    /// generated and the rejection is logged.
    pub async fn check(
        &self,
        principal: &PrincipalId,
        identity_verified: bool,
        correlation_id: Option<&str>,
    ) -> GateReport {
        self.check_with_cancel(principal, identity_verified, correlation_id, CancelToken::new())
            .await
    }

    /// Like [`check`](Self::check), but stops early once `cancel` fires.
    ///
    /// A cancelled invocation is never allowed: it returns `BlockUnavailable`
    /// regardless of policy and skips the remaining padding.
    pub async fn check_with_cancel(
        &self,
        principal: &PrincipalId,
        identity_verified: bool,
        correlation_id: Option<&str>,
        cancel: CancelToken,
    ) -> GateReport {
        let (id, rejected) = CorrelationId::adopt_or_generate(correlation_id);
        let mut ctx =
            CorrelationContext::new(id, self.config.overall_deadline).with_cancel(cancel);
        if let Some(err) = rejected {
            self.emitter.correlation_id_rejected(ctx.id(), &err);
        }
        self.emitter.started(
            ctx.id(),
            principal,
            identity_verified,
            self.config.policy,
            self.retry.probe().stores().len(),
        );

        let run = self.retry.run(principal, identity_verified, &mut ctx).await;

        ctx.enter(GatePhase::Deciding);
        let verdict = if run.cancelled {
            self.emitter.cancelled(ctx.id(), ctx.attempts().len(), ctx.elapsed());
            decide(run.outcome, PolicyMode::FailClosed, ctx.id())
        } else {
            decide(run.outcome, self.config.policy, ctx.id())
        };
        let recovery = match &verdict.decision {
            GateDecision::BlockRecover { correlation_id, .. } => Some(RecoveryHandle {
                correlation_id: correlation_id.clone(),
                enqueued: self
                    .recovery
                    .as_ref()
                    .is_some_and(|dispatcher| dispatcher.enqueue(principal, correlation_id)),
            }),
            GateDecision::Allow | GateDecision::BlockUnavailable { .. } => None,
        };
        if verdict.degraded {
            self.emitter.degraded_allow(ctx.id(), ctx.attempts().len());
        }

        ctx.enter(GatePhase::Shaping);
        let padding = self
            .shaper
            .normalize(ctx.elapsed(), run.outcome, ctx.deadline(), ctx.cancel())
            .await;
        ctx.enter(GatePhase::Returned);

        let elapsed = ctx.elapsed();
        self.emitter.decision(
            ctx.id(),
            &verdict.decision,
            run.outcome,
            verdict.degraded,
            ctx.attempts().len(),
            elapsed,
        );

        let started_at = ctx.started_at();
        let (correlation_id, attempts, phases) = ctx.into_parts();
        GateReport {
            correlation_id,
            decision: verdict.decision,
            outcome: run.outcome,
            degraded: verdict.degraded,
            deadline_exceeded: run.deadline_exceeded,
            cancelled: run.cancelled,
            attempts,
            phases,
            started_at,
            elapsed,
            padding,
            recovery,
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ConsistencyGate`].
pub struct GateBuilder {
    config: GateConfig,
    stores: Vec<StoreRef>,
    sink: Option<Arc<dyn ObservabilitySink>>,
    metrics: Option<GateMetrics>,
    recovery: Option<(Arc<dyn RecoveryTrigger>, RecoveryConfig)>,
    jitter_seed: Option<u64>,
}

impl fmt::Debug for GateBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateBuilder")
            .field("config", &self.config)
            .field("stores", &self.stores)
            .field("recovery", &self.recovery.as_ref().map(|(_, cfg)| cfg))
            .field("jitter_seed", &self.jitter_seed)
            .finish_non_exhaustive()
    }
}

impl GateBuilder {
    fn new(config: GateConfig) -> Self {
        Self {
            config,
            stores: Vec::new(),
            sink: None,
            metrics: None,
            recovery: None,
            jitter_seed: None,
        }
    }

    /// Adds a linkage store.
    #[must_use]
    pub fn store(mut self, store: StoreRef) -> Self {
        self.stores.push(store);
        self
    }

    /// Adds several linkage stores.
    #[must_use]
    pub fn stores(mut self, stores: impl IntoIterator<Item = StoreRef>) -> Self {
        self.stores.extend(stores);
        self
    }

    /// Sets the observability sink (default: [`TracingSink`]).
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Records Prometheus metrics.
    #[must_use]
    pub fn metrics(mut self, metrics: GateMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Dispatches recovery requests for `BlockRecover` decisions.
    #[must_use]
    pub fn recovery_trigger(
        mut self,
        trigger: Arc<dyn RecoveryTrigger>,
        config: RecoveryConfig,
    ) -> Self {
        self.recovery = Some((trigger, config));
        self
    }

    /// Makes the shaper's jitter deterministic.
    #[must_use]
    pub const fn jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// Validates the settings and assembles the gate.
    ///
    /// # Errors
    ///
    /// Returns [`GateBuildError`] for invalid settings, a missing or
    /// duplicated store, or a recovery trigger configured outside a tokio
    /// runtime.
    pub fn build(self) -> Result<ConsistencyGate, GateBuildError> {
        self.config.validate()?;
        if self.stores.is_empty() {
            return Err(GateBuildError::NoStores);
        }
        if self.stores.len() > MAX_STORES {
            return Err(GateBuildError::TooManyStores {
                actual: self.stores.len(),
                max: MAX_STORES,
            });
        }
        let mut names = HashSet::new();
        for store in &self.stores {
            if !names.insert(store.name()) {
                return Err(GateBuildError::DuplicateStore(store.name().to_string()));
            }
        }

        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let emitter = Arc::new(Emitter::new(sink, self.metrics));

        let (recovery, recovery_worker) = match self.recovery {
            Some((trigger, config)) => {
                config.validate()?;
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(GateBuildError::NoRuntime);
                }
                let (dispatcher, worker) =
                    RecoveryDispatcher::spawn(trigger, config.queue_capacity, Arc::clone(&emitter));
                (Some(dispatcher), Some(worker))
            },
            None => (None, None),
        };

        let probe = ConsistencyProbe::new(self.stores, Arc::clone(&emitter));
        let retry = RetryController::new(probe, &self.config, Arc::clone(&emitter));
        let shaper = match self.jitter_seed {
            Some(seed) => TimingShaper::with_seed(self.config.envelope, seed),
            None => TimingShaper::new(self.config.envelope),
        };

        Ok(ConsistencyGate {
            config: self.config,
            retry,
            shaper,
            emitter,
            recovery,
            recovery_worker,
        })
    }
}
