//! Observability emitter.
//!
//! Every record the gate produces flows through an [`ObservabilitySink`]
//! keyed by the invocation's [`CorrelationId`]. Sinks must not block: the
//! gate never waits for acknowledgement and never reads records back.
//!
//! Raw principal identifiers never appear in emitted fields; the
//! [`PrincipalId::fingerprint`] is logged instead.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use linkgate_core::{
    AttemptMetrics, ConsistencyOutcome, CorrelationId, GateDecision, IdError, LinkageRecord,
    PolicyMode, PrincipalId,
};
use serde_json::{Map, Value, json};
use tracing::Level;

use crate::metrics::GateMetrics;

/// Structured fields attached to an event.
pub type EventFields = Map<String, Value>;

/// Stable event names.
pub mod events {
    /// Invocation began.
    pub const STARTED: &str = "gate.started";
    /// One retry-controller cycle completed.
    pub const ATTEMPT: &str = "gate.attempt";
    /// One store check resolved (timing sample).
    pub const STORE_CHECK: &str = "gate.store_check";
    /// Decision returned to the caller.
    pub const DECISION: &str = "gate.decision";
    /// Fail-open allow of an indeterminate outcome.
    pub const DEGRADED_ALLOW: &str = "gate.degraded_allow";
    /// Overall deadline cut the retry loop short.
    pub const DEADLINE_EXCEEDED: &str = "gate.deadline_exceeded";
    /// Recovery request handed to the dispatcher.
    pub const RECOVERY_ENQUEUED: &str = "gate.recovery_enqueued";
    /// Recovery request dropped because the queue was full or closed.
    pub const RECOVERY_DROPPED: &str = "gate.recovery_dropped";
    /// Recovery trigger completed.
    pub const RECOVERY_COMPLETED: &str = "gate.recovery_completed";
    /// Recovery trigger failed.
    pub const RECOVERY_FAILED: &str = "gate.recovery_failed";
    /// Caller-supplied correlation id was rejected and replaced.
    pub const CORRELATION_ID_REJECTED: &str = "gate.correlation_id_rejected";
    /// Caller cancelled the invocation before a decision was reached.
    pub const CANCELLED: &str = "gate.cancelled";
}

/// Destination for gate observability records.
pub trait ObservabilitySink: Send + Sync {
    /// Records one event. Must return without waiting on I/O.
    fn emit(&self, level: Level, event: &str, correlation_id: &CorrelationId, fields: &EventFields);
}

// ============================================================================
// Sinks
// ============================================================================

/// Forwards events to `tracing`, one tracing field per event field.
///
/// `tracing` field names are static, so every field the gate emits has a
/// fixed slot here. Fields without a slot are collected into `extra` as a JSON
/// object.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

/// Field names with a dedicated tracing slot.
const TRACED_FIELDS: [&str; 21] = [
    "principal_fingerprint",
    "identity_verified",
    "policy",
    "stores",
    "store",
    "required",
    "status",
    "error_kind",
    "attempt_index",
    "attempts",
    "outcome",
    "decision",
    "degraded",
    "timed_out",
    "errored",
    "reason",
    "duration_ms",
    "query_ms",
    "total_ms",
    "elapsed_ms",
    "deadline_ms",
];

/// Typed view over an event's fields.
struct Slots<'a>(&'a EventFields);

impl Slots<'_> {
    fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    fn u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    fn bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    fn extra(&self) -> Option<String> {
        let rest: Map<String, Value> = self
            .0
            .iter()
            .filter(|(key, _)| !TRACED_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        (!rest.is_empty()).then(|| Value::Object(rest).to_string())
    }
}

macro_rules! gate_event {
    ($level:expr, $event:expr, $correlation_id:expr, $slots:expr) => {{
        let slots = $slots;
        let extra = slots.extra();
        tracing::event!(
            $level,
            event = $event,
            correlation_id = $correlation_id,
            principal_fingerprint = slots.str("principal_fingerprint"),
            identity_verified = slots.bool("identity_verified"),
            policy = slots.str("policy"),
            stores = slots.u64("stores"),
            store = slots.str("store"),
            required = slots.bool("required"),
            status = slots.str("status"),
            error_kind = slots.str("error_kind"),
            attempt_index = slots.u64("attempt_index"),
            attempts = slots.u64("attempts"),
            outcome = slots.str("outcome"),
            decision = slots.str("decision"),
            degraded = slots.bool("degraded"),
            timed_out = slots.bool("timed_out"),
            errored = slots.bool("errored"),
            reason = slots.str("reason"),
            duration_ms = slots.u64("duration_ms"),
            query_ms = slots.u64("query_ms"),
            total_ms = slots.u64("total_ms"),
            elapsed_ms = slots.u64("elapsed_ms"),
            deadline_ms = slots.u64("deadline_ms"),
            extra = extra.as_deref(),
            "gate event"
        )
    }};
}

impl ObservabilitySink for TracingSink {
    fn emit(&self, level: Level, event: &str, correlation_id: &CorrelationId, fields: &EventFields) {
        let slots = Slots(fields);
        let correlation_id = correlation_id.as_str();
        if level == Level::ERROR {
            gate_event!(Level::ERROR, event, correlation_id, &slots);
        } else if level == Level::WARN {
            gate_event!(Level::WARN, event, correlation_id, &slots);
        } else if level == Level::INFO {
            gate_event!(Level::INFO, event, correlation_id, &slots);
        } else if level == Level::DEBUG {
            gate_event!(Level::DEBUG, event, correlation_id, &slots);
        } else {
            gate_event!(Level::TRACE, event, correlation_id, &slots);
        }
    }
}

/// One captured event.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Severity.
    pub level: Level,
    /// Event name.
    pub event: String,
    /// Invocation the event belongs to.
    pub correlation_id: CorrelationId,
    /// Structured fields.
    pub fields: EventFields,
}

impl RecordedEvent {
    /// Returns a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Captures events in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingSink {
    /// Creates an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of every captured event.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.lock().clone()
    }

    /// Returns captured events with the given name.
    #[must_use]
    pub fn named(&self, event: &str) -> Vec<RecordedEvent> {
        self.lock()
            .iter()
            .filter(|e| e.event == event)
            .cloned()
            .collect()
    }

    /// Returns captured events for one invocation.
    #[must_use]
    pub fn for_correlation(&self, correlation_id: &CorrelationId) -> Vec<RecordedEvent> {
        self.lock()
            .iter()
            .filter(|e| &e.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    /// Discards captured events.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RecordedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ObservabilitySink for RecordingSink {
    fn emit(&self, level: Level, event: &str, correlation_id: &CorrelationId, fields: &EventFields) {
        self.lock().push(RecordedEvent {
            level,
            event: event.to_string(),
            correlation_id: correlation_id.clone(),
            fields: fields.clone(),
        });
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ObservabilitySink>>,
}

impl FanoutSink {
    /// Creates a fan-out over the given sinks.
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn ObservabilitySink>>) -> Self {
        Self { sinks }
    }

    /// Adds a sink.
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl ObservabilitySink for FanoutSink {
    fn emit(&self, level: Level, event: &str, correlation_id: &CorrelationId, fields: &EventFields) {
        for sink in &self.sinks {
            sink.emit(level, event, correlation_id, fields);
        }
    }
}

// ============================================================================
// Emitter
// ============================================================================

/// Builds the gate's events and keeps metrics in step with them.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn ObservabilitySink>,
    metrics: Option<GateMetrics>,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl Emitter {
    /// Creates an emitter over `sink`, optionally recording metrics.
    #[must_use]
    pub fn new(sink: Arc<dyn ObservabilitySink>, metrics: Option<GateMetrics>) -> Self {
        Self { sink, metrics }
    }

    /// Returns the gate metrics, if any.
    #[must_use]
    pub const fn metrics(&self) -> Option<&GateMetrics> {
        self.metrics.as_ref()
    }

    fn emit(&self, level: Level, event: &str, correlation_id: &CorrelationId, fields: Value) {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.sink.emit(level, event, correlation_id, &fields);
    }

    pub(crate) fn started(
        &self,
        correlation_id: &CorrelationId,
        principal: &PrincipalId,
        identity_verified: bool,
        policy: PolicyMode,
        stores: usize,
    ) {
        self.emit(
            Level::INFO,
            events::STARTED,
            correlation_id,
            json!({
                "principal_fingerprint": principal.fingerprint(),
                "identity_verified": identity_verified,
                "policy": policy.as_str(),
                "stores": stores,
            }),
        );
    }

    pub(crate) fn correlation_id_rejected(&self, correlation_id: &CorrelationId, err: &IdError) {
        self.emit(
            Level::WARN,
            events::CORRELATION_ID_REJECTED,
            correlation_id,
            json!({ "reason": err.to_string() }),
        );
    }

    pub(crate) fn store_check(
        &self,
        correlation_id: &CorrelationId,
        attempt_index: u32,
        record: &LinkageRecord,
        error_kind: Option<&str>,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.store_check_observed(
                &record.store_name,
                record.status.as_str(),
                record.query_duration.as_secs_f64(),
            );
        }
        let mut fields = json!({
            "attempt_index": attempt_index,
            "store": record.store_name,
            "required": record.required,
            "status": record.status.as_str(),
            "duration_ms": millis(record.query_duration),
        });
        if let (Some(kind), Value::Object(map)) = (error_kind, &mut fields) {
            map.insert("error_kind".to_string(), Value::from(kind));
        }
        self.emit(Level::DEBUG, events::STORE_CHECK, correlation_id, fields);
    }

    pub(crate) fn attempt(&self, correlation_id: &CorrelationId, metrics: &AttemptMetrics) {
        self.emit(
            Level::DEBUG,
            events::ATTEMPT,
            correlation_id,
            json!({
                "attempt_index": metrics.attempt_index,
                "outcome": metrics.outcome.as_str(),
                "timed_out": metrics.timed_out,
                "errored": metrics.errored,
                "query_ms": millis(metrics.query_duration),
                "total_ms": millis(metrics.total_duration),
            }),
        );
    }

    pub(crate) fn deadline_exceeded(
        &self,
        correlation_id: &CorrelationId,
        attempts: usize,
        elapsed: Duration,
        deadline: Duration,
    ) {
        self.emit(
            Level::WARN,
            events::DEADLINE_EXCEEDED,
            correlation_id,
            json!({
                "attempts": attempts,
                "elapsed_ms": millis(elapsed),
                "deadline_ms": millis(deadline),
            }),
        );
    }

    pub(crate) fn decision(
        &self,
        correlation_id: &CorrelationId,
        decision: &GateDecision,
        outcome: ConsistencyOutcome,
        degraded: bool,
        attempts: usize,
        elapsed: Duration,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.decision_recorded(
                decision.as_str(),
                outcome.as_str(),
                attempts,
                elapsed.as_secs_f64(),
            );
        }
        self.emit(
            Level::INFO,
            events::DECISION,
            correlation_id,
            json!({
                "decision": decision.as_str(),
                "outcome": outcome.as_str(),
                "degraded": degraded,
                "attempts": attempts,
                "elapsed_ms": millis(elapsed),
            }),
        );
    }

    pub(crate) fn cancelled(&self, correlation_id: &CorrelationId, attempts: usize, elapsed: Duration) {
        self.emit(
            Level::WARN,
            events::CANCELLED,
            correlation_id,
            json!({
                "attempts": attempts,
                "elapsed_ms": millis(elapsed),
            }),
        );
    }

    pub(crate) fn degraded_allow(&self, correlation_id: &CorrelationId, attempts: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.degraded_allow();
        }
        self.emit(
            Level::WARN,
            events::DEGRADED_ALLOW,
            correlation_id,
            json!({
                "outcome": ConsistencyOutcome::Indeterminate.as_str(),
                "policy": PolicyMode::FailOpen.as_str(),
                "attempts": attempts,
            }),
        );
    }

    pub(crate) fn recovery_enqueued(&self, correlation_id: &CorrelationId) {
        self.count_recovery("enqueued");
        self.emit(
            Level::INFO,
            events::RECOVERY_ENQUEUED,
            correlation_id,
            json!({}),
        );
    }

    pub(crate) fn recovery_dropped(&self, correlation_id: &CorrelationId, reason: &str) {
        self.count_recovery("dropped");
        self.emit(
            Level::WARN,
            events::RECOVERY_DROPPED,
            correlation_id,
            json!({ "reason": reason }),
        );
    }

    pub(crate) fn recovery_completed(&self, correlation_id: &CorrelationId) {
        self.count_recovery("completed");
        self.emit(
            Level::INFO,
            events::RECOVERY_COMPLETED,
            correlation_id,
            json!({}),
        );
    }

    pub(crate) fn recovery_failed(&self, correlation_id: &CorrelationId, reason: &str) {
        self.count_recovery("failed");
        self.emit(
            Level::ERROR,
            events::RECOVERY_FAILED,
            correlation_id,
            json!({ "reason": reason }),
        );
    }

    fn count_recovery(&self, status: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.recovery_trigger(status);
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
