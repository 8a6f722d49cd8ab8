//! linkgate-daemon - async runtime for the post-authentication consistency
//! gate.
//!
//! The gate runs after an identity provider has verified a principal's
//! credentials and before a session is issued:
//!
//! 1. [`probe`]: concurrent existence checks against every linkage store,
//!    bounded by a per-attempt deadline
//! 2. [`retry`]: repeats probe-then-classify while the outcome is
//!    indeterminate, within an attempt budget and an overall deadline
//! 3. policy: maps the terminal outcome to a decision (`linkgate-core`)
//! 4. [`shaper`]: pads the response to a fixed envelope so timing does not
//!    reveal the outcome
//! 5. [`emitter`] / [`metrics`]: structured events and Prometheus metrics
//!    keyed by the correlation id
//!
//! [`gate::ConsistencyGate`] ties these together; [`recovery`] hands
//! `BlockRecover` decisions to an external collaborator without waiting.
//! A [`cancel::CancelToken`] interrupts every wait of one invocation.

pub mod cancel;
pub mod context;
pub mod emitter;
pub mod gate;
pub mod metrics;
pub mod probe;
pub mod recovery;
pub mod retry;
pub mod shaper;
pub mod store;

pub use cancel::CancelToken;
pub use context::CorrelationContext;
pub use emitter::{
    Emitter, EventFields, FanoutSink, ObservabilitySink, RecordedEvent, RecordingSink,
    TracingSink, events,
};
pub use gate::{ConsistencyGate, GateBuildError, GateBuilder, GateReport};
pub use metrics::{GateMetrics, MetricsError, MetricsRegistry};
pub use probe::ConsistencyProbe;
pub use recovery::{
    LoggingRecoveryTrigger, RecoveryDispatcher, RecoveryError, RecoveryHandle, RecoveryTrigger,
};
pub use retry::{RetryController, RetryOutcome};
pub use shaper::TimingShaper;
pub use store::{
    InMemoryLinkageStore, LinkageStore, Presence, ScriptedFailure, SqliteLinkageStore,
    StoreError, StoreRef,
};
