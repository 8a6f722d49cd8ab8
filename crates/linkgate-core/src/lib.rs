#![allow(clippy::doc_markdown)]

//! linkgate-core - domain model for the post-authentication consistency gate
//!
//! After an identity provider has verified a principal's credentials, the
//! gate confirms that the application-side linkage records (organization
//! membership, profile rows) exist before access is granted. A principal that
//! is authenticated but lacks those records is an *orphan*, usually left
//! behind by an interrupted multi-step signup.
//!
//! This crate holds everything that does not perform I/O:
//!
//! - [`ids`]: validated [`PrincipalId`] and [`CorrelationId`]
//! - [`model`]: per-check and per-attempt records produced by the probe
//! - [`classify`]: the pure mapping from a [`ProbeResult`] to a
//!   [`ConsistencyOutcome`]
//! - [`policy`]: fail-open / fail-closed decision producing a
//!   [`GateDecision`]
//! - [`backoff`]: the inter-retry delay schedule
//! - [`phase`]: the per-invocation phase machine
//! - [`config`]: TOML configuration surface
//!
//! The async runtime (probing, retries, timing shaping, observability) lives
//! in `linkgate-daemon`.

pub mod backoff;
pub mod classify;
pub mod config;
pub mod ids;
pub mod model;
pub mod phase;
pub mod policy;

pub use backoff::BackoffConfig;
pub use classify::{ConsistencyOutcome, classify};
pub use config::{
    ConfigError, EnvelopeConfig, GateConfig, LinkgateConfig, RecoveryConfig, SqliteStoreConfig,
    StoreConfig,
};
pub use ids::{CorrelationId, IdError, PrincipalId};
pub use model::{AttemptMetrics, CheckStatus, LinkageRecord, ProbeResult};
pub use phase::{GatePhase, first_illegal_transition};
pub use policy::{BlockReason, GateDecision, PolicyMode, PolicyVerdict, decide};
