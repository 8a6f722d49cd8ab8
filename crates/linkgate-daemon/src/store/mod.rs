//! Linkage store collaborator interface.
//!
//! Each store answers one narrow question: does a row keyed by this
//! principal exist? Adapters decide, once and at the adapter boundary,
//! whether a backend failure means "definitely absent" ([`Presence::Absent`])
//! or "could not determine" ([`StoreError`]). Nothing downstream re-parses
//! backend error text.

mod memory;
mod sqlite;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use linkgate_core::PrincipalId;
use thiserror::Error;

pub use memory::{InMemoryLinkageStore, ScriptedFailure};
pub use sqlite::SqliteLinkageStore;

/// Definitive answer from a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// A row exists.
    Found,
    /// No row exists.
    Absent,
}

/// Failure to determine existence. Never means "no such row".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Transport or filesystem failure.
    #[error("store I/O failure: {0}")]
    Io(String),

    /// The gate's credentials may not read the store.
    #[error("store permission denied: {0}")]
    PermissionDenied(String),

    /// Store is busy, locked or otherwise temporarily unavailable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure.
    #[error("store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns the metric/log label for the error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Unavailable(_) => "unavailable",
            Self::Backend(_) => "backend",
        }
    }
}

/// A linkage store the gate probes.
///
/// Implementations perform a single bounded read and must release any
/// borrowed connection when the returned future is dropped, since the probe
/// drops in-flight checks at the attempt deadline.
#[async_trait]
pub trait LinkageStore: Send + Sync {
    /// Store name used in records, logs and metrics.
    fn name(&self) -> &str;

    /// Checks whether a row for `principal` exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when existence cannot be determined.
    async fn exists(&self, principal: &PrincipalId) -> Result<Presence, StoreError>;
}

/// A configured store together with its requirement flag.
#[derive(Clone)]
pub struct StoreRef {
    store: Arc<dyn LinkageStore>,
    required: bool,
}

impl StoreRef {
    /// Wraps a store that must hold a row for consistency.
    pub fn required(store: Arc<dyn LinkageStore>) -> Self {
        Self {
            store,
            required: true,
        }
    }

    /// Wraps a store whose row is optional.
    pub fn optional(store: Arc<dyn LinkageStore>) -> Self {
        Self {
            store,
            required: false,
        }
    }

    /// Wraps a store with an explicit requirement flag.
    pub fn new(store: Arc<dyn LinkageStore>, required: bool) -> Self {
        Self { store, required }
    }

    /// Store name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Whether a row is required.
    #[must_use]
    pub const fn is_required(&self) -> bool {
        self.required
    }

    pub(crate) fn store(&self) -> Arc<dyn LinkageStore> {
        Arc::clone(&self.store)
    }
}

impl fmt::Debug for StoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRef")
            .field("name", &self.name())
            .field("required", &self.required)
            .finish()
    }
}
