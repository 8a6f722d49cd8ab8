//! Recovery trigger dispatch.
//!
//! A `BlockRecover` decision asks an external collaborator (for example, the
//! email sender) to start account recovery. The gate never waits for it:
//! requests are pushed with `try_send` onto a bounded queue drained by a
//! detached worker, and every failure is reported through the emitter only.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use linkgate_core::{CorrelationId, PrincipalId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::emitter::Emitter;

/// Failure reported by a [`RecoveryTrigger`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    /// The collaborator refused the request.
    #[error("recovery request rejected: {0}")]
    Rejected(String),

    /// The collaborator could not be reached.
    #[error("recovery collaborator unavailable: {0}")]
    Unavailable(String),
}

/// External collaborator that starts account recovery.
#[async_trait]
pub trait RecoveryTrigger: Send + Sync {
    /// Starts recovery for `principal`.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError`] when the request could not be started.
    async fn initiate_recovery(
        &self,
        principal: &PrincipalId,
        correlation_id: &CorrelationId,
    ) -> Result<(), RecoveryError>;
}

/// Trigger that only records the request in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRecoveryTrigger;

#[async_trait]
impl RecoveryTrigger for LoggingRecoveryTrigger {
    async fn initiate_recovery(
        &self,
        principal: &PrincipalId,
        correlation_id: &CorrelationId,
    ) -> Result<(), RecoveryError> {
        info!(
            correlation_id = %correlation_id,
            principal_fingerprint = %principal.fingerprint(),
            "account recovery requested"
        );
        Ok(())
    }
}

/// Returned with a `BlockRecover` decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryHandle {
    /// Correlation id the recovery request carries.
    pub correlation_id: CorrelationId,
    /// Whether the request reached the dispatcher queue.
    pub enqueued: bool,
}

#[derive(Debug)]
struct RecoveryRequest {
    principal: PrincipalId,
    correlation_id: CorrelationId,
}

/// Bounded, fire-and-forget queue in front of a [`RecoveryTrigger`].
///
/// The worker exits once every dispatcher clone has been dropped and the
/// queue has drained.
#[derive(Clone)]
pub struct RecoveryDispatcher {
    tx: mpsc::Sender<RecoveryRequest>,
    emitter: Arc<Emitter>,
}

impl fmt::Debug for RecoveryDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryDispatcher")
            .field("capacity", &self.tx.max_capacity())
            .field("available", &self.tx.capacity())
            .finish()
    }
}

impl RecoveryDispatcher {
    /// Spawns the worker onto the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime or with a zero `capacity`.
    #[must_use]
    pub fn spawn(
        trigger: Arc<dyn RecoveryTrigger>,
        capacity: usize,
        emitter: Arc<Emitter>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RecoveryRequest>(capacity);
        let worker_emitter = Arc::clone(&emitter);
        let worker = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match trigger
                    .initiate_recovery(&request.principal, &request.correlation_id)
                    .await
                {
                    Ok(()) => worker_emitter.recovery_completed(&request.correlation_id),
                    Err(err) => {
                        worker_emitter.recovery_failed(&request.correlation_id, &err.to_string());
                    },
                }
            }
        });
        (Self { tx, emitter }, worker)
    }

    /// Queues a recovery request without waiting.
    ///
    /// Returns `false` (and emits a warning) when the queue is full or the
    /// worker has stopped.
    pub fn enqueue(&self, principal: &PrincipalId, correlation_id: &CorrelationId) -> bool {
        let request = RecoveryRequest {
            principal: principal.clone(),
            correlation_id: correlation_id.clone(),
        };
        match self.tx.try_send(request) {
            Ok(()) => {
                self.emitter.recovery_enqueued(correlation_id);
                true
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.emitter.recovery_dropped(correlation_id, "queue_full");
                false
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.emitter.recovery_dropped(correlation_id, "worker_stopped");
                false
            },
        }
    }
}
