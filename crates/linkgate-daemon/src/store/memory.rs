//! Scripted in-memory linkage store.
//!
//! Used by tests and demos to reproduce every probe branch: rows present or
//! absent, slow checks that outlive the attempt deadline, and transient
//! failures. Each in-flight check holds a resource guard so callers can
//! assert that timed-out checks release what they borrowed.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use linkgate_core::PrincipalId;

use super::{LinkageStore, Presence, StoreError};

/// Failure behaviour injected into an [`InMemoryLinkageStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// The next `n` calls fail with the error, then the store recovers.
    Next(u32, StoreError),
    /// Every call fails with the error.
    Always(StoreError),
}

#[derive(Debug, Default)]
struct Script {
    present: HashSet<String>,
    latency: Duration,
    failures: VecDeque<StoreError>,
    always: Option<StoreError>,
}

/// In-memory [`LinkageStore`].
#[derive(Debug)]
pub struct InMemoryLinkageStore {
    name: String,
    script: Mutex<Script>,
    calls: AtomicU64,
    in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight gauge when a check completes or is dropped.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn acquire(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(gauge))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryLinkageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(Script::default()),
            calls: AtomicU64::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Adds rows for the given principals.
    #[must_use]
    pub fn with_principals<I, S>(self, principals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script()
            .present
            .extend(principals.into_iter().map(Into::into));
        self
    }

    /// Sets a latency applied to every check.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Installs a failure script.
    #[must_use]
    pub fn with_failure(self, failure: ScriptedFailure) -> Self {
        self.set_failure(failure);
        self
    }

    /// Adds a row for `principal`.
    pub fn insert(&self, principal: &PrincipalId) {
        self.script().present.insert(principal.as_str().to_string());
    }

    /// Removes the row for `principal`.
    pub fn remove(&self, principal: &PrincipalId) {
        self.script().present.remove(principal.as_str());
    }

    /// Sets the latency applied to every check.
    pub fn set_latency(&self, latency: Duration) {
        self.script().latency = latency;
    }

    /// Replaces the failure script.
    pub fn set_failure(&self, failure: ScriptedFailure) {
        let mut script = self.script();
        script.failures.clear();
        script.always = None;
        match failure {
            ScriptedFailure::Next(n, err) => {
                script.failures.extend((0..n).map(|_| err.clone()));
            },
            ScriptedFailure::Always(err) => script.always = Some(err),
        }
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        let mut script = self.script();
        script.failures.clear();
        script.always = None;
    }

    /// Number of checks started so far.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of checks currently holding a resource.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LinkageStore for InMemoryLinkageStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, principal: &PrincipalId) -> Result<Presence, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard::acquire(&self.in_flight);

        // The script lock is never held across the await.
        let (latency, answer) = {
            let mut script = self.script();
            let answer = if let Some(err) = script.failures.pop_front() {
                Err(err)
            } else if let Some(err) = script.always.clone() {
                Err(err)
            } else if script.present.contains(principal.as_str()) {
                Ok(Presence::Found)
            } else {
                Ok(Presence::Absent)
            };
            (script.latency, answer)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(id: &str) -> PrincipalId {
        PrincipalId::new(id).unwrap()
    }

    #[tokio::test]
    async fn reports_presence() {
        let store = InMemoryLinkageStore::new("orgs").with_principals(["P2"]);
        assert_eq!(store.exists(&principal("P2")).await, Ok(Presence::Found));
        assert_eq!(store.exists(&principal("P1")).await, Ok(Presence::Absent));
        assert_eq!(store.calls(), 2);
        assert_eq!(store.in_flight(), 0);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let store = InMemoryLinkageStore::new("orgs")
            .with_principals(["P2"])
            .with_failure(ScriptedFailure::Next(
                1,
                StoreError::Unavailable("locked".to_string()),
            ));
        assert!(matches!(
            store.exists(&principal("P2")).await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.exists(&principal("P2")).await, Ok(Presence::Found));
    }

    #[tokio::test]
    async fn persistent_failure_until_cleared() {
        let store = InMemoryLinkageStore::new("orgs").with_failure(ScriptedFailure::Always(
            StoreError::PermissionDenied("rls".to_string()),
        ));
        for _ in 0..3 {
            assert!(store.exists(&principal("P1")).await.is_err());
        }
        store.clear_failures();
        assert_eq!(store.exists(&principal("P1")).await, Ok(Presence::Absent));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_check_releases_its_resource() {
        let store = Arc::new(
            InMemoryLinkageStore::new("orgs").with_latency(Duration::from_secs(10)),
        );
        let pending = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.exists(&principal("P1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.in_flight(), 1);

        pending.abort();
        let _ = pending.await;
        assert_eq!(store.in_flight(), 0);
    }
}
