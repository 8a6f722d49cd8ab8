//! SQLite-backed linkage store.
//!
//! Runs `SELECT 1 FROM <table> WHERE <column> = ?1 LIMIT 1` on a shared
//! connection inside `spawn_blocking`. rusqlite errors are mapped to
//! [`Presence`] / [`StoreError`] here and nowhere else:
//!
//! | rusqlite | result |
//! |----------|--------|
//! | `QueryReturnedNoRows` | `Ok(Absent)` |
//! | `PermissionDenied`, `AuthorizationForStatementDenied`, `ReadOnly` | `PermissionDenied` |
//! | `DatabaseBusy`, `DatabaseLocked` | `Unavailable` |
//! | `CannotOpen`, `SystemIoFailure`, `DiskFull` | `Io` |
//! | anything else (including "no such table") | `Backend` |
//!
//! # Cancellation
//!
//! The blocking query cannot be aborted with its task, so dropping the
//! [`LinkageStore::exists`] future cancels the check explicitly:
//!
//! - a check still waiting for the connection never runs its query;
//! - a check waiting on a locked database stops retrying at the next busy
//!   callback;
//! - a running statement is interrupted with `sqlite3_interrupt`.
//!
//! The interrupt is only raised while the cancelled check owns the connection,
//! so concurrent checks sharing it are unaffected. Either way the connection
//! lock is released promptly for the next attempt.

use std::cell::RefCell;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use linkgate_core::PrincipalId;
use linkgate_core::config::is_sql_identifier;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use tracing::debug;

use super::{LinkageStore, Presence, StoreError};

/// Default time a check keeps retrying against a locked database.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(100);

/// Sleep between busy retries.
const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// [`LinkageStore`] over one SQLite table.
pub struct SqliteLinkageStore {
    name: String,
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    query: String,
    busy_timeout: Duration,
}

impl fmt::Debug for SqliteLinkageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteLinkageStore")
            .field("name", &self.name)
            .field("query", &self.query)
            .field("busy_timeout", &self.busy_timeout)
            .finish_non_exhaustive()
    }
}

impl SqliteLinkageStore {
    /// Creates a store over an existing shared connection.
    ///
    /// Installs the store's busy handler on the connection, replacing any
    /// configured busy timeout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if `table` or `column` is not a plain
    /// SQL identifier or the connection lock is poisoned.
    pub fn new(
        name: impl Into<String>,
        conn: Arc<Mutex<Connection>>,
        table: &str,
        column: &str,
    ) -> Result<Self, StoreError> {
        for (field, value) in [("table", table), ("column", column)] {
            if !is_sql_identifier(value) {
                return Err(StoreError::Backend(format!(
                    "{field} '{value}' is not a plain SQL identifier"
                )));
            }
        }
        let interrupt = {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::Backend(format!("connection lock poisoned: {e}")))?;
            guard
                .busy_handler(Some(retry_while_busy))
                .map_err(map_error)?;
            Arc::new(guard.get_interrupt_handle())
        };
        Ok(Self {
            name: name.into(),
            conn,
            interrupt,
            query: format!("SELECT 1 FROM \"{table}\" WHERE \"{column}\" = ?1 LIMIT 1"),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    /// Opens `path` read-only and creates a store over it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be opened or the
    /// identifiers are invalid.
    pub fn open(
        name: impl Into<String>,
        path: &Path,
        table: &str,
        column: &str,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(map_error)?;
        Self::new(name, Arc::new(Mutex::new(conn)), table, column)
    }

    /// Sets how long a check keeps retrying against a locked database.
    #[must_use]
    pub const fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Returns the shared connection.
    #[must_use]
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }
}

#[async_trait]
impl LinkageStore for SqliteLinkageStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, principal: &PrincipalId) -> Result<Presence, StoreError> {
        let conn = Arc::clone(&self.conn);
        let query = self.query.clone();
        let key = principal.as_str().to_string();
        let busy_timeout = self.busy_timeout;
        let mut cancel = CancelOnDrop::new(Arc::clone(&self.interrupt));
        let check = cancel.check();

        let joined = tokio::task::spawn_blocking(move || {
            let conn_guard = conn
                .lock()
                .map_err(|e| StoreError::Backend(format!("connection lock poisoned: {e}")))?;
            if !check.begin() {
                return Err(StoreError::Unavailable(
                    "check cancelled before it ran".to_string(),
                ));
            }
            let result = {
                let _busy = BusyScope::enter(Arc::clone(&check), busy_timeout);
                run_query(&conn_guard, &query, &key)
            };
            // Still holding the connection, so a late interrupt cannot reach
            // the next check's statement.
            check.finish();
            result
        })
        .await;
        cancel.disarm();

        joined.map_err(|e| StoreError::Backend(format!("spawn_blocking failed: {e}")))?
    }
}

fn run_query(conn: &Connection, query: &str, key: &str) -> Result<Presence, StoreError> {
    let mut stmt = conn.prepare_cached(query).map_err(map_error)?;
    match stmt.query_row([key], |_| Ok(())) {
        Ok(()) => Ok(Presence::Found),
        Err(err) => absent_or_error(err),
    }
}

// ============================================================================
// Cancellation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckPhase {
    Pending,
    Running,
    Finished,
    Cancelled,
}

/// Phase of one check, shared by the async caller and the blocking worker.
#[derive(Debug)]
struct CheckState(Mutex<CheckPhase>);

impl CheckState {
    fn phase(&self) -> std::sync::MutexGuard<'_, CheckPhase> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves `Pending` to `Running`. Returns `false` if already cancelled.
    fn begin(&self) -> bool {
        let mut phase = self.phase();
        if *phase == CheckPhase::Cancelled {
            return false;
        }
        *phase = CheckPhase::Running;
        true
    }

    fn finish(&self) {
        *self.phase() = CheckPhase::Finished;
    }

    fn is_cancelled(&self) -> bool {
        *self.phase() == CheckPhase::Cancelled
    }

    /// Marks the check cancelled, interrupting its statement if it is running.
    fn cancel(&self, interrupt: &InterruptHandle) {
        let mut phase = self.phase();
        match *phase {
            CheckPhase::Running => {
                interrupt.interrupt();
                *phase = CheckPhase::Cancelled;
            },
            CheckPhase::Pending => *phase = CheckPhase::Cancelled,
            CheckPhase::Finished | CheckPhase::Cancelled => {},
        }
    }
}

/// Cancels the blocking check unless disarmed after it completed.
struct CancelOnDrop {
    check: Arc<CheckState>,
    interrupt: Arc<InterruptHandle>,
    armed: bool,
}

impl CancelOnDrop {
    fn new(interrupt: Arc<InterruptHandle>) -> Self {
        Self {
            check: Arc::new(CheckState(Mutex::new(CheckPhase::Pending))),
            interrupt,
            armed: true,
        }
    }

    fn check(&self) -> Arc<CheckState> {
        Arc::clone(&self.check)
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.check.cancel(&self.interrupt);
        }
    }
}

struct BusyContext {
    check: Arc<CheckState>,
    give_up_at: std::time::Instant,
}

thread_local! {
    /// Check being run by this blocking thread, read by [`retry_while_busy`].
    static BUSY_CONTEXT: RefCell<Option<BusyContext>> = const { RefCell::new(None) };
}

/// Installs the busy context for the current thread until dropped.
struct BusyScope;

impl BusyScope {
    fn enter(check: Arc<CheckState>, busy_timeout: Duration) -> Self {
        BUSY_CONTEXT.with(|ctx| {
            *ctx.borrow_mut() = Some(BusyContext {
                check,
                give_up_at: std::time::Instant::now() + busy_timeout,
            });
        });
        Self
    }
}

impl Drop for BusyScope {
    fn drop(&mut self) {
        BUSY_CONTEXT.with(|ctx| ctx.borrow_mut().take());
    }
}

/// SQLite busy callback: keeps retrying until the busy timeout expires or the
/// check is cancelled. Outside a check it gives up immediately.
fn retry_while_busy(_retries: i32) -> bool {
    BUSY_CONTEXT.with(|ctx| match ctx.borrow().as_ref() {
        Some(busy)
            if !busy.check.is_cancelled() && std::time::Instant::now() < busy.give_up_at =>
        {
            std::thread::sleep(BUSY_POLL_INTERVAL);
            true
        },
        _ => false,
    })
}

fn absent_or_error(err: rusqlite::Error) -> Result<Presence, StoreError> {
    if matches!(err, rusqlite::Error::QueryReturnedNoRows) {
        Ok(Presence::Absent)
    } else {
        Err(map_error(err))
    }
}

fn map_error(err: rusqlite::Error) -> StoreError {
    let mapped = match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::PermissionDenied
            | ErrorCode::AuthorizationForStatementDenied
            | ErrorCode::ReadOnly => StoreError::PermissionDenied(err.to_string()),
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                StoreError::Unavailable(err.to_string())
            },
            ErrorCode::CannotOpen | ErrorCode::SystemIoFailure | ErrorCode::DiskFull => {
                StoreError::Io(err.to_string())
            },
            _ => StoreError::Backend(err.to_string()),
        },
        _ => StoreError::Backend(err.to_string()),
    };
    debug!(kind = mapped.kind(), "sqlite linkage check failed");
    mapped
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn principal(id: &str) -> PrincipalId {
        PrincipalId::new(id).unwrap()
    }

    fn seeded_db() -> (TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("app.db");
        let conn = Connection::open(&path).expect("open sqlite");
        conn.execute_batch(
            "CREATE TABLE company_members (company_id TEXT NOT NULL, user_id TEXT NOT NULL);
             CREATE TABLE profiles (id TEXT PRIMARY KEY);
             INSERT INTO company_members VALUES ('c-1', 'P2');
             INSERT INTO profiles VALUES ('P2');",
        )
        .expect("seed schema");
        (dir, path)
    }

    #[tokio::test]
    async fn found_and_absent_rows() {
        let (_dir, path) = seeded_db();
        let store = SqliteLinkageStore::open("orgs", &path, "company_members", "user_id").unwrap();

        assert_eq!(store.exists(&principal("P2")).await, Ok(Presence::Found));
        assert_eq!(store.exists(&principal("P1")).await, Ok(Presence::Absent));
    }

    #[tokio::test]
    async fn missing_table_is_an_error_not_absence() {
        let (_dir, path) = seeded_db();
        let store = SqliteLinkageStore::open("admins", &path, "company_admins", "user_id").unwrap();

        let result = store.exists(&principal("P1")).await;
        assert!(matches!(result, Err(StoreError::Backend(_))), "{result:?}");
    }

    #[tokio::test]
    async fn missing_database_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = SqliteLinkageStore::open(
            "orgs",
            &dir.path().join("absent.db"),
            "company_members",
            "user_id",
        );
        assert!(matches!(result, Err(StoreError::Io(_))), "{result:?}");
    }

    #[tokio::test]
    async fn abandoned_check_releases_the_connection() {
        let (_dir, path) = seeded_db();
        let writer = Connection::open(&path).unwrap();
        writer.execute_batch("BEGIN EXCLUSIVE").unwrap();
        let store = SqliteLinkageStore::open("orgs", &path, "company_members", "user_id")
            .unwrap()
            .with_busy_timeout(Duration::from_secs(2));

        let attempt =
            tokio::time::timeout(Duration::from_millis(20), store.exists(&principal("P2"))).await;
        assert!(attempt.is_err(), "{attempt:?}");

        // The worker stops waiting on the lock instead of sitting out the 2s
        // busy timeout with the connection held.
        let conn = store.connection();
        let started = std::time::Instant::now();
        tokio::task::spawn_blocking(move || drop(conn.lock().unwrap()))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());

        writer.execute_batch("COMMIT").unwrap();
        assert_eq!(store.exists(&principal("P2")).await, Ok(Presence::Found));
    }

    #[tokio::test]
    async fn locked_database_is_unavailable_after_busy_timeout() {
        let (_dir, path) = seeded_db();
        let writer = Connection::open(&path).unwrap();
        writer.execute_batch("BEGIN EXCLUSIVE").unwrap();
        let store = SqliteLinkageStore::open("orgs", &path, "company_members", "user_id")
            .unwrap()
            .with_busy_timeout(Duration::from_millis(30));

        let result = store.exists(&principal("P2")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))), "{result:?}");
    }

    #[tokio::test]
    async fn rejects_non_identifier_table_names() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let result = SqliteLinkageStore::new("orgs", conn, "t; DROP TABLE x", "user_id");
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }

    #[test]
    fn busy_database_maps_to_unavailable() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        assert!(matches!(map_error(err), StoreError::Unavailable(_)));

        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_PERM),
            None,
        );
        assert!(matches!(map_error(err), StoreError::PermissionDenied(_)));
    }

    #[test]
    fn no_rows_is_absence() {
        assert_eq!(
            absent_or_error(rusqlite::Error::QueryReturnedNoRows),
            Ok(Presence::Absent)
        );
    }
}
