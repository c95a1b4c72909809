//! Shared SQLite connections
//!
//! Every storage of a space talks to the same database file. Instead of each
//! storage opening its own handle, they all hold an `Arc<SharedConnection>`
//! handed out by a [`ConnectionPool`] under the space's share id, and the
//! connection counts references:
//!
//! - the first `connect()` performs the native open
//! - later `connect()` calls reuse the open handle
//! - the last `disconnect()` closes it
//!
//! Opening and closing happen under a lifecycle lock, so a caller arriving
//! while an open is in flight waits for that open instead of racing a second
//! one. A failed open leaves the connection retryable.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Serialize, Serializer};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::{StoreError, StoreResult};
use super::schema::{init_schema, needs_init};
use crate::identity::SpaceIdentity;

/// Lifecycle state of a shared connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Never connected
    Idle,
    /// Native open in progress
    Connecting,
    /// Handle open and usable
    Connected,
    /// Last reference released, close in progress
    Disconnecting,
    /// Handle closed; a new connect re-opens it
    Closed,
    /// Last open or close failed
    Error(String),
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnecting => "disconnecting",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Error(_) => "error",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ConnectionStatus::Error(details) => Some(details),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ConnectionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// An open SQLite database for one space
///
/// All access goes through [`NativeDb::call`], which runs the closure on the
/// blocking thread pool while holding the connection mutex. Calls therefore
/// serialize per database.
pub struct NativeDb {
    share_id: String,
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl NativeDb {
    /// Create the parent directory, open the file and initialize the schema
    fn open(share_id: String, path: PathBuf) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        Ok(Self {
            share_id,
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool
    ///
    /// Fails with [`StoreError::NotConnected`] once the handle was closed.
    pub async fn call<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let share_id = self.share_id.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            let conn = guard
                .as_mut()
                .ok_or(StoreError::NotConnected { share_id })?;
            f(conn)
        })
        .await?
    }

    async fn close(&self) -> StoreResult<()> {
        let conn = Arc::clone(&self.conn);
        let share_id = self.share_id.clone();
        tokio::task::spawn_blocking(move || match conn.lock().take() {
            Some(conn) => conn.close().map_err(|(_, e)| StoreError::Connection {
                share_id,
                details: e.to_string(),
            }),
            None => Ok(()),
        })
        .await?
    }
}

impl fmt::Debug for NativeDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeDb")
            .field("share_id", &self.share_id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Lifecycle {
    db: Option<Arc<NativeDb>>,
    /// Attempt number and message of the last failed open
    last_failure: Option<(u64, String)>,
}

/// Reference-counted owner of one [`NativeDb`]
pub struct SharedConnection {
    share_id: String,
    path: PathBuf,
    refs: AtomicUsize,
    /// Number of completed open attempts
    attempts: AtomicU64,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    current: RwLock<Option<Arc<NativeDb>>>,
    status: watch::Sender<ConnectionStatus>,
}

impl SharedConnection {
    pub fn new(share_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Idle);
        Self {
            share_id: share_id.into(),
            path: path.into(),
            refs: AtomicUsize::new(0),
            attempts: AtomicU64::new(0),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            current: RwLock::new(None),
            status,
        }
    }

    pub fn share_id(&self) -> &str {
        &self.share_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of holders that connected and have not disconnected yet
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Watch status transitions
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Current handle, if the connection is open
    pub fn db(&self) -> StoreResult<Arc<NativeDb>> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| StoreError::NotConnected {
                share_id: self.share_id.clone(),
            })
    }

    /// Take a reference, opening the database if this is the first one
    pub async fn connect(&self) -> StoreResult<Arc<NativeDb>> {
        let seen_attempts = self.attempts.load(Ordering::Acquire);
        let mut lifecycle = self.lifecycle.lock().await;

        if let Some(db) = &lifecycle.db {
            let refs = self.refs.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(share_id = %self.share_id, refs, "reusing shared connection");
            return Ok(Arc::clone(db));
        }

        // An attempt finished while we were waiting on the lock and failed:
        // report that failure instead of opening again.
        if let Some((attempt, details)) = &lifecycle.last_failure {
            if *attempt > seen_attempts {
                return Err(StoreError::Connection {
                    share_id: self.share_id.clone(),
                    details: details.clone(),
                });
            }
        }

        self.set_status(ConnectionStatus::Connecting);
        let share_id = self.share_id.clone();
        let path = self.path.clone();
        let opened = tokio::task::spawn_blocking(move || NativeDb::open(share_id, path))
            .await
            .map_err(StoreError::from)
            .and_then(|result| result);
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;

        match opened {
            Ok(db) => {
                let db = Arc::new(db);
                lifecycle.db = Some(Arc::clone(&db));
                lifecycle.last_failure = None;
                *self.current.write() = Some(Arc::clone(&db));
                self.refs.fetch_add(1, Ordering::AcqRel);
                self.set_status(ConnectionStatus::Connected);
                info!(share_id = %self.share_id, path = %self.path.display(), "[nbstore] connection established");
                Ok(db)
            }
            Err(e) => {
                let details = e.to_string();
                warn!(share_id = %self.share_id, error = %details, "[nbstore] connection failed");
                lifecycle.last_failure = Some((attempt, details.clone()));
                self.set_status(ConnectionStatus::Error(details.clone()));
                Err(StoreError::Connection {
                    share_id: self.share_id.clone(),
                    details,
                })
            }
        }
    }

    /// Release a reference, closing the database when it was the last one
    ///
    /// Releasing without holding a reference is a no-op.
    pub async fn disconnect(&self) -> StoreResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;

        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Err(_) => {
                debug!(share_id = %self.share_id, "disconnect without references ignored");
                return Ok(());
            }
            Ok(n) if n > 1 => {
                debug!(share_id = %self.share_id, refs = n - 1, "released shared connection");
                return Ok(());
            }
            Ok(_) => {}
        }

        let Some(db) = lifecycle.db.take() else {
            return Ok(());
        };
        *self.current.write() = None;

        self.set_status(ConnectionStatus::Disconnecting);
        match db.close().await {
            Ok(()) => {
                self.set_status(ConnectionStatus::Closed);
                info!(share_id = %self.share_id, "[nbstore] connection closed");
                Ok(())
            }
            Err(e) => {
                let details = e.to_string();
                warn!(share_id = %self.share_id, error = %details, "[nbstore] close failed");
                self.set_status(ConnectionStatus::Error(details.clone()));
                Err(StoreError::Connection {
                    share_id: self.share_id.clone(),
                    details,
                })
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }
}

impl fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedConnection")
            .field("share_id", &self.share_id)
            .field("refs", &self.ref_count())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Hands out one [`SharedConnection`] per share id
///
/// The pool only keeps weak references: once every storage holding a
/// connection is dropped, the entry is pruned on the next [`share`](Self::share).
#[derive(Clone, Default)]
pub struct ConnectionPool {
    connections: Arc<Mutex<HashMap<String, Weak<SharedConnection>>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the live connection for `identity`, creating it if needed
    pub fn share(&self, identity: &SpaceIdentity, base_dir: &Path) -> Arc<SharedConnection> {
        let share_id = identity.share_id();
        let mut connections = self.connections.lock();

        if let Some(existing) = connections.get(&share_id).and_then(Weak::upgrade) {
            debug!(share_id = %share_id, "sharing existing connection");
            return existing;
        }

        connections.retain(|_, conn| conn.strong_count() > 0);
        let conn = Arc::new(SharedConnection::new(
            share_id.clone(),
            identity.db_path(base_dir),
        ));
        connections.insert(share_id, Arc::downgrade(&conn));
        conn
    }

    /// Number of connections still referenced by some storage
    pub fn live_connections(&self) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|conn| conn.strong_count() > 0)
            .count()
    }
}
