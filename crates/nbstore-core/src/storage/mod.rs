//! Storage layer
//!
//! Each space persists into one SQLite database, accessed by three storages:
//!
//! - **DocStorage**: CRDT update log, snapshots and doc clocks
//! - **BlobStorage**: binary blobs with soft and hard delete
//! - **SyncStorage**: per-peer clock tables used by sync
//!
//! The storages do not own the database. Each holds a [`StorageHandle`]
//! onto the space's [`SharedConnection`], and the connection decides when the
//! file is actually opened or closed. The [`Storage`] trait exposes that
//! handle uniformly so a space can drive all three the same way.

pub mod blob;
pub mod connection;
pub mod doc;
pub mod error;
pub mod schema;
pub mod sync;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use blob::BlobStorage;
pub use connection::{ConnectionPool, ConnectionStatus, NativeDb, SharedConnection};
pub use doc::DocStorage;
pub use error::{StoreError, StoreResult};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use sync::SyncStorage;

use crate::models::datetime_from_millis;

/// The storages composed into a space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Doc,
    Blob,
    Sync,
}

impl StorageType {
    pub const ALL: [StorageType; 3] = [StorageType::Doc, StorageType::Blob, StorageType::Sync];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Doc => "doc",
            StorageType::Blob => "blob",
            StorageType::Sync => "sync",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common surface of the storages composed into a space
pub trait Storage: Send + Sync {
    fn handle(&self) -> &StorageHandle;

    fn storage_type(&self) -> StorageType {
        self.handle().storage_type()
    }
}

impl Storage for DocStorage {
    fn handle(&self) -> &StorageHandle {
        DocStorage::handle(self)
    }
}

impl Storage for BlobStorage {
    fn handle(&self) -> &StorageHandle {
        BlobStorage::handle(self)
    }
}

impl Storage for SyncStorage {
    fn handle(&self) -> &StorageHandle {
        SyncStorage::handle(self)
    }
}

/// One storage's claim on a shared connection
///
/// Tracks whether this storage currently holds a reference, so repeated
/// `connect()`/`disconnect()` calls on the same storage never take or
/// release more than one.
pub struct StorageHandle {
    storage: StorageType,
    connection: Arc<SharedConnection>,
    connected: tokio::sync::Mutex<bool>,
}

impl StorageHandle {
    pub fn new(storage: StorageType, connection: Arc<SharedConnection>) -> Self {
        Self {
            storage,
            connection,
            connected: tokio::sync::Mutex::new(false),
        }
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage
    }

    pub fn connection(&self) -> &Arc<SharedConnection> {
        &self.connection
    }

    /// Whether this storage holds a reference on the connection
    pub async fn is_connected(&self) -> bool {
        *self.connected.lock().await
    }

    pub async fn connect(&self) -> StoreResult<()> {
        self.acquire().await.map(|_| ())
    }

    pub async fn disconnect(&self) -> StoreResult<()> {
        self.release().await.map(|_| ())
    }

    /// Take the reference if not held yet; `true` when this call took it
    pub async fn acquire(&self) -> StoreResult<bool> {
        let mut connected = self.connected.lock().await;
        if *connected {
            return Ok(false);
        }
        self.connection.connect().await?;
        *connected = true;
        Ok(true)
    }

    /// Drop the reference if held; `true` when this call released it
    pub async fn release(&self) -> StoreResult<bool> {
        let mut connected = self.connected.lock().await;
        if !*connected {
            return Ok(false);
        }
        // The reference is gone even if the close itself fails
        *connected = false;
        self.connection.disconnect().await.map(|()| true)
    }

    /// The open database, or `NotConnected`
    pub fn db(&self) -> StoreResult<Arc<NativeDb>> {
        self.connection.db()
    }
}

/// Milliseconds to persist for `timestamp`
///
/// Timestamps with a sub-millisecond part are rejected, since they would not
/// read back equal.
pub(crate) fn timestamp_to_millis(
    what: &'static str,
    timestamp: DateTime<Utc>,
) -> StoreResult<i64> {
    if timestamp.timestamp_subsec_nanos() % 1_000_000 != 0 {
        return Err(StoreError::SubMillisecondTimestamp { what, timestamp });
    }
    Ok(timestamp.timestamp_millis())
}

/// Read a millisecond timestamp column
pub(crate) fn row_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    datetime_from_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

/// Read a nullable millisecond timestamp column
pub(crate) fn row_optional_timestamp(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = row.get(idx)?;
    millis
        .map(|m| datetime_from_millis(m).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, m)))
        .transpose()
}
