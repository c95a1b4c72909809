//! Space storage
//!
//! A `SpaceStorage` bundles the doc, blob and sync storages of one space.
//! All three hold the same [`SharedConnection`], so connecting the space
//! opens one database file and the storages reuse it.
//!
//! ## Usage
//!
//! ```ignore
//! let pool = ConnectionPool::new();
//! let space = SpaceStorage::new(identity, &pool, &data_dir, 256);
//! let mut events = space.subscribe();
//!
//! space.connect().await?;
//! space.doc().push_doc_update(DocUpdate::new("doc-1", bin)).await?;
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::document::DocMerger;
use crate::identity::{SpaceIdentity, SpaceType, UniversalId};
use crate::storage::{
    BlobStorage, ConnectionPool, ConnectionStatus, DocStorage, SharedConnection, Storage,
    StorageType, StoreResult, SyncStorage,
};

/// Connection status change of one storage within a space
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub peer: String,
    pub space_type: SpaceType,
    pub space_id: String,
    pub storage: StorageType,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusEvent {
    fn new(identity: &SpaceIdentity, storage: StorageType, status: ConnectionStatus) -> Self {
        let error = status.error().map(str::to_string);
        Self {
            peer: identity.peer.clone(),
            space_type: identity.space_type,
            space_id: identity.space_id.clone(),
            storage,
            status,
            error,
        }
    }
}

/// Borrowed view of one storage, selected by [`StorageType`]
#[derive(Clone, Copy)]
pub enum StorageRef<'a> {
    Doc(&'a DocStorage),
    Blob(&'a BlobStorage),
    Sync(&'a SyncStorage),
}

impl<'a> StorageRef<'a> {
    pub fn storage_type(&self) -> StorageType {
        self.as_storage().storage_type()
    }

    fn as_storage(&self) -> &'a dyn Storage {
        match *self {
            StorageRef::Doc(doc) => doc,
            StorageRef::Blob(blob) => blob,
            StorageRef::Sync(sync) => sync,
        }
    }
}

/// The doc, blob and sync storages of one space
pub struct SpaceStorage {
    identity: SpaceIdentity,
    universal_id: UniversalId,
    connection: Arc<SharedConnection>,
    doc: DocStorage,
    blob: BlobStorage,
    sync: SyncStorage,
    /// Taken on destroy, which ends every subscription
    events: Mutex<Option<broadcast::Sender<StatusEvent>>>,
}

impl SpaceStorage {
    /// Assemble the storages of a space over the pool's shared connection
    ///
    /// Nothing is opened until [`connect`](Self::connect).
    pub fn new(
        identity: SpaceIdentity,
        pool: &ConnectionPool,
        base_dir: &Path,
        event_capacity: usize,
    ) -> Self {
        let connection = pool.share(&identity, base_dir);
        Self::assemble(identity, connection, DocStorage::new, event_capacity)
    }

    /// Like [`new`](Self::new), with a custom doc merger
    pub fn with_merger(
        identity: SpaceIdentity,
        pool: &ConnectionPool,
        base_dir: &Path,
        event_capacity: usize,
        merger: Arc<dyn DocMerger>,
    ) -> Self {
        let connection = pool.share(&identity, base_dir);
        Self::assemble(
            identity,
            connection,
            move |conn| DocStorage::with_merger(conn, merger),
            event_capacity,
        )
    }

    fn assemble(
        identity: SpaceIdentity,
        connection: Arc<SharedConnection>,
        doc: impl FnOnce(Arc<SharedConnection>) -> DocStorage,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            universal_id: identity.universal_id(),
            doc: doc(Arc::clone(&connection)),
            blob: BlobStorage::new(Arc::clone(&connection)),
            sync: SyncStorage::new(Arc::clone(&connection)),
            connection,
            identity,
            events: Mutex::new(Some(events)),
        }
    }

    pub fn identity(&self) -> &SpaceIdentity {
        &self.identity
    }

    pub fn universal_id(&self) -> &UniversalId {
        &self.universal_id
    }

    /// The connection shared by all three storages
    pub fn connection(&self) -> &Arc<SharedConnection> {
        &self.connection
    }

    pub fn doc(&self) -> &DocStorage {
        &self.doc
    }

    pub fn blob(&self) -> &BlobStorage {
        &self.blob
    }

    pub fn sync(&self) -> &SyncStorage {
        &self.sync
    }

    pub fn get(&self, storage: StorageType) -> StorageRef<'_> {
        match storage {
            StorageType::Doc => StorageRef::Doc(&self.doc),
            StorageType::Blob => StorageRef::Blob(&self.blob),
            StorageType::Sync => StorageRef::Sync(&self.sync),
        }
    }

    /// Receive status events of this space
    ///
    /// After [`destroy`](Self::destroy) the returned receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        match self.events.lock().as_ref() {
            Some(events) => events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Whether every storage holds its reference on the connection
    pub async fn is_connected(&self) -> bool {
        for storage in StorageType::ALL {
            if !self.get(storage).as_storage().handle().is_connected().await {
                return false;
            }
        }
        true
    }

    /// Connect doc, blob and sync in order
    ///
    /// The first storage performs the native open; the others reuse it.
    /// Already connected storages are skipped. Stops at the first failure
    /// after reporting it.
    pub async fn connect(&self) -> StoreResult<()> {
        for storage in StorageType::ALL {
            let handle = self.get(storage).as_storage().handle();
            match handle.acquire().await {
                Ok(true) => self.emit(storage, ConnectionStatus::Connected),
                Ok(false) => {}
                Err(e) => {
                    self.emit(storage, ConnectionStatus::Error(e.to_string()));
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Release the references this space holds
    ///
    /// Every storage is released even if one fails; the first error is
    /// returned. The file stays open while other holders remain.
    pub async fn disconnect(&self) -> StoreResult<()> {
        let mut first_error = None;
        for storage in StorageType::ALL {
            let handle = self.get(storage).as_storage().handle();
            match handle.release().await {
                Ok(true) => self.emit(storage, ConnectionStatus::Closed),
                Ok(false) => {}
                Err(e) => {
                    self.emit(storage, ConnectionStatus::Error(e.to_string()));
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Disconnect and end every status subscription
    ///
    /// Teardown failures are logged, never returned.
    pub async fn destroy(&self) {
        if let Err(e) = self.disconnect().await {
            error!(universal_id = %self.universal_id, error = %e, "[nbstore] destroy store failed");
        }
        if self.events.lock().take().is_some() {
            debug!(universal_id = %self.universal_id, "space status stream closed");
        }
    }

    fn emit(&self, storage: StorageType, status: ConnectionStatus) {
        let event = StatusEvent::new(&self.identity, storage, status);
        if let Some(events) = self.events.lock().as_ref() {
            // No receivers is fine
            let _ = events.send(event);
        }
    }
}

impl fmt::Debug for SpaceStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpaceStorage")
            .field("universal_id", &self.universal_id)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}
