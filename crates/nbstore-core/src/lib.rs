//! nbstore Core Library
//!
//! This crate provides local-first storage for collaborative spaces. Each
//! space (a workspace or a userspace, owned by one sync peer) is persisted
//! in its own SQLite file holding CRDT doc updates, binary blobs and the
//! clocks used to sync with other peers.
//!
//! # Architecture
//!
//! - **SharedConnection**: one ref-counted SQLite handle per space, shared
//!   by the doc, blob and sync storages
//! - **SpaceStorage**: the three storages of a space plus its status stream
//! - **StoreRegistry**: process-wide cache of spaces keyed by universal id
//!
//! # Quick Start
//!
//! ```text
//! let registry = StoreRegistry::new(StoreConfig::load()?);
//! let id: UniversalId = "@peer(local);@type(workspace);@id(ws-1);".parse()?;
//!
//! let space = registry.ensure(&id).await?;
//! space.doc().push_doc_update(DocUpdate::new("page-1", bin)).await?;
//!
//! registry.shutdown().await;
//! ```
//!
//! # Modules
//!
//! - `registry`: Space cache and status fan-out (main entry point)
//! - `store`: Space storage aggregate and status events
//! - `storage`: Connections and the doc, blob and sync storages
//! - `handlers`: Serializable command surface over the registry
//! - `identity`: Universal ids and on-disk layout
//! - `models`: Records moved in and out of a space
//! - `document`: Snapshot merging for CRDT updates
//! - `config`: Store configuration

pub mod config;
pub mod document;
pub mod handlers;
pub mod identity;
pub mod models;
pub mod registry;
pub mod storage;
pub mod store;

pub use config::StoreConfig;
pub use document::{AutomergeMerger, DocMerger};
pub use handlers::{dispatch, Command, Response};
pub use identity::{SpaceIdentity, SpaceType, UniversalId};
pub use models::{BlobRecord, DocClock, DocClocks, DocRecord, DocUpdate, ListedBlobRecord};
pub use registry::{StatusSubscription, StoreRegistry};
pub use storage::{ConnectionStatus, StorageType, StoreError, StoreResult};
pub use store::{SpaceStorage, StatusEvent, StorageRef};
