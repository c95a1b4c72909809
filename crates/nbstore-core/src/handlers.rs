//! Command surface
//!
//! Every request names the space it targets by universal id. Commands are
//! plain serde values so any transport (stdio JSON lines, an IPC bridge)
//! can carry them; binary payloads travel as standard base64.
//!
//! ```json
//! {"method": "getDoc", "id": "@peer(local);@type(workspace);@id(ws-1);", "docId": "page-1"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::identity::UniversalId;
use crate::models::{BlobRecord, DocClock, DocClocks, DocRecord, DocUpdate, ListedBlobRecord};
use crate::registry::StoreRegistry;
use crate::storage::StoreResult;

/// A request against one space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    Connect {
        id: UniversalId,
    },
    Close {
        id: UniversalId,
    },
    PushDocUpdate {
        id: UniversalId,
        update: DocUpdate,
    },
    GetDoc {
        id: UniversalId,
        doc_id: String,
    },
    DeleteDoc {
        id: UniversalId,
        doc_id: String,
    },
    GetDocTimestamps {
        id: UniversalId,
        #[serde(default)]
        after: Option<DateTime<Utc>>,
    },
    GetDocTimestamp {
        id: UniversalId,
        doc_id: String,
    },
    GetDocUpdates {
        id: UniversalId,
        doc_id: String,
    },
    SetBlob {
        id: UniversalId,
        blob: BlobRecord,
    },
    GetBlob {
        id: UniversalId,
        key: String,
    },
    DeleteBlob {
        id: UniversalId,
        key: String,
        #[serde(default)]
        permanently: bool,
    },
    ListBlobs {
        id: UniversalId,
    },
    ReleaseBlobs {
        id: UniversalId,
    },
    GetPeerClocks {
        id: UniversalId,
        peer: String,
    },
    SetPeerClock {
        id: UniversalId,
        peer: String,
        clock: DocClock,
    },
    GetPeerPushedClocks {
        id: UniversalId,
        peer: String,
    },
    SetPeerPushedClock {
        id: UniversalId,
        peer: String,
        clock: DocClock,
    },
    GetPeerRemoteClocks {
        id: UniversalId,
        peer: String,
    },
    SetPeerRemoteClock {
        id: UniversalId,
        peer: String,
        clock: DocClock,
    },
    ClearClocks {
        id: UniversalId,
    },
}

impl Command {
    /// The space this command targets
    pub fn id(&self) -> &UniversalId {
        match self {
            Command::Connect { id }
            | Command::Close { id }
            | Command::PushDocUpdate { id, .. }
            | Command::GetDoc { id, .. }
            | Command::DeleteDoc { id, .. }
            | Command::GetDocTimestamps { id, .. }
            | Command::GetDocTimestamp { id, .. }
            | Command::GetDocUpdates { id, .. }
            | Command::SetBlob { id, .. }
            | Command::GetBlob { id, .. }
            | Command::DeleteBlob { id, .. }
            | Command::ListBlobs { id }
            | Command::ReleaseBlobs { id }
            | Command::GetPeerClocks { id, .. }
            | Command::SetPeerClock { id, .. }
            | Command::GetPeerPushedClocks { id, .. }
            | Command::SetPeerPushedClock { id, .. }
            | Command::GetPeerRemoteClocks { id, .. }
            | Command::SetPeerRemoteClock { id, .. }
            | Command::ClearClocks { id } => id,
        }
    }

    /// Wire name of the command
    pub fn method(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Close { .. } => "close",
            Command::PushDocUpdate { .. } => "pushDocUpdate",
            Command::GetDoc { .. } => "getDoc",
            Command::DeleteDoc { .. } => "deleteDoc",
            Command::GetDocTimestamps { .. } => "getDocTimestamps",
            Command::GetDocTimestamp { .. } => "getDocTimestamp",
            Command::GetDocUpdates { .. } => "getDocUpdates",
            Command::SetBlob { .. } => "setBlob",
            Command::GetBlob { .. } => "getBlob",
            Command::DeleteBlob { .. } => "deleteBlob",
            Command::ListBlobs { .. } => "listBlobs",
            Command::ReleaseBlobs { .. } => "releaseBlobs",
            Command::GetPeerClocks { .. } => "getPeerClocks",
            Command::SetPeerClock { .. } => "setPeerClock",
            Command::GetPeerPushedClocks { .. } => "getPeerPushedClocks",
            Command::SetPeerPushedClock { .. } => "setPeerPushedClock",
            Command::GetPeerRemoteClocks { .. } => "getPeerRemoteClocks",
            Command::SetPeerRemoteClock { .. } => "setPeerRemoteClock",
            Command::ClearClocks { .. } => "clearClocks",
        }
    }
}

/// Result of a command; serializes as the bare value (`null` for `Unit`)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Unit,
    Clock(DocClock),
    OptionalClock(Option<DocClock>),
    Doc(Option<DocRecord>),
    Updates(Vec<DocRecord>),
    Clocks(DocClocks),
    Blob(Option<BlobRecord>),
    Blobs(Vec<ListedBlobRecord>),
    Released(usize),
}

/// Run `command` against its space
///
/// All commands except `close` open the space on demand.
pub async fn dispatch(registry: &StoreRegistry, command: Command) -> StoreResult<Response> {
    debug!(method = command.method(), universal_id = %command.id(), "dispatching command");

    let response = match command {
        Command::Connect { id } => {
            registry.ensure(&id).await?;
            Response::Unit
        }
        Command::Close { id } => {
            registry.close(&id).await?;
            Response::Unit
        }
        Command::PushDocUpdate { id, update } => {
            let store = registry.ensure(&id).await?;
            Response::Clock(store.doc().push_doc_update(update).await?)
        }
        Command::GetDoc { id, doc_id } => {
            let store = registry.ensure(&id).await?;
            Response::Doc(store.doc().get_doc(&doc_id).await?)
        }
        Command::DeleteDoc { id, doc_id } => {
            let store = registry.ensure(&id).await?;
            store.doc().delete_doc(&doc_id).await?;
            Response::Unit
        }
        Command::GetDocTimestamps { id, after } => {
            let store = registry.ensure(&id).await?;
            Response::Clocks(store.doc().get_doc_timestamps(after).await?)
        }
        Command::GetDocTimestamp { id, doc_id } => {
            let store = registry.ensure(&id).await?;
            Response::OptionalClock(store.doc().get_doc_timestamp(&doc_id).await?)
        }
        Command::GetDocUpdates { id, doc_id } => {
            let store = registry.ensure(&id).await?;
            Response::Updates(store.doc().get_doc_updates(&doc_id).await?)
        }
        Command::SetBlob { id, blob } => {
            let store = registry.ensure(&id).await?;
            store.blob().set(blob).await?;
            Response::Unit
        }
        Command::GetBlob { id, key } => {
            let store = registry.ensure(&id).await?;
            Response::Blob(store.blob().get(&key).await?)
        }
        Command::DeleteBlob {
            id,
            key,
            permanently,
        } => {
            let store = registry.ensure(&id).await?;
            store.blob().delete(&key, permanently).await?;
            Response::Unit
        }
        Command::ListBlobs { id } => {
            let store = registry.ensure(&id).await?;
            Response::Blobs(store.blob().list().await?)
        }
        Command::ReleaseBlobs { id } => {
            let store = registry.ensure(&id).await?;
            Response::Released(store.blob().release().await?)
        }
        Command::GetPeerClocks { id, peer } => {
            let store = registry.ensure(&id).await?;
            Response::Clocks(store.sync().get_peer_clocks(&peer).await?)
        }
        Command::SetPeerClock { id, peer, clock } => {
            let store = registry.ensure(&id).await?;
            store.sync().set_peer_clock(&peer, clock).await?;
            Response::Unit
        }
        Command::GetPeerPushedClocks { id, peer } => {
            let store = registry.ensure(&id).await?;
            Response::Clocks(store.sync().get_peer_pushed_clocks(&peer).await?)
        }
        Command::SetPeerPushedClock { id, peer, clock } => {
            let store = registry.ensure(&id).await?;
            store.sync().set_peer_pushed_clock(&peer, clock).await?;
            Response::Unit
        }
        Command::GetPeerRemoteClocks { id, peer } => {
            let store = registry.ensure(&id).await?;
            Response::Clocks(store.sync().get_peer_remote_clocks(&peer).await?)
        }
        Command::SetPeerRemoteClock { id, peer, clock } => {
            let store = registry.ensure(&id).await?;
            store.sync().set_peer_remote_clock(&peer, clock).await?;
            Response::Unit
        }
        Command::ClearClocks { id } => {
            let store = registry.ensure(&id).await?;
            store.sync().clear_clocks().await?;
            Response::Unit
        }
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::identity::{SpaceIdentity, SpaceType};
    use crate::models::datetime_from_millis;
    use automerge::{transaction::Transactable, AutoCommit, ROOT};
    use serde_json::json;
    use tempfile::TempDir;

    const ID: &str = "@peer(local);@type(workspace);@id(ws-1);";

    fn registry(temp_dir: &TempDir) -> StoreRegistry {
        StoreRegistry::new(StoreConfig::with_data_dir(temp_dir.path()))
    }

    fn command(value: serde_json::Value) -> Command {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_command_wire_format() {
        let cmd = command(json!({
            "method": "deleteBlob",
            "id": ID,
            "key": "k1",
        }));
        let expected_id = SpaceIdentity::new("local", SpaceType::Workspace, "ws-1").universal_id();
        assert_eq!(
            cmd,
            Command::DeleteBlob {
                id: expected_id,
                key: "k1".to_string(),
                permanently: false,
            }
        );
        assert_eq!(cmd.method(), "deleteBlob");

        let cmd = command(json!({"method": "getDoc", "id": ID, "docId": "page-1"}));
        assert!(matches!(cmd, Command::GetDoc { ref doc_id, .. } if doc_id == "page-1"));
    }

    #[test]
    fn test_command_rejects_bad_id() {
        let result: Result<Command, _> =
            serde_json::from_value(json!({"method": "connect", "id": "workspace:ws-1"}));
        assert!(result.is_err());

        let result: Result<Command, _> =
            serde_json::from_value(json!({"method": "frobnicate", "id": ID}));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_doc_commands() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(&temp_dir);

        let mut editor = AutoCommit::new();
        editor.put(ROOT, "title", "hello").unwrap();
        let bin = editor.save_incremental();

        let pushed = dispatch(
            &registry,
            command(json!({
                "method": "pushDocUpdate",
                "id": ID,
                "update": {"docId": "d1", "bin": base64_standard(&bin)},
            })),
        )
        .await
        .unwrap();
        let Response::Clock(clock) = pushed else {
            panic!("expected a clock");
        };
        assert_eq!(clock.doc_id, "d1");

        let doc = dispatch(&registry, command(json!({"method": "getDoc", "id": ID, "docId": "d1"})))
            .await
            .unwrap();
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["docId"], "d1");

        let timestamps = dispatch(&registry, command(json!({"method": "getDocTimestamps", "id": ID})))
            .await
            .unwrap();
        assert_eq!(
            timestamps,
            Response::Clocks([("d1".to_string(), clock.timestamp)].into_iter().collect())
        );

        dispatch(&registry, command(json!({"method": "deleteDoc", "id": ID, "docId": "d1"})))
            .await
            .unwrap();
        let gone = dispatch(&registry, command(json!({"method": "getDoc", "id": ID, "docId": "d1"})))
            .await
            .unwrap();
        assert_eq!(serde_json::to_value(&gone).unwrap(), serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_blob_commands() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(&temp_dir);

        let set = command(json!({
            "method": "setBlob",
            "id": ID,
            "blob": {
                "key": "k1",
                "data": base64_standard(b"payload"),
                "mime": "text/plain",
                "createdAt": "2024-01-01T00:00:00Z",
            },
        }));
        assert_eq!(dispatch(&registry, set).await.unwrap(), Response::Unit);

        let listed = dispatch(&registry, command(json!({"method": "listBlobs", "id": ID})))
            .await
            .unwrap();
        let json = serde_json::to_value(&listed).unwrap();
        assert_eq!(json[0]["key"], "k1");
        assert_eq!(json[0]["size"], 7);

        dispatch(&registry, command(json!({"method": "deleteBlob", "id": ID, "key": "k1"})))
            .await
            .unwrap();
        let released = dispatch(&registry, command(json!({"method": "releaseBlobs", "id": ID})))
            .await
            .unwrap();
        assert_eq!(released, Response::Released(1));
    }

    #[tokio::test]
    async fn test_clock_commands() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(&temp_dir);
        let id: UniversalId = ID.parse().unwrap();

        for millis in [5, 3] {
            let clock = DocClock::new("d1", datetime_from_millis(millis).unwrap());
            dispatch(
                &registry,
                Command::SetPeerPushedClock {
                    id: id.clone(),
                    peer: "remote".to_string(),
                    clock,
                },
            )
            .await
            .unwrap();
        }

        let clocks = dispatch(
            &registry,
            Command::GetPeerPushedClocks {
                id: id.clone(),
                peer: "remote".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            clocks,
            Response::Clocks([("d1".to_string(), datetime_from_millis(5).unwrap())].into_iter().collect())
        );

        dispatch(&registry, Command::ClearClocks { id: id.clone() })
            .await
            .unwrap();
        let cleared = dispatch(
            &registry,
            Command::GetPeerPushedClocks {
                id,
                peer: "remote".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(cleared, Response::Clocks(DocClocks::new()));
    }

    #[tokio::test]
    async fn test_close_does_not_open() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(&temp_dir);
        let id: UniversalId = ID.parse().unwrap();

        dispatch(&registry, Command::Close { id: id.clone() })
            .await
            .unwrap();
        assert!(registry.get(&id).await.is_none());

        dispatch(&registry, Command::Connect { id: id.clone() })
            .await
            .unwrap();
        assert!(registry.get(&id).await.is_some());
    }

    fn base64_standard(bytes: &[u8]) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }
}
