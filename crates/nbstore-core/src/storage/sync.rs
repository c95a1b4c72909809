//! Sync clock storage
//!
//! Three per-peer clock tables back the sync engine:
//!
//! - `peer_clocks`: the latest timestamp we know a peer has for a doc
//! - `peer_pushed_clocks`: the latest local timestamp we pushed to a peer
//! - `peer_remote_clocks`: the peer's own clock as last reported remotely
//!
//! Clocks only move forward. Setting a clock to a timestamp that is not newer
//! than the stored one leaves the row as it is.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::params;
use tracing::{debug, info};

use super::error::{StoreError, StoreResult};
use super::{row_timestamp, timestamp_to_millis, SharedConnection, StorageHandle, StorageType};
use crate::models::{DocClock, DocClocks};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClockKind {
    Peer,
    Pushed,
    Remote,
}

impl ClockKind {
    const ALL: [ClockKind; 3] = [ClockKind::Peer, ClockKind::Pushed, ClockKind::Remote];

    fn table(self) -> &'static str {
        match self {
            ClockKind::Peer => "peer_clocks",
            ClockKind::Pushed => "peer_pushed_clocks",
            ClockKind::Remote => "peer_remote_clocks",
        }
    }

    fn what(self) -> &'static str {
        match self {
            ClockKind::Peer => "peer clock",
            ClockKind::Pushed => "peer pushed clock",
            ClockKind::Remote => "peer remote clock",
        }
    }
}

/// Per-peer sync clocks for one space
pub struct SyncStorage {
    handle: StorageHandle,
}

impl SyncStorage {
    pub fn new(connection: Arc<SharedConnection>) -> Self {
        Self {
            handle: StorageHandle::new(StorageType::Sync, connection),
        }
    }

    pub fn handle(&self) -> &StorageHandle {
        &self.handle
    }

    pub async fn connect(&self) -> StoreResult<()> {
        self.handle.connect().await
    }

    pub async fn disconnect(&self) -> StoreResult<()> {
        self.handle.disconnect().await
    }

    pub async fn get_peer_clocks(&self, peer: &str) -> StoreResult<DocClocks> {
        self.get_clocks(ClockKind::Peer, peer).await
    }

    pub async fn set_peer_clock(&self, peer: &str, clock: DocClock) -> StoreResult<()> {
        self.set_clock(ClockKind::Peer, peer, clock).await
    }

    pub async fn get_peer_pushed_clocks(&self, peer: &str) -> StoreResult<DocClocks> {
        self.get_clocks(ClockKind::Pushed, peer).await
    }

    pub async fn set_peer_pushed_clock(&self, peer: &str, clock: DocClock) -> StoreResult<()> {
        self.set_clock(ClockKind::Pushed, peer, clock).await
    }

    pub async fn get_peer_remote_clocks(&self, peer: &str) -> StoreResult<DocClocks> {
        self.get_clocks(ClockKind::Remote, peer).await
    }

    pub async fn set_peer_remote_clock(&self, peer: &str, clock: DocClock) -> StoreResult<()> {
        self.set_clock(ClockKind::Remote, peer, clock).await
    }

    /// Wipe every peer clock table
    ///
    /// Either all three tables are emptied or none is.
    pub async fn clear_clocks(&self) -> StoreResult<()> {
        let db = self.handle.db()?;
        let share_id = self.handle.connection().share_id().to_string();

        db.call(|conn| {
            let tx = conn.transaction().map_err(StoreError::write("clock clear"))?;
            for kind in ClockKind::ALL {
                tx.execute(&format!("DELETE FROM {}", kind.table()), [])
                    .map_err(StoreError::write("clock clear"))?;
            }
            tx.commit().map_err(StoreError::write("clock clear"))?;
            Ok(())
        })
        .await?;

        info!(share_id = %share_id, "cleared sync clocks");
        Ok(())
    }

    async fn get_clocks(&self, kind: ClockKind, peer: &str) -> StoreResult<DocClocks> {
        let db = self.handle.db()?;
        let peer = peer.to_string();

        db.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT doc_id, timestamp FROM {} WHERE peer = ?",
                kind.table()
            ))?;
            let rows = stmt.query_map(params![peer], |row| {
                Ok((row.get::<_, String>(0)?, row_timestamp(row, 1)?))
            })?;

            let mut clocks = HashMap::new();
            for row in rows {
                let (doc_id, timestamp) = row?;
                clocks.insert(doc_id, timestamp);
            }
            Ok(clocks)
        })
        .await
    }

    async fn set_clock(&self, kind: ClockKind, peer: &str, clock: DocClock) -> StoreResult<()> {
        let timestamp = timestamp_to_millis(kind.what(), clock.timestamp)?;
        let db = self.handle.db()?;
        let peer = peer.to_string();

        let changed = db
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {} (peer, doc_id, timestamp) VALUES (?1, ?2, ?3)
                         ON CONFLICT(peer, doc_id) DO UPDATE SET timestamp = excluded.timestamp
                         WHERE excluded.timestamp > timestamp",
                        kind.table()
                    ),
                    params![peer, clock.doc_id, timestamp],
                )
                .map_err(StoreError::write(kind.what()))
            })
            .await?;

        if changed == 0 {
            debug!(kind = kind.what(), "ignored stale clock");
        }
        Ok(())
    }
}
