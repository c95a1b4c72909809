//! Doc storage
//!
//! Every push appends a row to the update log, folds the update into the
//! doc's snapshot and advances the doc clock, all in one transaction. Reads
//! come straight from the snapshot table.
//!
//! Timestamps are assigned here: `max(now, previous + 1ms)`, so they are
//! strictly increasing per doc even when the wall clock stalls or steps back.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use super::error::{StoreError, StoreResult};
use super::{row_timestamp, SharedConnection, StorageHandle, StorageType};
use crate::document::{AutomergeMerger, DocMerger};
use crate::models::{datetime_from_millis, DocClock, DocClocks, DocRecord, DocUpdate};

/// CRDT update log and snapshot store for one space
pub struct DocStorage {
    handle: StorageHandle,
    merger: Arc<dyn DocMerger>,
}

impl DocStorage {
    /// Doc storage merging updates as Automerge changes
    pub fn new(connection: Arc<SharedConnection>) -> Self {
        Self::with_merger(connection, Arc::new(AutomergeMerger))
    }

    pub fn with_merger(connection: Arc<SharedConnection>, merger: Arc<dyn DocMerger>) -> Self {
        Self {
            handle: StorageHandle::new(StorageType::Doc, connection),
            merger,
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

    /// Append an update and refresh the snapshot
    ///
    /// Returns the clock assigned to the update.
    pub async fn push_doc_update(&self, update: DocUpdate) -> StoreResult<DocClock> {
        let db = self.handle.db()?;
        let merger = Arc::clone(&self.merger);

        let clock = db
            .call(move |conn| {
                let tx = conn.transaction().map_err(StoreError::write("doc update"))?;

                let previous: Option<i64> = tx
                    .query_row(
                        "SELECT timestamp FROM clocks WHERE doc_id = ?",
                        params![update.doc_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let now = Utc::now().timestamp_millis();
                let timestamp = match previous {
                    Some(previous) => now.max(previous + 1),
                    None => now,
                };

                let snapshot: Option<Vec<u8>> = tx
                    .query_row(
                        "SELECT data FROM snapshots WHERE doc_id = ?",
                        params![update.doc_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let merged = merger
                    .merge(snapshot.as_deref(), &[update.bin.as_slice()])
                    .map_err(|details| StoreError::Merge {
                        doc_id: update.doc_id.clone(),
                        details,
                    })?;

                tx.execute(
                    "INSERT INTO updates (doc_id, data, created_at) VALUES (?, ?, ?)",
                    params![update.doc_id, update.bin, timestamp],
                )
                .map_err(StoreError::write("doc update"))?;
                tx.execute(
                    "INSERT INTO snapshots (doc_id, data, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3)
                     ON CONFLICT(doc_id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                    params![update.doc_id, merged, timestamp],
                )
                .map_err(StoreError::write("doc snapshot"))?;
                tx.execute(
                    "INSERT INTO clocks (doc_id, timestamp) VALUES (?, ?)
                     ON CONFLICT(doc_id) DO UPDATE SET timestamp = excluded.timestamp",
                    params![update.doc_id, timestamp],
                )
                .map_err(StoreError::write("doc clock"))?;

                tx.commit().map_err(StoreError::write("doc update"))?;

                Ok(DocClock::new(
                    update.doc_id,
                    datetime_from_millis(timestamp).unwrap_or_default(),
                ))
            })
            .await?;

        debug!(doc_id = %clock.doc_id, timestamp = %clock.timestamp, "pushed doc update");
        Ok(clock)
    }

    /// Latest snapshot of a doc, or `None` if it has no updates
    pub async fn get_doc(&self, doc_id: &str) -> StoreResult<Option<DocRecord>> {
        let db = self.handle.db()?;
        let doc_id = doc_id.to_string();

        db.call(move |conn| {
            let record = conn
                .query_row(
                    "SELECT data, updated_at FROM snapshots WHERE doc_id = ?",
                    params![doc_id],
                    |row| Ok((row.get::<_, Vec<u8>>(0)?, row_timestamp(row, 1)?)),
                )
                .optional()?
                .map(|(bin, timestamp)| DocRecord {
                    doc_id,
                    bin,
                    timestamp,
                });
            Ok(record)
        })
        .await
    }

    /// Remove a doc's updates, snapshot and clock
    ///
    /// Deleting a doc that does not exist is a no-op.
    pub async fn delete_doc(&self, doc_id: &str) -> StoreResult<()> {
        let db = self.handle.db()?;
        let doc_id = doc_id.to_string();

        db.call(move |conn| {
            let tx = conn.transaction().map_err(StoreError::write("doc delete"))?;
            for sql in [
                "DELETE FROM updates WHERE doc_id = ?",
                "DELETE FROM snapshots WHERE doc_id = ?",
                "DELETE FROM clocks WHERE doc_id = ?",
            ] {
                tx.execute(sql, params![doc_id])
                    .map_err(StoreError::write("doc delete"))?;
            }
            tx.commit().map_err(StoreError::write("doc delete"))?;
            Ok(())
        })
        .await
    }

    /// Latest timestamp of every doc changed strictly after `after`
    ///
    /// With no `after`, every doc is returned.
    pub async fn get_doc_timestamps(
        &self,
        after: Option<DateTime<Utc>>,
    ) -> StoreResult<DocClocks> {
        let db = self.handle.db()?;
        let after = after.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);

        db.call(move |conn| {
            let mut stmt =
                conn.prepare("SELECT doc_id, timestamp FROM clocks WHERE timestamp > ?")?;
            let rows = stmt.query_map(params![after], |row| {
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

    /// Latest timestamp of one doc
    pub async fn get_doc_timestamp(&self, doc_id: &str) -> StoreResult<Option<DocClock>> {
        let db = self.handle.db()?;
        let doc_id = doc_id.to_string();

        db.call(move |conn| {
            let timestamp = conn
                .query_row(
                    "SELECT timestamp FROM clocks WHERE doc_id = ?",
                    params![doc_id],
                    |row| row_timestamp(row, 0),
                )
                .optional()?;
            Ok(timestamp.map(|timestamp| DocClock { doc_id, timestamp }))
        })
        .await
    }

    /// The raw update log of a doc, oldest first
    pub async fn get_doc_updates(&self, doc_id: &str) -> StoreResult<Vec<DocRecord>> {
        let db = self.handle.db()?;
        let doc_id = doc_id.to_string();

        db.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT data, created_at FROM updates WHERE doc_id = ? ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![doc_id], |row| {
                Ok(DocRecord {
                    doc_id: doc_id.clone(),
                    bin: row.get(0)?,
                    timestamp: row_timestamp(row, 1)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{SpaceIdentity, SpaceType};
    use crate::storage::ConnectionPool;
    use automerge::{transaction::Transactable, AutoCommit, ReadDoc, ROOT};
    use tempfile::TempDir;

    fn storage(temp_dir: &TempDir) -> DocStorage {
        let identity = SpaceIdentity::new("local", SpaceType::Workspace, "ws-1");
        DocStorage::new(ConnectionPool::new().share(&identity, temp_dir.path()))
    }

    fn edit(editor: &mut AutoCommit, key: &str, value: &str) -> Vec<u8> {
        editor.put(ROOT, key, value).unwrap();
        editor.save_incremental()
    }

    fn read_str(record: &DocRecord, key: &str) -> Option<String> {
        let doc = AutoCommit::load(&record.bin).unwrap();
        doc.get(ROOT, key)
            .unwrap()
            .and_then(|(value, _)| value.to_str().map(|s| s.to_string()))
    }

    #[tokio::test]
    async fn test_push_and_get_doc() {
        let temp_dir = TempDir::new().unwrap();
        let docs = storage(&temp_dir);
        docs.connect().await.unwrap();

        let mut editor = AutoCommit::new();
        let clock = docs
            .push_doc_update(DocUpdate::new("d1", edit(&mut editor, "title", "hello")))
            .await
            .unwrap();

        let doc = docs.get_doc("d1").await.unwrap().unwrap();
        assert_eq!(doc.doc_id, "d1");
        assert_eq!(doc.timestamp, clock.timestamp);
        assert_eq!(read_str(&doc, "title").as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_missing_doc_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let docs = storage(&temp_dir);
        docs.connect().await.unwrap();

        assert!(docs.get_doc("nope").await.unwrap().is_none());
        assert!(docs.get_doc_timestamp("nope").await.unwrap().is_none());
        assert!(docs.get_doc_updates("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let temp_dir = TempDir::new().unwrap();
        let docs = storage(&temp_dir);
        docs.connect().await.unwrap();

        let mut editor = AutoCommit::new();
        let mut clocks = Vec::new();
        for i in 0..20 {
            let update = edit(&mut editor, "counter", &i.to_string());
            clocks.push(docs.push_doc_update(DocUpdate::new("d1", update)).await.unwrap());
        }

        assert!(clocks.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        let timestamps = docs.get_doc_timestamps(None).await.unwrap();
        assert_eq!(timestamps.get("d1"), Some(&clocks[19].timestamp));

        let doc = docs.get_doc("d1").await.unwrap().unwrap();
        assert_eq!(read_str(&doc, "counter").as_deref(), Some("19"));

        let log = docs.get_doc_updates("d1").await.unwrap();
        assert_eq!(log.len(), 20);
        assert!(log.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_doc_timestamps_after() {
        let temp_dir = TempDir::new().unwrap();
        let docs = storage(&temp_dir);
        docs.connect().await.unwrap();

        let mut editor = AutoCommit::new();
        docs.push_doc_update(DocUpdate::new("d1", edit(&mut editor, "a", "1")))
            .await
            .unwrap();
        // Clocks are per doc; keep d2 clearly later than d1
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut other = AutoCommit::new();
        let second = docs
            .push_doc_update(DocUpdate::new("d2", edit(&mut other, "b", "2")))
            .await
            .unwrap();

        let all = docs.get_doc_timestamps(None).await.unwrap();
        assert_eq!(all.len(), 2);

        // Strictly after: a doc stamped exactly at `after` is excluded
        let changed = docs.get_doc_timestamps(Some(second.timestamp)).await.unwrap();
        assert!(changed.is_empty());

        let before_second = second.timestamp - chrono::Duration::milliseconds(1);
        let changed = docs.get_doc_timestamps(Some(before_second)).await.unwrap();
        // d1 was stamped at or before `before_second`
        assert_eq!(changed.len(), 1);
        assert!(changed.contains_key("d2"));
    }

    #[tokio::test]
    async fn test_delete_doc_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let docs = storage(&temp_dir);
        docs.connect().await.unwrap();

        let mut editor = AutoCommit::new();
        docs.push_doc_update(DocUpdate::new("d1", edit(&mut editor, "a", "1")))
            .await
            .unwrap();

        docs.delete_doc("d1").await.unwrap();
        assert!(docs.get_doc("d1").await.unwrap().is_none());
        assert!(!docs.get_doc_timestamps(None).await.unwrap().contains_key("d1"));

        docs.delete_doc("d1").await.unwrap();
        docs.delete_doc("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_push_without_connection_is_write_error() {
        let temp_dir = TempDir::new().unwrap();
        let docs = storage(&temp_dir);

        let err = docs
            .push_doc_update(DocUpdate::new("d1", Vec::new()))
            .await
            .unwrap_err();
        assert!(err.is_write_error());
    }

    #[tokio::test]
    async fn test_doc_survives_reconnect() {
        let temp_dir = TempDir::new().unwrap();
        let docs = storage(&temp_dir);
        docs.connect().await.unwrap();

        let mut editor = AutoCommit::new();
        docs.push_doc_update(DocUpdate::new("d1", edit(&mut editor, "title", "kept")))
            .await
            .unwrap();

        docs.disconnect().await.unwrap();
        assert!(docs.get_doc("d1").await.is_err());

        docs.connect().await.unwrap();
        let doc = docs.get_doc("d1").await.unwrap().unwrap();
        assert_eq!(read_str(&doc, "title").as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn test_concurrent_pushes_to_one_doc() {
        let temp_dir = TempDir::new().unwrap();
        let docs = Arc::new(storage(&temp_dir));
        docs.connect().await.unwrap();

        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let docs = Arc::clone(&docs);
                tokio::spawn(async move {
                    let mut editor = AutoCommit::new();
                    let update = edit(&mut editor, &format!("key-{}", i), "set");
                    docs.push_doc_update(DocUpdate::new("shared", update))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut clocks = Vec::new();
        for task in tasks {
            clocks.push(task.await.unwrap().timestamp);
        }
        clocks.sort();
        clocks.dedup();
        assert_eq!(clocks.len(), 10);

        let doc = docs.get_doc("shared").await.unwrap().unwrap();
        assert_eq!(doc.timestamp, clocks[9]);
        for i in 0..10 {
            assert_eq!(read_str(&doc, &format!("key-{}", i)).as_deref(), Some("set"));
        }
    }

    #[tokio::test]
    async fn test_merge_failure_leaves_doc_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let docs = storage(&temp_dir);
        docs.connect().await.unwrap();

        let mut editor = AutoCommit::new();
        docs.push_doc_update(DocUpdate::new("d1", edit(&mut editor, "a", "1")))
            .await
            .unwrap();
        let before = docs.get_doc("d1").await.unwrap().unwrap();

        struct Failing;
        impl DocMerger for Failing {
            fn merge(&self, _: Option<&[u8]>, _: &[&[u8]]) -> Result<Vec<u8>, String> {
                Err("refused".to_string())
            }
        }
        let failing = DocStorage::with_merger(Arc::clone(docs.handle().connection()), Arc::new(Failing));

        let err = failing
            .push_doc_update(DocUpdate::new("d1", vec![1, 2, 3]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Merge { .. }));

        assert_eq!(docs.get_doc("d1").await.unwrap().unwrap(), before);
        assert_eq!(docs.get_doc_updates("d1").await.unwrap().len(), 1);
    }
}
