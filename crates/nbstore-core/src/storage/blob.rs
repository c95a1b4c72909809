//! Blob storage
//!
//! Deleting a blob normally only tombstones it: the row keeps its data and
//! stays readable through `get`, but drops out of `list`. Tombstoned rows
//! are reclaimed by `release`, the only irreversible cleanup.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};

use super::error::{StoreError, StoreResult};
use super::{
    row_optional_timestamp, row_timestamp, timestamp_to_millis, SharedConnection, StorageHandle,
    StorageType,
};
use crate::models::{now_millis, BlobRecord, ListedBlobRecord};

/// Binary blob store for one space
pub struct BlobStorage {
    handle: StorageHandle,
}

impl BlobStorage {
    pub fn new(connection: Arc<SharedConnection>) -> Self {
        Self {
            handle: StorageHandle::new(StorageType::Blob, connection),
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

    /// Insert or replace a blob; replacing clears any tombstone
    pub async fn set(&self, blob: BlobRecord) -> StoreResult<()> {
        let created_at = timestamp_to_millis("blob", blob.created_at)?;
        let db = self.handle.db()?;

        db.call(move |conn| {
            conn.execute(
                "INSERT INTO blobs (key, data, mime, size, created_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)
                 ON CONFLICT(key) DO UPDATE SET
                     data = excluded.data,
                     mime = excluded.mime,
                     size = excluded.size,
                     created_at = excluded.created_at,
                     deleted_at = NULL",
                params![
                    blob.key,
                    blob.data,
                    blob.mime,
                    blob.data.len() as i64,
                    created_at
                ],
            )
            .map_err(StoreError::write("blob"))?;
            Ok(())
        })
        .await
    }

    /// Get a blob by key, including tombstoned ones
    pub async fn get(&self, key: &str) -> StoreResult<Option<BlobRecord>> {
        let db = self.handle.db()?;
        let key = key.to_string();

        db.call(move |conn| {
            let blob = conn
                .query_row(
                    "SELECT key, data, mime, created_at, deleted_at FROM blobs WHERE key = ?",
                    params![key],
                    |row| {
                        Ok(BlobRecord {
                            key: row.get(0)?,
                            data: row.get(1)?,
                            mime: row.get(2)?,
                            created_at: row_timestamp(row, 3)?,
                            deleted_at: row_optional_timestamp(row, 4)?,
                        })
                    },
                )
                .optional()?;
            Ok(blob)
        })
        .await
    }

    /// Delete a blob
    ///
    /// With `permanently` the row is removed outright; otherwise it is
    /// tombstoned. Deleting a missing key is a no-op.
    pub async fn delete(&self, key: &str, permanently: bool) -> StoreResult<()> {
        let db = self.handle.db()?;
        let key = key.to_string();

        db.call(move |conn| {
            if permanently {
                conn.execute("DELETE FROM blobs WHERE key = ?", params![key])
            } else {
                conn.execute(
                    "UPDATE blobs SET deleted_at = ? WHERE key = ? AND deleted_at IS NULL",
                    params![now_millis().timestamp_millis(), key],
                )
            }
            .map_err(StoreError::write("blob delete"))?;
            Ok(())
        })
        .await
    }

    /// Metadata of every live (non-tombstoned) blob, oldest first
    pub async fn list(&self) -> StoreResult<Vec<ListedBlobRecord>> {
        let db = self.handle.db()?;

        db.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, mime, size, created_at FROM blobs
                 WHERE deleted_at IS NULL
                 ORDER BY created_at ASC, key ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ListedBlobRecord {
                    key: row.get(0)?,
                    mime: row.get(1)?,
                    size: row.get(2)?,
                    created_at: row_timestamp(row, 3)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Permanently remove every tombstoned blob
    ///
    /// Returns how many blobs were reclaimed. Live blobs are never touched.
    pub async fn release(&self) -> StoreResult<usize> {
        let db = self.handle.db()?;
        let share_id = self.handle.connection().share_id().to_string();

        let released = db
            .call(|conn| {
                conn.execute("DELETE FROM blobs WHERE deleted_at IS NOT NULL", [])
                    .map_err(StoreError::write("blob release"))
            })
            .await?;

        if released > 0 {
            info!(share_id = %share_id, released, "released tombstoned blobs");
        } else {
            debug!(share_id = %share_id, "no tombstoned blobs to release");
        }
        Ok(released)
    }
}
