//! Data models for nbstore
//!
//! Defines the records moved in and out of a space: doc updates and
//! snapshots, blobs, and the per-document clocks used by sync.
//!
//! All timestamps are kept at millisecond precision, which is what the
//! SQLite layer persists. Constructors and the [`millis`] serde adapter
//! drop anything finer, so records stay equal across a write/read round
//! trip. The storages reject timestamps that bypassed both.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Mapping of doc id to timestamp, as returned by clock queries
pub type DocClocks = HashMap<String, DateTime<Utc>>;

/// Current time truncated to milliseconds
pub fn now_millis() -> DateTime<Utc> {
    datetime_from_millis(Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Convert persisted milliseconds back into a timestamp
pub fn datetime_from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Drop the sub-millisecond part of `timestamp`
pub fn truncate_millis(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp.trunc_subsecs(3)
}

/// A single CRDT update pushed by an editor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocUpdate {
    /// Document the update belongs to
    pub doc_id: String,
    /// Encoded CRDT change
    #[serde(with = "base64_bytes")]
    pub bin: Vec<u8>,
}

impl DocUpdate {
    pub fn new(doc_id: impl Into<String>, bin: impl Into<Vec<u8>>) -> Self {
        Self {
            doc_id: doc_id.into(),
            bin: bin.into(),
        }
    }
}

/// A stored document: either one logged update or the materialized snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocRecord {
    pub doc_id: String,
    #[serde(with = "base64_bytes")]
    pub bin: Vec<u8>,
    /// Timestamp of the latest update folded into this record
    #[serde(with = "millis")]
    pub timestamp: DateTime<Utc>,
}

/// Latest known timestamp for one document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocClock {
    pub doc_id: String,
    #[serde(with = "millis")]
    pub timestamp: DateTime<Utc>,
}

impl DocClock {
    pub fn new(doc_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            doc_id: doc_id.into(),
            timestamp: truncate_millis(timestamp),
        }
    }
}

/// A binary blob (attachment, image, ...) stored in a space
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlobRecord {
    /// Content hash or caller-chosen key
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub mime: String,
    #[serde(with = "millis")]
    pub created_at: DateTime<Utc>,
    /// Set when the blob has been soft deleted
    #[serde(default, with = "millis::option")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl BlobRecord {
    /// Create a blob under a caller-chosen key
    pub fn new(key: impl Into<String>, data: impl Into<Vec<u8>>, mime: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data: data.into(),
            mime: mime.into(),
            created_at: now_millis(),
            deleted_at: None,
        }
    }

    /// Create a content-addressed blob
    ///
    /// The key is the URL-safe base64 (no padding) SHA-256 digest of `data`,
    /// so identical content always lands under the same key.
    pub fn from_content(data: impl Into<Vec<u8>>, mime: impl Into<String>) -> Self {
        let data = data.into();
        let key = content_key(&data);
        Self::new(key, data, mime)
    }

    /// Size of the blob payload in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Blob metadata returned by listings (no payload)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListedBlobRecord {
    pub key: String,
    pub mime: String,
    pub size: i64,
    #[serde(with = "millis")]
    pub created_at: DateTime<Utc>,
}

/// Content key for a blob payload
pub fn content_key(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(data))
}

/// Serde adapter encoding byte payloads as standard base64 strings
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for millisecond timestamps
///
/// Serializes like chrono's own RFC 3339 impl. Deserializing truncates to
/// the millisecond.
pub mod millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        timestamp: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        timestamp.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        DateTime::<Utc>::deserialize(deserializer).map(super::truncate_millis)
    }

    /// Same as [`millis`](super::millis), for optional timestamps
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        pub fn serialize<S: Serializer>(
            timestamp: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            timestamp.serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<DateTime<Utc>>::deserialize(deserializer)
                .map(|timestamp| timestamp.map(super::super::truncate_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_has_no_sub_millisecond_part() {
        let now = now_millis();
        assert_eq!(now.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(datetime_from_millis(now.timestamp_millis()), Some(now));
    }

    #[test]
    fn test_content_addressed_blob() {
        let a = BlobRecord::from_content(b"hello".to_vec(), "text/plain");
        let b = BlobRecord::from_content(b"hello".to_vec(), "text/plain");
        let c = BlobRecord::from_content(b"world".to_vec(), "text/plain");

        assert_eq!(a.key, b.key);
        assert_ne!(a.key, c.key);
        assert_eq!(a.size(), 5);
        assert!(!a.is_deleted());
        // URL-safe alphabet only, no padding
        assert!(!a.key.contains('/') && !a.key.contains('+') && !a.key.contains('='));
    }

    #[test]
    fn test_doc_update_json_uses_base64() {
        let update = DocUpdate::new("doc-1", vec![0u8, 1, 2, 255]);
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["docId"], "doc-1");
        assert_eq!(json["bin"], "AAEC/w==");

        let parsed: DocUpdate = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, update);
    }

    #[test]
    fn test_blob_without_deleted_at_deserializes() {
        let json = serde_json::json!({
            "key": "k",
            "data": "aGk=",
            "mime": "text/plain",
            "createdAt": "2024-01-01T00:00:00Z"
        });
        let blob: BlobRecord = serde_json::from_value(json).unwrap();
        assert_eq!(blob.data, b"hi");
        assert!(blob.deleted_at.is_none());
    }

    #[test]
    fn test_json_timestamps_truncate_to_millis() {
        let json = serde_json::json!({
            "key": "k",
            "data": "aGk=",
            "mime": "text/plain",
            "createdAt": "2024-01-01T00:00:00.123456Z",
            "deletedAt": "2024-01-02T00:00:00.999999999Z"
        });
        let blob: BlobRecord = serde_json::from_value(json).unwrap();
        assert_eq!(blob.created_at, datetime_from_millis(1_704_067_200_123).unwrap());
        assert_eq!(blob.deleted_at, datetime_from_millis(1_704_153_600_999));

        let clock: DocClock = serde_json::from_value(serde_json::json!({
            "docId": "d1",
            "timestamp": "2024-01-01T00:00:00.123900Z"
        }))
        .unwrap();
        assert_eq!(clock.timestamp, datetime_from_millis(1_704_067_200_123).unwrap());

        // Truncated values serialize back unchanged
        let again: BlobRecord = serde_json::from_value(serde_json::to_value(&blob).unwrap()).unwrap();
        assert_eq!(again, blob);
    }

    #[test]
    fn test_doc_clock_new_truncates() {
        let precise = datetime_from_millis(1_000).unwrap() + chrono::Duration::microseconds(250);
        assert_eq!(DocClock::new("d1", precise).timestamp, datetime_from_millis(1_000).unwrap());
    }
}
