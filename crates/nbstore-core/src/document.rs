//! Materializing doc snapshots
//!
//! The store does not interpret CRDT updates itself. A [`DocMerger`] folds
//! pushed updates into the previous snapshot; [`AutomergeMerger`] is the
//! default and treats every update as Automerge change bytes.

use automerge::AutoCommit;

/// Folds CRDT updates into a snapshot
///
/// Implementations must be deterministic for a given input and must accept
/// their own output as a `snapshot` on the next call.
pub trait DocMerger: Send + Sync + 'static {
    /// Merge `updates` (oldest first) on top of `snapshot`
    fn merge(&self, snapshot: Option<&[u8]>, updates: &[&[u8]]) -> Result<Vec<u8>, String>;
}

/// Merger for Automerge documents
///
/// Loads the snapshot, applies each update with `load_incremental`, and
/// returns the compacted save of the result.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutomergeMerger;

impl DocMerger for AutomergeMerger {
    fn merge(&self, snapshot: Option<&[u8]>, updates: &[&[u8]]) -> Result<Vec<u8>, String> {
        let mut doc = match snapshot {
            Some(bytes) => AutoCommit::load(bytes).map_err(|e| e.to_string())?,
            None => AutoCommit::new(),
        };

        for update in updates {
            doc.load_incremental(update).map_err(|e| e.to_string())?;
        }

        Ok(doc.save())
    }
}
