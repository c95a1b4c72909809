//! Inspect and path command handlers

use anyhow::{bail, Context, Result};

use nbstore_core::{StoreConfig, StoreRegistry, UniversalId};

use crate::output::{Output, SpaceSummary};

/// Print the database path of a space
pub fn path(config: &StoreConfig, id: &UniversalId, output: &Output) -> Result<()> {
    output.print_path(&config.space_db_path(id.identity()));
    Ok(())
}

/// Summarize a space: its doc clocks and live blobs
///
/// Refuses to run against a space that has no database yet, so inspecting
/// never creates one.
pub async fn show(config: StoreConfig, id: &UniversalId, output: &Output) -> Result<()> {
    let db_path = config.space_db_path(id.identity());
    if !db_path.exists() {
        bail!("No database for {} at {}", id, db_path.display());
    }

    let registry = StoreRegistry::new(config);
    let result = summarize(&registry, id, output).await;
    registry.shutdown().await;
    result
}

async fn summarize(registry: &StoreRegistry, id: &UniversalId, output: &Output) -> Result<()> {
    let space = registry
        .ensure(id)
        .await
        .with_context(|| format!("Failed to open space {}", id))?;

    let clocks = space
        .doc()
        .get_doc_timestamps(None)
        .await
        .context("Failed to read doc clocks")?;
    let blobs = space.blob().list().await.context("Failed to list blobs")?;
    let identity = space.identity();

    output.print_space(&SpaceSummary {
        universal_id: id,
        peer: &identity.peer,
        space_type: identity.space_type,
        space_id: &identity.space_id,
        path: space.connection().path(),
        docs: &clocks,
        blobs: &blobs,
    });

    Ok(())
}
