//! Output formatting for CLI
//!
//! Provides consistent output formatting across the inspection commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)
//!
//! `serve` never goes through here; its stdout carries the protocol only.

use std::path::Path;

use serde::Serialize;

use nbstore_core::{DocClocks, ListedBlobRecord, SpaceType, UniversalId};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// What `inspect` reports about one space
#[derive(Serialize)]
pub struct SpaceSummary<'a> {
    pub universal_id: &'a UniversalId,
    pub peer: &'a str,
    pub space_type: SpaceType,
    pub space_id: &'a str,
    pub path: &'a Path,
    pub docs: &'a DocClocks,
    pub blobs: &'a [ListedBlobRecord],
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print a space summary: identity, path, doc clocks and live blobs
    pub fn print_space(&self, space: &SpaceSummary<'_>) {
        match self.format {
            OutputFormat::Json => {
                println!("{}", to_pretty_json(space));
            }
            OutputFormat::Quiet => {
                println!("{} {}", space.docs.len(), space.blobs.len());
            }
            OutputFormat::Human => {
                println!("Space {}", space.space_id);
                println!("  Peer: {}", space.peer);
                println!("  Type: {}", space.space_type);
                println!("  Path: {}", space.path.display());
                println!();
                println!("── Docs ──");
                print_doc_timestamps(space.docs);
                println!();
                println!("── Blobs ──");
                print_blobs(space.blobs);
            }
        }
    }

    /// Print a filesystem path
    pub fn print_path(&self, path: &Path) {
        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "path": path }));
            }
            OutputFormat::Human | OutputFormat::Quiet => {
                println!("{}", path.display());
            }
        }
    }
}

/// Doc clocks, oldest change first
fn print_doc_timestamps(clocks: &DocClocks) {
    if clocks.is_empty() {
        println!("No docs found.");
        return;
    }
    let mut docs: Vec<_> = clocks.iter().collect();
    docs.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
    for (doc_id, timestamp) in &docs {
        println!("{} | {}", timestamp.format("%Y-%m-%d %H:%M:%S%.3f"), doc_id);
    }
    println!("\n{} doc(s)", docs.len());
}

fn print_blobs(blobs: &[ListedBlobRecord]) {
    if blobs.is_empty() {
        println!("No blobs found.");
        return;
    }
    for blob in blobs {
        println!(
            "{} | {} | {} | {}",
            truncate(&blob.key, 44),
            blob.mime,
            format_size(blob.size),
            blob.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} blob(s)", blobs.len());
}

fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

/// Truncate a string to max length, adding ellipsis if needed
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

/// Format a byte count with a binary unit
fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
