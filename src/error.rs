//! Error types for sproc-analysis

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading snapshots and analyzing procedures
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Failed to read snapshot file: {path}")]
    SnapshotReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot index is unreadable, no descriptors available: {path}")]
    SnapshotIndexUnreadable {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
