//! sproc-analysis: static result-shape and type analysis for T-SQL stored
//! procedures.
//!
//! The library reads a persisted schema snapshot (procedure definitions,
//! table/column metadata, user-defined types), runs a sequence of analysis
//! passes over each procedure body, and produces typed descriptors: result
//! sets, columns with inferred SQL types, aggregate and JSON classification,
//! and cross-object dependencies. Descriptors are the input to downstream
//! code generation; this crate never executes SQL.

pub mod analysis;
pub mod error;
pub mod fragment;
pub mod metadata;
pub mod model;
pub mod util;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

pub use analysis::AnalysisContext;
pub use error::AnalyzerError;
pub use model::{FieldDescriptor, ProcedureDescriptor, ResultSetDescriptor};

/// Options for analyzing a snapshot store
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    /// Root of the snapshot store (directory containing `index.json` or a
    /// legacy monolith)
    pub project_root: PathBuf,
    /// Schema assumed for unqualified object names
    pub default_schema: String,
    /// Validity window for the table metadata cache
    pub cache_ttl: Duration,
}

impl AnalyzeOptions {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            default_schema: "dbo".to_string(),
            cache_ttl: metadata::DEFAULT_CACHE_TTL,
        }
    }
}

/// Analyze every procedure in the snapshot store and return its descriptors.
///
/// One-shot entry point; callers that re-analyze the same store repeatedly
/// should hold an [`AnalysisContext`] themselves and call
/// [`analysis::load_descriptors`] so the table caches and warning guards
/// survive between runs.
pub fn analyze_project(options: AnalyzeOptions) -> Result<Vec<ProcedureDescriptor>> {
    let ctx = AnalysisContext::with_registry(
        options.default_schema.clone(),
        metadata::CacheRegistry::new(options.cache_ttl),
    );
    let descriptors = analysis::load_descriptors(&options.project_root, &ctx)?;
    info!(
        root = %options.project_root.display(),
        procedures = descriptors.len(),
        "analysis complete"
    );
    Ok(descriptors)
}
