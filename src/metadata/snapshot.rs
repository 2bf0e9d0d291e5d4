//! Persisted snapshot store.
//!
//! Two layouts are supported:
//!
//! - **Expanded**: `index.json` at the root lists per-procedure file names;
//!   per-entity documents live under `procedures/`, `tables/`, `types/`,
//!   `tabletypes/` and `functions/`. Procedure documents are loaded lazily
//!   from the index.
//! - **Legacy**: a single monolithic JSON document at the root with top-level
//!   `Procedures`/`StoredProcedures`, `UserDefinedTableTypes` and `Types`
//!   arrays; the newest candidate `*.json` file wins.
//!
//! A single unparseable entity document is skipped with a warning and never
//! aborts the load. A missing store is an empty result, not an error. The
//! only hard failure is an unreadable top-level index (or legacy monolith),
//! which surfaces as an explicit error so the caller sees "no descriptors
//! available" instead of a silently empty set.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::error::AnalyzerError;

/// A parameter as persisted in a procedure document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ParameterDocument {
    pub name: String,
    pub sql_type_name: Option<String>,
    pub is_nullable: bool,
    pub max_length: Option<i64>,
    pub is_output: bool,
    pub is_table_type: bool,
    pub table_type_schema: Option<String>,
    pub table_type_name: Option<String>,
}

/// A column as persisted in a table or result-set document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ColumnDocument {
    pub name: String,
    pub sql_type_name: Option<String>,
    pub is_nullable: bool,
    pub max_length: Option<i64>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub is_identity: bool,
}

/// A previously analyzed result set, as persisted. Used only when a
/// procedure document carries no definition text to re-analyze.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ResultSetDocument {
    pub name: Option<String>,
    pub columns: Vec<ColumnDocument>,
    pub returns_json: bool,
    pub returns_json_array: bool,
    pub has_select_star: bool,
    pub exec_source_schema_name: Option<String>,
    pub exec_source_procedure_name: Option<String>,
}

/// One stored procedure document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProcedureDocument {
    pub schema: String,
    pub name: String,
    #[serde(alias = "Parameters")]
    pub inputs: Vec<ParameterDocument>,
    /// Raw definition text (`CREATE PROCEDURE ...` or bare body)
    #[serde(alias = "Content")]
    pub definition: Option<String>,
    /// Persisted analysis output from a previous run; consulted only when
    /// `definition` is absent
    pub result_sets: Vec<ResultSetDocument>,
}

/// One table document under `tables/`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TableDocument {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDocument>,
}

/// One user-defined scalar type document under `types/`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ScalarTypeDocument {
    pub schema: String,
    pub name: String,
    #[serde(alias = "SqlTypeName")]
    pub base_sql_type_name: Option<String>,
    pub max_length: Option<i64>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
}

/// One function document under `functions/`; only the identity is consumed
/// (to classify FROM-clause references as functions).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FunctionDocument {
    pub schema: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct IndexEntry {
    file: String,
    #[allow(dead_code)]
    name: String,
    #[allow(dead_code)]
    schema: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SnapshotIndex {
    procedures: Vec<IndexEntry>,
    user_defined_table_types: Vec<IndexEntry>,
    types: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct LegacySnapshot {
    #[serde(alias = "StoredProcedures")]
    procedures: Vec<ProcedureDocument>,
    #[allow(dead_code)]
    user_defined_table_types: Vec<serde_json::Value>,
    types: Vec<ScalarTypeDocument>,
}

#[derive(Debug)]
enum Layout {
    Expanded(SnapshotIndex),
    Legacy(LegacySnapshot),
    Missing,
}

/// Read-only view over a persisted snapshot directory
#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    layout: Layout,
}

impl SnapshotStore {
    /// Open the store at `root`. A missing store is valid (empty); a corrupt
    /// index or legacy monolith is a hard error.
    pub fn open(root: &Path) -> Result<Self, AnalyzerError> {
        let index_path = root.join("index.json");
        if index_path.is_file() {
            let text =
                fs::read_to_string(&index_path).map_err(|source| AnalyzerError::SnapshotReadError {
                    path: index_path.clone(),
                    source,
                })?;
            let index: SnapshotIndex = serde_json::from_str(&text).map_err(|source| {
                AnalyzerError::SnapshotIndexUnreadable {
                    path: index_path,
                    source,
                }
            })?;
            return Ok(Self {
                root: root.to_path_buf(),
                layout: Layout::Expanded(index),
            });
        }

        // Legacy layout: newest candidate *.json at the root
        if let Some(candidate) = newest_json_file(root) {
            let text =
                fs::read_to_string(&candidate).map_err(|source| AnalyzerError::SnapshotReadError {
                    path: candidate.clone(),
                    source,
                })?;
            let legacy: LegacySnapshot = serde_json::from_str(&text).map_err(|source| {
                AnalyzerError::SnapshotIndexUnreadable {
                    path: candidate,
                    source,
                }
            })?;
            return Ok(Self {
                root: root.to_path_buf(),
                layout: Layout::Legacy(legacy),
            });
        }

        Ok(Self {
            root: root.to_path_buf(),
            layout: Layout::Missing,
        })
    }

    /// Directory the table metadata cache reads from
    pub fn tables_root(&self) -> PathBuf {
        self.root.join("tables")
    }

    /// Load all procedure documents. In the expanded layout each document is
    /// loaded from its index entry; unparseable documents are skipped with a
    /// warning.
    pub fn procedures(&self) -> Vec<ProcedureDocument> {
        match &self.layout {
            Layout::Expanded(index) => {
                let dir = self.root.join("procedures");
                index
                    .procedures
                    .iter()
                    .filter_map(|entry| load_document::<ProcedureDocument>(&dir.join(&entry.file)))
                    .collect()
            }
            Layout::Legacy(legacy) => legacy.procedures.clone(),
            Layout::Missing => Vec::new(),
        }
    }

    /// Load all user-defined scalar type documents
    pub fn scalar_types(&self) -> Vec<ScalarTypeDocument> {
        match &self.layout {
            Layout::Expanded(index) => {
                let dir = self.root.join("types");
                let mut types: Vec<ScalarTypeDocument> = index
                    .types
                    .iter()
                    .filter_map(|entry| load_document::<ScalarTypeDocument>(&dir.join(&entry.file)))
                    .collect();
                // Index entries are optional for types; pick up any documents
                // present in the directory but absent from the index
                if types.is_empty() {
                    types = load_directory::<ScalarTypeDocument>(&dir);
                }
                types
            }
            Layout::Legacy(legacy) => legacy.types.clone(),
            Layout::Missing => Vec::new(),
        }
    }

    /// Load all function identities
    pub fn functions(&self) -> Vec<FunctionDocument> {
        match &self.layout {
            Layout::Expanded(_) => load_directory::<FunctionDocument>(&self.root.join("functions")),
            _ => Vec::new(),
        }
    }

    /// Identities of user-defined table types listed by the index
    pub fn table_type_count(&self) -> usize {
        match &self.layout {
            Layout::Expanded(index) => index.user_defined_table_types.len(),
            Layout::Legacy(legacy) => legacy.user_defined_table_types.len(),
            Layout::Missing => 0,
        }
    }
}

fn newest_json_file(root: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;
    let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("json")
        })
        .filter_map(|p| {
            let modified = fs::metadata(&p).ok()?.modified().ok()?;
            Some((modified, p))
        })
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    candidates.into_iter().map(|(_, p)| p).next()
}

fn load_document<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "skipping unreadable snapshot document");
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(doc) => Some(doc),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "skipping unparseable snapshot document");
            None
        }
    }
}

fn load_directory<T: serde::de::DeserializeOwned>(dir: &Path) -> Vec<T> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();
    paths
        .iter()
        .filter_map(|p| load_document::<T>(p))
        .collect()
}
