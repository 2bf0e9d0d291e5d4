//! TTL + change-aware cache of table/column metadata.
//!
//! State machine: Empty -> Loading -> Valid -> (Stale on directory-mtime
//! change or TTL expiry) -> Loading -> Valid. Readers always observe one
//! atomic immutable snapshot; a reload publishes a whole new snapshot under
//! the reload lock while the fast path stays lock-free via a validity
//! deadline.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::metadata::snapshot::TableDocument;

/// Default validity window before the backing directory is re-checked
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// One cached column of a table
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    /// Type name as persisted; either a system base type or a user-defined
    /// scalar type name
    pub sql_type: Option<String>,
    pub is_nullable: bool,
    pub max_length: Option<i64>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub is_identity: bool,
}

/// Cached shape of one table. Owned by the cache; consumers receive
/// `Arc`-shared read-only views.
#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    /// Case-insensitive column lookup
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Default)]
struct TableSnapshot {
    /// Sorted by (schema, name), case-insensitive
    tables: Vec<Arc<TableInfo>>,
    by_key: HashMap<(String, String), usize>,
}

struct ReloadState {
    dir_mtime: Option<SystemTime>,
    loaded: bool,
    forced: bool,
}

/// Cache over a directory of per-table metadata documents
pub struct TableMetadataCache {
    dir: PathBuf,
    ttl: Duration,
    /// Millis-since-epoch deadline for the unlocked fast path
    valid_until: AtomicU64,
    snapshot: RwLock<Arc<TableSnapshot>>,
    reload: Mutex<ReloadState>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl TableMetadataCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_ttl(dir, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            valid_until: AtomicU64::new(0),
            snapshot: RwLock::new(Arc::new(TableSnapshot::default())),
            reload: Mutex::new(ReloadState {
                dir_mtime: None,
                loaded: false,
                forced: false,
            }),
        }
    }

    /// All cached tables, sorted by (schema, name)
    pub fn get_all(&self) -> Vec<Arc<TableInfo>> {
        self.current().tables.clone()
    }

    /// Case-insensitive lookup of one table
    pub fn try_get(&self, schema: &str, name: &str) -> Option<Arc<TableInfo>> {
        let snapshot = self.current();
        let key = (schema.to_ascii_lowercase(), name.to_ascii_lowercase());
        snapshot
            .by_key
            .get(&key)
            .map(|&i| snapshot.tables[i].clone())
    }

    /// Force the next read to reload from disk regardless of TTL and mtime
    pub fn invalidate(&self) {
        self.valid_until.store(0, Ordering::SeqCst);
        if let Ok(mut state) = self.reload.lock() {
            state.forced = true;
        }
    }

    fn current(&self) -> Arc<TableSnapshot> {
        // Fast path: unlocked validity check
        if now_millis() < self.valid_until.load(Ordering::Acquire) {
            return self.snapshot.read().expect("cache lock poisoned").clone();
        }
        self.revalidate()
    }

    fn revalidate(&self) -> Arc<TableSnapshot> {
        let mut state = self.reload.lock().expect("cache lock poisoned");

        // Double-checked: another thread may have revalidated while we
        // waited on the lock
        if now_millis() < self.valid_until.load(Ordering::Acquire) {
            return self.snapshot.read().expect("cache lock poisoned").clone();
        }

        let dir_mtime = fs::metadata(&self.dir).and_then(|m| m.modified()).ok();
        let unchanged = state.loaded && !state.forced && dir_mtime == state.dir_mtime;

        if !unchanged {
            let snapshot = Arc::new(load_snapshot(&self.dir));
            debug!(
                dir = %self.dir.display(),
                tables = snapshot.tables.len(),
                "table metadata cache reloaded"
            );
            *self.snapshot.write().expect("cache lock poisoned") = snapshot;
            state.dir_mtime = dir_mtime;
            state.loaded = true;
            state.forced = false;
        }

        self.valid_until
            .store(now_millis() + self.ttl.as_millis() as u64, Ordering::Release);
        self.snapshot.read().expect("cache lock poisoned").clone()
    }
}

fn load_snapshot(dir: &Path) -> TableSnapshot {
    let mut tables: Vec<Arc<TableInfo>> = Vec::new();
    if dir.is_dir() {
        let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();
        for path in paths {
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable table document");
                    continue;
                }
            };
            let doc: TableDocument = match serde_json::from_str(&text) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unparseable table document");
                    continue;
                }
            };
            tables.push(Arc::new(TableInfo {
                schema: doc.schema,
                name: doc.name,
                columns: doc
                    .columns
                    .into_iter()
                    .map(|c| ColumnInfo {
                        name: c.name,
                        sql_type: c.sql_type_name,
                        is_nullable: c.is_nullable,
                        max_length: c.max_length,
                        precision: c.precision,
                        scale: c.scale,
                        is_identity: c.is_identity,
                    })
                    .collect(),
            }));
        }
    }

    tables.sort_by(|a, b| {
        (a.schema.to_ascii_lowercase(), a.name.to_ascii_lowercase())
            .cmp(&(b.schema.to_ascii_lowercase(), b.name.to_ascii_lowercase()))
    });
    let by_key = tables
        .iter()
        .enumerate()
        .map(|(i, t)| ((t.schema.to_ascii_lowercase(), t.name.to_ascii_lowercase()), i))
        .collect();
    TableSnapshot { tables, by_key }
}

/// Per-project-root cache registry. Constructor-injected by the assembler
/// invocation so lifetimes stay explicit and tests hermetic; multiple
/// analyses of the same root share one cache instance.
pub struct CacheRegistry {
    ttl: Duration,
    caches: Mutex<HashMap<PathBuf, Arc<TableMetadataCache>>>,
}

impl CacheRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Cache for a tables directory, keyed by normalized path
    pub fn cache_for(&self, dir: &Path) -> Arc<TableMetadataCache> {
        let key = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let mut caches = self.caches.lock().expect("registry lock poisoned");
        caches
            .entry(key)
            .or_insert_with(|| Arc::new(TableMetadataCache::with_ttl(dir, self.ttl)))
            .clone()
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
