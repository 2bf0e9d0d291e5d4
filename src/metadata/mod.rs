//! Persisted schema snapshot store and the table metadata cache

mod snapshot;
mod table_cache;

pub use snapshot::{
    ColumnDocument, FunctionDocument, ParameterDocument, ProcedureDocument, ResultSetDocument,
    ScalarTypeDocument, SnapshotStore, TableDocument,
};
pub use table_cache::{CacheRegistry, ColumnInfo, TableInfo, TableMetadataCache, DEFAULT_CACHE_TTL};
