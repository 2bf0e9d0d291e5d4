//! Common test utilities: builds a snapshot store inside a temp directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tempfile::TempDir;

/// Builder for an expanded-layout snapshot store
#[derive(Default)]
pub struct SnapshotBuilder {
    procedures: Vec<(String, Value)>,
    tables: Vec<(String, Value)>,
    types: Vec<Value>,
    functions: Vec<Value>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn procedure(mut self, schema: &str, name: &str, definition: &str) -> Self {
        self.procedures.push((
            format!("{schema}.{name}.json"),
            json!({ "Schema": schema, "Name": name, "Definition": definition }),
        ));
        self
    }

    /// Procedure with an explicit document body, for parameter and
    /// persisted-result-set shapes
    pub fn procedure_document(mut self, schema: &str, name: &str, document: Value) -> Self {
        self.procedures
            .push((format!("{schema}.{name}.json"), document));
        self
    }

    /// Table with `(name, sql type, nullable)` columns
    pub fn table(mut self, schema: &str, name: &str, columns: &[(&str, &str, bool)]) -> Self {
        self.tables.push((
            format!("{schema}.{name}.json"),
            table_document(schema, name, columns),
        ));
        self
    }

    pub fn scalar_type(
        mut self,
        schema: &str,
        name: &str,
        base: &str,
        max_length: Option<i64>,
    ) -> Self {
        self.types.push(json!({
            "Schema": schema,
            "Name": name,
            "BaseSqlTypeName": base,
            "MaxLength": max_length,
        }));
        self
    }

    pub fn function(mut self, schema: &str, name: &str) -> Self {
        self.functions
            .push(json!({ "Schema": schema, "Name": name }));
        self
    }

    pub fn build(self) -> TestStore {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let root = temp_dir.path().to_path_buf();

        let index_entries: Vec<Value> = self
            .procedures
            .iter()
            .map(|(file, doc)| {
                json!({
                    "File": file,
                    "Schema": doc["Schema"],
                    "Name": doc["Name"],
                })
            })
            .collect();
        write_json(
            &root.join("index.json"),
            &json!({ "Procedures": index_entries }),
        );

        for (file, doc) in &self.procedures {
            write_json(&root.join("procedures").join(file), doc);
        }
        for (file, doc) in &self.tables {
            write_json(&root.join("tables").join(file), doc);
        }
        for (i, doc) in self.types.iter().enumerate() {
            write_json(&root.join("types").join(format!("t{i}.json")), doc);
        }
        for (i, doc) in self.functions.iter().enumerate() {
            write_json(&root.join("functions").join(format!("f{i}.json")), doc);
        }

        TestStore {
            _temp_dir: temp_dir,
            root,
        }
    }
}

/// A snapshot store on disk; dropping it removes the directory
pub struct TestStore {
    /// Kept to delay temp directory cleanup until the store is dropped
    _temp_dir: TempDir,
    pub root: PathBuf,
}

impl TestStore {
    pub fn tables_dir(&self) -> PathBuf {
        self.root.join("tables")
    }

    /// Add or replace one table document after the store was built
    pub fn write_table(&self, schema: &str, name: &str, columns: &[(&str, &str, bool)]) {
        write_json(
            &self.tables_dir().join(format!("{schema}.{name}.json")),
            &table_document(schema, name, columns),
        );
    }
}

fn table_document(schema: &str, name: &str, columns: &[(&str, &str, bool)]) -> Value {
    let columns: Vec<Value> = columns
        .iter()
        .map(|(column, sql_type, nullable)| {
            json!({ "Name": column, "SqlTypeName": sql_type, "IsNullable": nullable })
        })
        .collect();
    json!({ "Schema": schema, "Name": name, "Columns": columns })
}

fn write_json(path: &Path, value: &Value) {
    fs::create_dir_all(path.parent().expect("path has a parent"))
        .expect("failed to create directory");
    fs::write(
        path,
        serde_json::to_string_pretty(value).expect("serializable"),
    )
    .expect("failed to write document");
}
