//! Cross-object dependency collection.
//!
//! Dependencies are accumulated from every pass output (EXEC references,
//! FROM-clause sources, routine-bound columns, user-defined types) and
//! deduplicated case-insensitively on `(kind, schema, name)`. Iteration
//! order is deterministic regardless of discovery order.

use std::collections::{BTreeMap, HashSet};

use crate::metadata::TableMetadataCache;
use crate::model::{ObjectReference, ProcedureModel, ReferenceKind};

/// Known scalar/table functions, keyed by lower-cased (schema, name)
pub type FunctionSet = HashSet<(String, String)>;

/// Deduplicating, deterministically ordered dependency accumulator
#[derive(Default)]
pub struct DependencyCollector {
    seen: BTreeMap<(ReferenceKind, String, String), ObjectReference>,
}

impl DependencyCollector {
    /// Record one dependency; the first-seen casing wins
    pub fn add(&mut self, reference: ObjectReference) {
        let key = (
            reference.kind,
            reference.schema.to_ascii_lowercase(),
            reference.name.to_ascii_lowercase(),
        );
        self.seen.entry(key).or_insert(reference);
    }

    /// Collect everything the analysis passes recorded on the model.
    ///
    /// FROM-clause sources are classified against the metadata we have: a
    /// table document makes it a `Table`, a known function a `Function`, and
    /// anything else is assumed to be a `View` (views carry no column
    /// metadata of their own here).
    pub fn collect_model(
        &mut self,
        model: &ProcedureModel,
        default_schema: &str,
        tables: &TableMetadataCache,
        functions: &FunctionSet,
    ) {
        for exec in &model.executed_procedures {
            let schema = exec.schema.as_deref().unwrap_or(default_schema);
            self.add(ObjectReference::new(
                ReferenceKind::Procedure,
                schema,
                exec.name.clone(),
            ));
        }

        for set in &model.result_sets {
            if let Some(reference) = &set.exec_reference {
                self.add(reference.clone());
            }
            for source in &set.tables {
                let schema = source.schema.as_deref().unwrap_or(default_schema);
                let kind = classify_source(schema, &source.name, tables, functions);
                self.add(ObjectReference::new(kind, schema, source.name.clone()));
            }
            for column in &set.columns {
                if let Some(reference) = &column.reference {
                    self.add(reference.clone());
                }
            }
        }
    }

    pub fn into_vec(self) -> Vec<ObjectReference> {
        self.seen.into_values().collect()
    }
}

fn classify_source(
    schema: &str,
    name: &str,
    tables: &TableMetadataCache,
    functions: &FunctionSet,
) -> ReferenceKind {
    if tables.try_get(schema, name).is_some() {
        return ReferenceKind::Table;
    }
    let key = (schema.to_ascii_lowercase(), name.to_ascii_lowercase());
    if functions.contains(&key) {
        return ReferenceKind::Function;
    }
    ReferenceKind::View
}
