//! Descriptor assembly: orchestrates the passes over every procedure in a
//! snapshot store and produces the immutable descriptors.
//!
//! Procedures are independent, so above a small count they are analyzed in
//! parallel. Cancellation is cooperative: the flag is checked between
//! procedures, never mid-pass.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::analysis::dependencies::{DependencyCollector, FunctionSet};
use crate::analysis::scalar_types::{parse_type_token, ScalarTypeCatalog};
use crate::analysis::type_resolution::{self, token_for_declared_type};
use crate::analysis::{aggregate, json_shape, model_builder, post_process};
use crate::fragment;
use crate::metadata::{
    CacheRegistry, ParameterDocument, ProcedureDocument, ResultSetDocument, SnapshotStore,
    TableMetadataCache,
};
use crate::model::{
    ColumnModel, FieldDescriptor, ObjectReference, ProcedureDescriptor, ReferenceKind,
    ResultSetDescriptor, ResultSetModel,
};

/// Below this many procedures the parallel walk is not worth the overhead
const PARALLEL_THRESHOLD: usize = 8;

/// Shared state for one or more analysis runs.
///
/// Owned by the caller and passed by reference so that repeated analyses of
/// the same project reuse the table caches and keep the once-per-column
/// warning guard across runs.
pub struct AnalysisContext {
    pub default_schema: String,
    pub registry: CacheRegistry,
    /// (procedure full name, column name) pairs already warned about
    warned: Mutex<HashSet<(String, String)>>,
    cancel: AtomicBool,
}

impl AnalysisContext {
    pub fn new(default_schema: impl Into<String>) -> Self {
        Self {
            default_schema: default_schema.into(),
            registry: CacheRegistry::default(),
            warned: Mutex::new(HashSet::new()),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn with_registry(default_schema: impl Into<String>, registry: CacheRegistry) -> Self {
        Self {
            default_schema: default_schema.into(),
            registry,
            warned: Mutex::new(HashSet::new()),
            cancel: AtomicBool::new(false),
        }
    }

    /// Request cooperative cancellation of in-flight analysis
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// True the first time this (procedure, subject) pair is seen
    fn first_warning(&self, procedure: &str, subject: &str) -> bool {
        let mut warned = self.warned.lock().expect("warning set lock poisoned");
        warned.insert((
            procedure.to_ascii_lowercase(),
            subject.to_ascii_lowercase(),
        ))
    }

    /// Number of distinct warning subjects emitted over this context's
    /// lifetime. Re-analyzing the same store does not grow it.
    pub fn warning_count(&self) -> usize {
        self.warned.lock().expect("warning set lock poisoned").len()
    }
}

/// Analyze every procedure in the snapshot store under `root`
pub fn load_descriptors(root: &Path, ctx: &AnalysisContext) -> Result<Vec<ProcedureDescriptor>> {
    let store = SnapshotStore::open(root)?;
    let scalars = ScalarTypeCatalog::from_documents(store.scalar_types());
    let functions: FunctionSet = store
        .functions()
        .iter()
        .map(|f| (f.schema.to_ascii_lowercase(), f.name.to_ascii_lowercase()))
        .collect();
    let tables = ctx.registry.cache_for(&store.tables_root());
    let procedures = store.procedures();

    info!(
        procedures = procedures.len(),
        scalar_types = scalars.len(),
        functions = functions.len(),
        root = %root.display(),
        "analyzing snapshot"
    );

    let analyze = |doc: &ProcedureDocument| -> Option<ProcedureDescriptor> {
        if ctx.is_cancelled() {
            return None;
        }
        Some(analyze_procedure(doc, ctx, &tables, &scalars, &functions))
    };

    let mut descriptors: Vec<ProcedureDescriptor> = if procedures.len() >= PARALLEL_THRESHOLD {
        procedures.par_iter().filter_map(analyze).collect()
    } else {
        procedures.iter().filter_map(analyze).collect()
    };
    descriptors.sort_by(|a, b| {
        (a.schema.to_ascii_lowercase(), a.name.to_ascii_lowercase())
            .cmp(&(b.schema.to_ascii_lowercase(), b.name.to_ascii_lowercase()))
    });
    Ok(descriptors)
}

fn analyze_procedure(
    doc: &ProcedureDocument,
    ctx: &AnalysisContext,
    tables: &TableMetadataCache,
    scalars: &ScalarTypeCatalog,
    functions: &FunctionSet,
) -> ProcedureDescriptor {
    let full_name = format!("[{}].[{}]", doc.schema, doc.name);
    debug!(procedure = %full_name, "analyzing procedure");

    let mut collector = DependencyCollector::default();
    let mut input_parameters = Vec::new();
    let mut output_fields = Vec::new();
    for parameter in &doc.inputs {
        let field = parameter_field(parameter, ctx, scalars, &mut collector);
        if parameter.is_output {
            output_fields.push(field);
        } else {
            input_parameters.push(field);
        }
    }

    let result_sets = match doc.definition.as_deref() {
        Some(definition) => {
            let body = fragment::extract_procedure_body(definition);
            let parsed = fragment::parse(body);
            if parsed.is_ok() {
                let mut model = model_builder::build(&parsed.statements, body, &ctx.default_schema);
                aggregate::apply(&parsed.statements, &mut model);
                json_shape::apply(&parsed.statements, &mut model, body);
                post_process::apply(&mut model);
                collector.collect_model(&model, &ctx.default_schema, tables, functions);
                assemble_result_sets(&model.result_sets, &full_name, ctx, tables, scalars, &mut collector)
            } else {
                if ctx.first_warning(&full_name, "#parse") {
                    warn!(
                        procedure = %full_name,
                        errors = ?parsed.errors,
                        "definition did not parse; falling back to token scan"
                    );
                }
                // Token-level fallback still recovers EXEC pass-throughs
                let model = model_builder::build(&[], body, &ctx.default_schema);
                collector.collect_model(&model, &ctx.default_schema, tables, functions);
                assemble_result_sets(&model.result_sets, &full_name, ctx, tables, scalars, &mut collector)
            }
        }
        None => persisted_result_sets(&doc.result_sets, &ctx.default_schema, scalars, &mut collector),
    };

    ProcedureDescriptor {
        schema: doc.schema.clone(),
        name: doc.name.clone(),
        input_parameters,
        output_fields,
        result_sets,
        dependencies: collector.into_vec(),
    }
}

fn parameter_field(
    parameter: &ParameterDocument,
    ctx: &AnalysisContext,
    scalars: &ScalarTypeCatalog,
    collector: &mut DependencyCollector,
) -> FieldDescriptor {
    let name = parameter.name.trim_start_matches('@').to_string();
    let mut field = FieldDescriptor::named(name);
    field.is_nullable = Some(parameter.is_nullable);

    if parameter.is_table_type {
        let schema = parameter
            .table_type_schema
            .clone()
            .unwrap_or_else(|| ctx.default_schema.clone());
        let type_name = parameter
            .table_type_name
            .clone()
            .or_else(|| parameter.sql_type_name.clone())
            .unwrap_or_default();
        let reference =
            ObjectReference::new(ReferenceKind::UserDefinedTableType, schema, type_name);
        collector.add(reference.clone());
        field.reference = Some(reference);
        return field;
    }

    let resolved = parameter
        .sql_type_name
        .as_deref()
        .and_then(|declared| token_for_declared_type(declared, parameter.max_length))
        .and_then(|token| scalars.resolve(&token));
    if let Some(resolved) = resolved {
        field.target_type = Some(resolved.base_type);
        field.sql_type = Some(resolved.sql_type);
        field.max_length = resolved.max_length;
        field.precision = resolved.precision;
        field.scale = resolved.scale;
        if let Some((schema, name)) = resolved.user_defined {
            let reference = ObjectReference::new(ReferenceKind::UserDefinedType, schema, name);
            collector.add(reference.clone());
            field.reference = Some(reference);
        }
    }
    field
}

fn assemble_result_sets(
    sets: &[ResultSetModel],
    procedure: &str,
    ctx: &AnalysisContext,
    tables: &TableMetadataCache,
    scalars: &ScalarTypeCatalog,
    collector: &mut DependencyCollector,
) -> Vec<ResultSetDescriptor> {
    let mut names = NameAllocator::default();
    sets.iter()
        .map(|set| {
            let base_name = set
                .tables
                .first()
                .map(|t| t.name.clone())
                .unwrap_or_else(|| format!("ResultSet{}", set.index + 1));
            let name = names.allocate(&base_name);

            let mut fields = NameAllocator::default();
            let fields: Vec<FieldDescriptor> = set
                .columns
                .iter()
                .map(|column| {
                    let mut field = column_field(column, procedure, ctx, tables, scalars, collector);
                    field.name = fields.allocate(&field.name);
                    field
                })
                .collect();

            ResultSetDescriptor {
                index: set.index,
                name,
                is_scalar: fields.len() == 1 && !set.has_select_star && !set.returns_json,
                has_select_star: set.has_select_star,
                returns_json: set.returns_json,
                returns_json_array: set.returns_json_array,
                json_root: set.json_root.clone(),
                reference: set.exec_reference.clone(),
                fields,
            }
        })
        .collect()
}

fn column_field(
    column: &ColumnModel,
    procedure: &str,
    ctx: &AnalysisContext,
    tables: &TableMetadataCache,
    scalars: &ScalarTypeCatalog,
    collector: &mut DependencyCollector,
) -> FieldDescriptor {
    let mut field = FieldDescriptor::named(column.name.clone());
    field.reference = column.reference.clone();
    field.deferred_expansion = column.deferred_expansion;

    match type_resolution::resolve(column, &ctx.default_schema, tables, scalars) {
        Some(resolved) => {
            field.target_type = Some(resolved.base_type);
            field.sql_type = Some(resolved.sql_type);
            field.is_nullable = resolved.is_nullable;
            field.max_length = resolved.max_length;
            field.precision = resolved.precision;
            field.scale = resolved.scale;
            if let Some(udt) = resolved.user_defined {
                collector.add(udt.clone());
                if field.reference.is_none() {
                    field.reference = Some(udt);
                }
            }
        }
        None => {
            if ctx.first_warning(procedure, &column.name) {
                warn!(
                    procedure = %procedure,
                    column = %column.name,
                    expression = %column.raw_expression,
                    "column type could not be resolved"
                );
            }
        }
    }
    field
}

/// Result sets persisted by a previous run, used when a procedure document
/// carries no definition text to re-analyze.
fn persisted_result_sets(
    documents: &[ResultSetDocument],
    default_schema: &str,
    scalars: &ScalarTypeCatalog,
    collector: &mut DependencyCollector,
) -> Vec<ResultSetDescriptor> {
    let mut names = NameAllocator::default();
    documents
        .iter()
        .enumerate()
        .map(|(index, doc)| {
            let base_name = doc
                .name
                .clone()
                .unwrap_or_else(|| format!("ResultSet{}", index + 1));
            let reference = doc.exec_source_procedure_name.as_ref().map(|name| {
                let schema = doc
                    .exec_source_schema_name
                    .clone()
                    .unwrap_or_else(|| default_schema.to_string());
                let reference = ObjectReference::new(ReferenceKind::Procedure, schema, name.clone());
                collector.add(reference.clone());
                reference
            });

            let fields: Vec<FieldDescriptor> = doc
                .columns
                .iter()
                .map(|column| {
                    let mut field = FieldDescriptor::named(column.name.clone());
                    field.is_nullable = Some(column.is_nullable);
                    let resolved = column
                        .sql_type_name
                        .as_deref()
                        .and_then(parse_type_token)
                        .map(|mut token| {
                            token.max_length = token.max_length.or(column.max_length);
                            token.precision = token.precision.or(column.precision);
                            token.scale = token.scale.or(column.scale);
                            token
                        })
                        .and_then(|token| scalars.resolve(&token));
                    if let Some(resolved) = resolved {
                        field.target_type = Some(resolved.base_type);
                        field.sql_type = Some(resolved.sql_type);
                        field.max_length = resolved.max_length;
                        field.precision = resolved.precision;
                        field.scale = resolved.scale;
                    }
                    field
                })
                .collect();

            ResultSetDescriptor {
                index,
                name: names.allocate(&base_name),
                is_scalar: fields.len() == 1 && !doc.has_select_star && !doc.returns_json,
                has_select_star: doc.has_select_star,
                returns_json: doc.returns_json,
                returns_json_array: doc.returns_json_array,
                json_root: None,
                reference,
                fields,
            }
        })
        .collect()
}

/// Case-insensitive sibling-name de-duplication: the first taker keeps the
/// name, later takers get a numeric suffix starting at 2.
#[derive(Default)]
struct NameAllocator {
    taken: HashSet<String>,
}

impl NameAllocator {
    fn allocate(&mut self, base: &str) -> String {
        let key = base.to_ascii_lowercase();
        if self.taken.insert(key.clone()) {
            return base.to_string();
        }
        let mut suffix = 2usize;
        loop {
            let candidate = format!("{base}{suffix}");
            if self.taken.insert(candidate.to_ascii_lowercase()) {
                return candidate;
            }
            suffix += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, text: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    fn store_with_procedure(definition: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("index.json"),
            r#"{"Procedures":[{"File":"dbo.P.json","Name":"P","Schema":"dbo"}]}"#,
        );
        write(
            &dir.path().join("procedures/dbo.P.json"),
            &serde_json::json!({
                "Schema": "dbo",
                "Name": "P",
                "Definition": definition,
            })
            .to_string(),
        );
        dir
    }

    #[test]
    fn test_single_column_set_is_scalar() {
        let dir = store_with_procedure("SELECT COUNT(*) AS Total FROM Orders o");
        let ctx = AnalysisContext::new("dbo");
        let descriptors = load_descriptors(dir.path(), &ctx).unwrap();
        assert_eq!(descriptors.len(), 1);
        let set = &descriptors[0].result_sets[0];
        assert!(set.is_scalar);
        assert_eq!(set.fields[0].sql_type.as_deref(), Some("int"));
        assert_eq!(set.fields[0].is_nullable, Some(false));
    }

    #[test]
    fn test_result_set_named_after_first_table() {
        let dir = store_with_procedure(
            "SELECT o.Id, c.Name FROM Orders o JOIN Customers c ON c.Id = o.CustomerId",
        );
        let ctx = AnalysisContext::new("dbo");
        let descriptors = load_descriptors(dir.path(), &ctx).unwrap();
        assert_eq!(descriptors[0].result_sets[0].name, "Orders");
        assert!(!descriptors[0].result_sets[0].is_scalar);
    }

    #[test]
    fn test_sibling_set_names_deduplicated() {
        let dir = store_with_procedure(
            "SELECT o.Id FROM Orders o; SELECT o.Total FROM Orders o",
        );
        let ctx = AnalysisContext::new("dbo");
        let descriptors = load_descriptors(dir.path(), &ctx).unwrap();
        let names: Vec<&str> = descriptors[0]
            .result_sets
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["Orders", "Orders2"]);
    }

    #[test]
    fn test_duplicate_field_names_suffixed() {
        let dir = store_with_procedure("SELECT o.Id, c.Id FROM Orders o, Customers c");
        let ctx = AnalysisContext::new("dbo");
        let descriptors = load_descriptors(dir.path(), &ctx).unwrap();
        let fields: Vec<&str> = descriptors[0].result_sets[0]
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(fields, vec!["Id", "Id2"]);
    }

    #[test]
    fn test_unparseable_definition_keeps_exec_passthrough() {
        let dir = store_with_procedure("SELECT FROM FROM; EXEC dbo.GetOrders @Top = 5");
        let ctx = AnalysisContext::new("dbo");
        let descriptors = load_descriptors(dir.path(), &ctx).unwrap();
        let sets = &descriptors[0].result_sets;
        assert_eq!(sets.len(), 1);
        let reference = sets[0].reference.as_ref().unwrap();
        assert_eq!(reference.kind, ReferenceKind::Procedure);
        assert_eq!(reference.name, "GetOrders");
        assert!(descriptors[0]
            .dependencies
            .iter()
            .any(|d| d.name == "GetOrders"));
    }

    #[test]
    fn test_parameters_split_and_resolved() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("index.json"),
            r#"{"Procedures":[{"File":"p.json","Name":"Save","Schema":"dbo"}]}"#,
        );
        write(
            &dir.path().join("procedures/p.json"),
            r#"{"Schema":"dbo","Name":"Save","Definition":"SELECT 1 AS ok","Inputs":[
                {"Name":"@Name","SqlTypeName":"nvarchar","MaxLength":50},
                {"Name":"@Rows","SqlTypeName":"OrderRows","IsTableType":true,"TableTypeSchema":"dbo","TableTypeName":"OrderRows"},
                {"Name":"@NewId","SqlTypeName":"int","IsOutput":true}
            ]}"#,
        );
        let ctx = AnalysisContext::new("dbo");
        let descriptors = load_descriptors(dir.path(), &ctx).unwrap();
        let proc = &descriptors[0];

        assert_eq!(proc.input_parameters.len(), 2);
        assert_eq!(proc.input_parameters[0].name, "Name");
        assert_eq!(
            proc.input_parameters[0].sql_type.as_deref(),
            Some("nvarchar(50)")
        );
        let tvp = &proc.input_parameters[1];
        assert_eq!(
            tvp.reference.as_ref().unwrap().kind,
            ReferenceKind::UserDefinedTableType
        );

        assert_eq!(proc.output_fields.len(), 1);
        assert_eq!(proc.output_fields[0].name, "NewId");
        assert_eq!(proc.output_fields[0].sql_type.as_deref(), Some("int"));

        assert!(proc
            .dependencies
            .iter()
            .any(|d| d.kind == ReferenceKind::UserDefinedTableType && d.name == "OrderRows"));
    }

    #[test]
    fn test_persisted_result_sets_used_without_definition() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("index.json"),
            r#"{"Procedures":[{"File":"p.json","Name":"External","Schema":"dbo"}]}"#,
        );
        write(
            &dir.path().join("procedures/p.json"),
            r#"{"Schema":"dbo","Name":"External","ResultSets":[
                {"Name":"Orders","Columns":[{"Name":"Id","SqlTypeName":"int"},{"Name":"Total","SqlTypeName":"decimal","Precision":18,"Scale":2,"IsNullable":true}],"ReturnsJson":false}
            ]}"#,
        );
        let ctx = AnalysisContext::new("dbo");
        let descriptors = load_descriptors(dir.path(), &ctx).unwrap();
        let set = &descriptors[0].result_sets[0];
        assert_eq!(set.name, "Orders");
        assert_eq!(set.fields[1].sql_type.as_deref(), Some("decimal(18,2)"));
        assert_eq!(set.fields[1].is_nullable, Some(true));
    }

    #[test]
    fn test_cancelled_context_produces_nothing() {
        let dir = store_with_procedure("SELECT 1 AS ok");
        let ctx = AnalysisContext::new("dbo");
        ctx.cancel();
        let descriptors = load_descriptors(dir.path(), &ctx).unwrap();
        assert!(descriptors.is_empty());
    }

    #[test]
    fn test_descriptors_sorted_by_schema_and_name() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("index.json"),
            r#"{"Procedures":[
                {"File":"z.json","Name":"Zeta","Schema":"dbo"},
                {"File":"a.json","Name":"Alpha","Schema":"dbo"}
            ]}"#,
        );
        write(
            &dir.path().join("procedures/z.json"),
            r#"{"Schema":"dbo","Name":"Zeta","Definition":"SELECT 1 AS ok"}"#,
        );
        write(
            &dir.path().join("procedures/a.json"),
            r#"{"Schema":"dbo","Name":"Alpha","Definition":"SELECT 1 AS ok"}"#,
        );
        let ctx = AnalysisContext::new("dbo");
        let descriptors = load_descriptors(dir.path(), &ctx).unwrap();
        let names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Zeta"]);
    }
}
