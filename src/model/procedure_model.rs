//! Mutable working model built by the analysis passes.
//!
//! The model builder produces one `ProcedureModel` per procedure; the
//! aggregate, JSON and post-processing passes each compute their findings
//! separately and merge them in via reducers keyed by
//! `(result set index, column name)` rather than mutating columns found by
//! ad-hoc alias lookup.

use crate::model::ObjectReference;

/// Closed classification of a projected expression.
///
/// Every analysis pass matches exhaustively over this union, so adding a
/// kind forces every pass to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpressionKind {
    /// Plain column reference (`t.Col`), possibly aliased
    ColumnRef,
    /// Function call (`dbo.fn(x)`, `COUNT(*)`)
    FunctionCall,
    /// `CAST(... AS type)` / `CONVERT(type, ...)`
    Cast,
    /// Numeric/string/NULL literal
    Literal,
    /// `CASE ... END`
    Case,
    /// Scalar subquery `(SELECT ...)`
    Subquery,
    /// Anything else, including expressions the parser could not decompose
    #[default]
    Computed,
}

/// A SQL type written at a usage site (cast target or parameter declaration),
/// e.g. `decimal(18,2)`, `nvarchar(max)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeToken {
    /// Lower-cased type name; may be schema-qualified for user-defined types
    pub schema: Option<String>,
    pub name: String,
    /// -1 encodes `max`
    pub max_length: Option<i64>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
}

/// One projected column as the passes see it
#[derive(Debug, Clone, Default)]
pub struct ColumnModel {
    /// Output name (alias, column name, or synthesized `Column{N}`)
    pub name: String,
    pub expression_kind: ExpressionKind,
    /// Raw expression text, used by textual fallbacks and boolean heuristics
    pub raw_expression: String,

    // Source binding for table-metadata lookup (identifier parts walked
    // right-to-left: column, table, schema)
    pub source_schema: Option<String>,
    pub source_table: Option<String>,
    pub source_column: Option<String>,
    /// True when the column comes from the nullable side of an outer join
    pub forced_nullable: bool,

    /// Cast/convert target; always wins over anything learned from the source
    pub cast_type: Option<TypeToken>,

    // Aggregate annotations (pass 2 / post-processor)
    pub is_aggregate: bool,
    /// Lower-cased aggregate function name when `is_aggregate`
    pub aggregate_function: Option<String>,
    pub has_integer_literal: bool,
    pub has_decimal_literal: bool,

    // JSON annotations (pass 3)
    pub is_nested_json: bool,
    pub returns_json: bool,
    pub returns_json_array: bool,
    pub json_root: Option<String>,

    /// Routine this column is bound to (schema-qualified function call or
    /// forwarded JSON payload)
    pub reference: Option<ObjectReference>,
    /// True when the column must be replaced by the referenced routine's
    /// expanded shape
    pub deferred_expansion: bool,
}

impl ColumnModel {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A table (or view) referenced in a FROM clause, after alias resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSource {
    pub schema: Option<String>,
    pub name: String,
    pub alias: Option<String>,
    /// True when the source sits on the nullable side of an outer join
    pub nullable_side: bool,
}

/// One top-level query specification's working shape
#[derive(Debug, Clone, Default)]
pub struct ResultSetModel {
    pub index: usize,
    pub columns: Vec<ColumnModel>,
    pub has_select_star: bool,
    /// Tables referenced in the FROM clause, in order of appearance
    pub tables: Vec<TableSource>,
    pub returns_json: bool,
    pub returns_json_array: bool,
    pub json_root: Option<String>,
    /// Set for pure EXEC pass-through sets with no native columns
    pub exec_reference: Option<ObjectReference>,
}

impl ResultSetModel {
    /// Look up a table source by alias or name, case-insensitive
    pub fn table_for_qualifier(&self, qualifier: &str) -> Option<&TableSource> {
        self.tables.iter().find(|t| {
            t.alias
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(qualifier))
                || t.name.eq_ignore_ascii_case(qualifier)
        })
    }
}

/// An `EXEC schema.proc` reference captured from the body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedProcedureRef {
    /// Absent when the call site had no schema qualifier
    pub schema: Option<String>,
    pub name: String,
}

/// Working model for one procedure, fed through the passes in sequence
#[derive(Debug, Clone, Default)]
pub struct ProcedureModel {
    pub schema: String,
    pub name: String,
    pub result_sets: Vec<ResultSetModel>,
    /// EXEC references in order of appearance, after supersession
    pub executed_procedures: Vec<ExecutedProcedureRef>,
}

impl ProcedureModel {
    /// Merge a per-pass finding into a column, keyed by result-set index and
    /// column name (case-insensitive).
    pub fn update_column<F>(&mut self, set_index: usize, column_name: &str, update: F)
    where
        F: FnOnce(&mut ColumnModel),
    {
        if let Some(set) = self.result_sets.get_mut(set_index) {
            if let Some(column) = set
                .columns
                .iter_mut()
                .find(|c| c.name.eq_ignore_ascii_case(column_name))
            {
                update(column);
            }
        }
    }
}
