//! Immutable descriptor types consumed by the code-generation layer.
//!
//! Descriptors are produced once per analysis run and never mutated after
//! assembly. Re-analysis re-creates them from scratch.

use serde::{Deserialize, Serialize};

/// Kind of database object a reference or dependency points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReferenceKind {
    Procedure,
    Function,
    View,
    Table,
    UserDefinedType,
    UserDefinedTableType,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Procedure => "Procedure",
            ReferenceKind::Function => "Function",
            ReferenceKind::View => "View",
            ReferenceKind::Table => "Table",
            ReferenceKind::UserDefinedType => "UserDefinedType",
            ReferenceKind::UserDefinedTableType => "UserDefinedTableType",
        }
    }
}

/// A schema-qualified reference to another database object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReference {
    pub kind: ReferenceKind,
    pub schema: String,
    pub name: String,
}

impl ObjectReference {
    pub fn new(kind: ReferenceKind, schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Full name (e.g. `[dbo].[Orders]`)
    pub fn full_name(&self) -> String {
        format!("[{}].[{}]", self.schema, self.name)
    }
}

/// One projected column or parameter.
///
/// `name` may contain `.`-separated segments representing a JSON nesting path
/// (e.g. `account.type.code`); segments are never re-split on `_`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    /// Normalized base type name without length/precision (e.g. `nvarchar`)
    pub target_type: Option<String>,
    /// Fully formatted SQL type (e.g. `nvarchar(50)`); absent until resolved
    pub sql_type: Option<String>,
    pub is_nullable: Option<bool>,
    /// Character/byte length; -1 encodes `max`
    pub max_length: Option<i64>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    /// Set when the column is bound to another routine's output
    pub reference: Option<ObjectReference>,
    /// True when the column stands in for another routine's JSON payload and
    /// must be replaced by the generator, not emitted directly
    pub deferred_expansion: bool,
}

impl FieldDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// One SELECT's projection shape at a given ordinal position.
///
/// When `returns_json` is set the `fields` list describes the logical JSON
/// shape, never the single serialized-text column the query physically
/// materializes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSetDescriptor {
    /// Stable sequence position within the procedure
    pub index: usize,
    /// Derived from the first base table referenced, or `ResultSet{N}`,
    /// de-duplicated against sibling names
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    pub is_scalar: bool,
    pub has_select_star: bool,
    pub returns_json: bool,
    pub returns_json_array: bool,
    /// `ROOT('name')` property, when present
    pub json_root: Option<String>,
    /// Cross-procedure forwarding target when the set is a pure EXEC
    /// pass-through with no native fields
    pub reference: Option<ObjectReference>,
}

/// One stored procedure's analyzed shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedureDescriptor {
    pub schema: String,
    pub name: String,
    pub input_parameters: Vec<FieldDescriptor>,
    pub output_fields: Vec<FieldDescriptor>,
    pub result_sets: Vec<ResultSetDescriptor>,
    pub dependencies: Vec<ProcedureDependency>,
}

impl ProcedureDescriptor {
    /// Full name (e.g. `[dbo].[GetOrders]`)
    pub fn full_name(&self) -> String {
        format!("[{}].[{}]", self.schema, self.name)
    }
}

/// A deduplicated dependency of a procedure on another database object
pub type ProcedureDependency = ObjectReference;
