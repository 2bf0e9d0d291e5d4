//! Column type resolution.
//!
//! An ordered chain of resolver links tried in sequence, first success wins:
//!
//! 1. cast/convert target type
//! 2. table/view column binding through the metadata cache
//! 3. aggregate-function heuristic
//! 4. boolean-expression heuristic
//!
//! No link fabricates a type: an exhausted chain returns `None` and the
//! caller emits the descriptor without a `sql_type`.

use std::sync::LazyLock;

use regex::Regex;

use crate::analysis::scalar_types::{parse_type_token, ScalarTypeCatalog};
use crate::metadata::TableMetadataCache;
use crate::model::{ColumnModel, ExpressionKind, ObjectReference, ReferenceKind, TypeToken};
use crate::util::starts_with_ci;

static BOOLEAN_CASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bTHEN\s+1\b.*?\bELSE\s+0\b|\bTHEN\s+0\b.*?\bELSE\s+1\b").unwrap()
});

/// A resolved column type
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedColumnType {
    /// Normalized lower-cased base type name
    pub base_type: String,
    /// Formatted SQL type
    pub sql_type: String,
    pub is_nullable: Option<bool>,
    pub max_length: Option<i64>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    /// User-defined type the column's declared type resolved through
    pub user_defined: Option<ObjectReference>,
}

/// Resolve a column's SQL type, or `None` when no link matches
pub fn resolve(
    column: &ColumnModel,
    default_schema: &str,
    tables: &TableMetadataCache,
    scalars: &ScalarTypeCatalog,
) -> Option<ResolvedColumnType> {
    let links: [fn(
        &ColumnModel,
        &str,
        &TableMetadataCache,
        &ScalarTypeCatalog,
    ) -> Option<ResolvedColumnType>; 4] = [
        resolve_cast_target,
        resolve_table_binding,
        resolve_aggregate_heuristic,
        resolve_boolean_heuristic,
    ];

    let mut resolved = links
        .iter()
        .find_map(|link| link(column, default_schema, tables, scalars))?;

    // A column from the nullable side of an outer join is nullable no matter
    // what its source says
    if column.forced_nullable {
        resolved.is_nullable = Some(true);
    }
    Some(resolved)
}

/// Link 1: the cast target always wins over anything learned from the source
fn resolve_cast_target(
    column: &ColumnModel,
    _default_schema: &str,
    _tables: &TableMetadataCache,
    scalars: &ScalarTypeCatalog,
) -> Option<ResolvedColumnType> {
    let token = column.cast_type.as_ref()?;
    let resolved = scalars.resolve(token)?;
    Some(ResolvedColumnType {
        base_type: resolved.base_type,
        sql_type: resolved.sql_type,
        is_nullable: None,
        max_length: resolved.max_length,
        precision: resolved.precision,
        scale: resolved.scale,
        user_defined: resolved
            .user_defined
            .map(|(schema, name)| ObjectReference::new(ReferenceKind::UserDefinedType, schema, name)),
    })
}

/// Link 2: bind to a table column through the metadata cache
fn resolve_table_binding(
    column: &ColumnModel,
    default_schema: &str,
    tables: &TableMetadataCache,
    scalars: &ScalarTypeCatalog,
) -> Option<ResolvedColumnType> {
    let table_name = column.source_table.as_deref()?;
    let column_name = column.source_column.as_deref()?;
    let schema = column.source_schema.as_deref().unwrap_or(default_schema);

    let table = tables.try_get(schema, table_name)?;
    let info = table.column(column_name)?;

    let mut token = parse_type_token(info.sql_type.as_deref()?)?;
    token.max_length = token.max_length.or(info.max_length);
    token.precision = token.precision.or(info.precision);
    token.scale = token.scale.or(info.scale);

    let resolved = scalars.resolve(&token)?;
    Some(ResolvedColumnType {
        base_type: resolved.base_type,
        sql_type: resolved.sql_type,
        is_nullable: Some(info.is_nullable),
        max_length: resolved.max_length,
        precision: resolved.precision,
        scale: resolved.scale,
        user_defined: resolved
            .user_defined
            .map(|(schema, name)| ObjectReference::new(ReferenceKind::UserDefinedType, schema, name)),
    })
}

/// Shared aggregate-to-type table (also documented in the post-processor):
/// `COUNT` -> int, `COUNT_BIG` -> bigint, `EXISTS` -> bit (all not
/// nullable); `SUM`/`AVG` -> decimal unless the literal evidence is
/// integer-only; `MIN`/`MAX` follow the literal evidence or stay untyped.
fn resolve_aggregate_heuristic(
    column: &ColumnModel,
    _default_schema: &str,
    _tables: &TableMetadataCache,
    _scalars: &ScalarTypeCatalog,
) -> Option<ResolvedColumnType> {
    let function = column.aggregate_function.as_deref()?;
    let (base, nullable) = match function {
        "count" => ("int", false),
        "count_big" => ("bigint", false),
        "exists" => ("bit", false),
        "sum" | "avg" => {
            if column.has_integer_literal && !column.has_decimal_literal {
                ("int", true)
            } else {
                ("decimal", true)
            }
        }
        "min" | "max" => {
            if column.has_decimal_literal {
                ("decimal", true)
            } else if column.has_integer_literal {
                ("int", true)
            } else {
                return None;
            }
        }
        _ => return None,
    };
    Some(simple_type(base, nullable))
}

/// Link 4: `EXISTS (...)` and `CASE ... THEN 1 ELSE 0` shapes are booleans
fn resolve_boolean_heuristic(
    column: &ColumnModel,
    _default_schema: &str,
    _tables: &TableMetadataCache,
    _scalars: &ScalarTypeCatalog,
) -> Option<ResolvedColumnType> {
    if starts_with_ci(column.raw_expression.trim_start(), "EXISTS") {
        return Some(simple_type("bit", false));
    }
    if column.expression_kind == ExpressionKind::Case
        && BOOLEAN_CASE_RE.is_match(&column.raw_expression)
    {
        return Some(simple_type("bit", true));
    }
    None
}

fn simple_type(base: &str, nullable: bool) -> ResolvedColumnType {
    ResolvedColumnType {
        base_type: base.to_string(),
        sql_type: base.to_string(),
        is_nullable: Some(nullable),
        max_length: None,
        precision: None,
        scale: None,
        user_defined: None,
    }
}

/// Build the token a cast target resolves through (exposed for parameter
/// type resolution, which shares the same normalization path)
pub fn token_for_declared_type(declared: &str, max_length: Option<i64>) -> Option<TypeToken> {
    let mut token = parse_type_token(declared)?;
    token.max_length = token.max_length.or(max_length);
    Some(token)
}
