//! Scalar type resolution: `schema.typename` references to a normalized base
//! type plus length/precision/scale, and the formatting rules shared by every
//! place a SQL type is rendered.

use std::collections::HashMap;

use crate::metadata::ScalarTypeDocument;
use crate::model::TypeToken;
use crate::util::unquote_ident;

/// Encodes `max` for length-carrying types
pub const MAX_LENGTH_SENTINEL: i64 = -1;

const SYSTEM_TYPES: &[&str] = &[
    "bigint",
    "binary",
    "bit",
    "char",
    "date",
    "datetime",
    "datetime2",
    "datetimeoffset",
    "decimal",
    "float",
    "geography",
    "geometry",
    "hierarchyid",
    "image",
    "int",
    "money",
    "nchar",
    "ntext",
    "numeric",
    "nvarchar",
    "real",
    "smalldatetime",
    "smallint",
    "smallmoney",
    "sql_variant",
    "sysname",
    "text",
    "time",
    "timestamp",
    "tinyint",
    "uniqueidentifier",
    "varbinary",
    "varchar",
    "xml",
];

fn is_system_type(name: &str) -> bool {
    SYSTEM_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(name))
}

fn is_length_type(name: &str) -> bool {
    matches!(
        name,
        "char" | "varchar" | "nchar" | "nvarchar" | "binary" | "varbinary"
    )
}

fn is_precision_type(name: &str) -> bool {
    matches!(name, "decimal" | "numeric")
}

fn is_scale_only_type(name: &str) -> bool {
    matches!(name, "datetime2" | "datetimeoffset" | "time")
}

/// A fully resolved SQL type
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedType {
    /// Normalized lower-cased base type name (no length/precision)
    pub base_type: String,
    /// Formatted type (e.g. `decimal(18,2)`, `nvarchar(max)`)
    pub sql_type: String,
    pub max_length: Option<i64>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    /// User-defined type identity (schema, name) when the reference resolved
    /// through the scalar-type catalog
    pub user_defined: Option<(String, String)>,
}

/// Resolved user-defined scalar type, loaded once per cache generation
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarTypeInfo {
    pub schema: String,
    pub name: String,
    pub base_sql_type_name: String,
    pub max_length: Option<i64>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
}

/// Catalog of user-defined scalar types, keyed case-insensitively
#[derive(Debug, Default)]
pub struct ScalarTypeCatalog {
    by_key: HashMap<(String, String), ScalarTypeInfo>,
}

impl ScalarTypeCatalog {
    pub fn from_documents(documents: Vec<ScalarTypeDocument>) -> Self {
        let mut by_key = HashMap::new();
        for doc in documents {
            let Some(base) = doc.base_sql_type_name else {
                continue;
            };
            let key = (
                doc.schema.to_ascii_lowercase(),
                doc.name.to_ascii_lowercase(),
            );
            by_key.insert(
                key,
                ScalarTypeInfo {
                    schema: doc.schema,
                    name: doc.name,
                    base_sql_type_name: base.to_ascii_lowercase(),
                    max_length: doc.max_length,
                    precision: doc.precision,
                    scale: doc.scale,
                },
            );
        }
        Self { by_key }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Resolve a type reference. Caller-supplied length/precision/scale on
    /// the token take priority over the catalog's stored values (the usage
    /// site is more specific). Unknown type names resolve to `None`.
    pub fn resolve(&self, token: &TypeToken) -> Option<ResolvedType> {
        let name = token.name.to_ascii_lowercase();
        let schema = token
            .schema
            .as_deref()
            .map(str::to_ascii_lowercase);

        // sys.<name> (or an unqualified system type name) is itself a base type
        let is_sys = matches!(schema.as_deref(), Some("sys") | None) && is_system_type(&name);
        if is_sys {
            return Some(format_resolved(
                &name,
                token.max_length,
                token.precision,
                token.scale,
                None,
            ));
        }

        let key = (
            schema.unwrap_or_else(|| "dbo".to_string()),
            name,
        );
        let info = self.by_key.get(&key)?;
        Some(format_resolved(
            &info.base_sql_type_name,
            token.max_length.or(info.max_length),
            token.precision.or(info.precision),
            token.scale.or(info.scale),
            Some((info.schema.clone(), info.name.clone())),
        ))
    }
}

fn format_resolved(
    base: &str,
    max_length: Option<i64>,
    precision: Option<u8>,
    scale: Option<u8>,
    user_defined: Option<(String, String)>,
) -> ResolvedType {
    ResolvedType {
        base_type: base.to_string(),
        sql_type: format_sql_type(base, max_length, precision, scale),
        max_length,
        precision,
        scale,
        user_defined,
    }
}

/// Render a base type with its length/precision/scale:
/// - `decimal`/`numeric` as `type(precision,scale)`, scale defaulting to 0
/// - string/binary families as `type(length)` or `type(max)`
/// - `datetime2`/`datetimeoffset`/`time` with scale only
pub fn format_sql_type(
    base: &str,
    max_length: Option<i64>,
    precision: Option<u8>,
    scale: Option<u8>,
) -> String {
    let base = base.to_ascii_lowercase();
    if is_precision_type(&base) {
        if let Some(precision) = precision {
            return format!("{}({},{})", base, precision, scale.unwrap_or(0));
        }
        return base;
    }
    if is_length_type(&base) {
        return match max_length {
            Some(MAX_LENGTH_SENTINEL) | None => format!("{}(max)", base),
            Some(len) => format!("{}({})", base, len),
        };
    }
    if is_scale_only_type(&base) {
        if let Some(scale) = scale {
            return format!("{}({})", base, scale);
        }
        return base;
    }
    base
}

/// Parse a SQL type written at a usage site (`decimal(18, 2)`,
/// `NVARCHAR(MAX)`, `[dbo].[MyType]`, `time(3)`) into a `TypeToken`.
/// Arguments are interpreted by type family; unknown shapes keep the bare
/// name so catalog lookup can still run.
pub fn parse_type_token(text: &str) -> Option<TypeToken> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let (name_part, args_part) = match text.find('(') {
        Some(open) => {
            let close = text.rfind(')')?;
            (&text[..open], Some(&text[open + 1..close]))
        }
        None => (text, None),
    };

    let parts: Vec<&str> = name_part
        .split('.')
        .map(unquote_ident)
        .filter(|p| !p.is_empty())
        .collect();
    let (schema, name) = match parts.as_slice() {
        [name] => (None, name.to_string()),
        [schema, name] => (Some(schema.to_string()), name.to_string()),
        [.., schema, name] => (Some(schema.to_string()), name.to_string()),
        [] => return None,
    };
    let lower = name.to_ascii_lowercase();

    let mut token = TypeToken {
        schema,
        name: lower.clone(),
        max_length: None,
        precision: None,
        scale: None,
    };

    if let Some(args) = args_part {
        let values: Vec<&str> = args.split(',').map(str::trim).collect();
        if is_precision_type(&lower) {
            token.precision = values.first().and_then(|v| v.parse().ok());
            token.scale = values.get(1).and_then(|v| v.parse().ok());
        } else if is_scale_only_type(&lower) {
            token.scale = values.first().and_then(|v| v.parse().ok());
        } else if let Some(first) = values.first() {
            if first.eq_ignore_ascii_case("max") {
                token.max_length = Some(MAX_LENGTH_SENTINEL);
            } else {
                token.max_length = first.parse().ok();
            }
        }
    }

    Some(token)
}
