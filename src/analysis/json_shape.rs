//! JSON shape analysis: the third AST pass.
//!
//! Classifies each top-level query's `FOR JSON` clause (array-of-objects by
//! default, single object with `WITHOUT_ARRAY_WRAPPER`, root property from
//! `ROOT('name')`), and detects nested JSON one level below the top: a scalar
//! sub-select with its own `FOR JSON` clause, or a `JSON_QUERY` call. Nested
//! detection is depth-bounded — sub-selects inside a deeper scalar subquery
//! are not inspected, to avoid over-marking.
//!
//! When the structured clause is unavailable the pass falls back to a
//! windowed scan of the raw SQL text. Only windows that are themselves
//! top-level queries participate, and only a `FOR JSON` token at parenthesis
//! depth zero of the window counts — a subquery's clause never marks the
//! outer set.

use std::sync::LazyLock;

use regex::Regex;
use sqlparser::ast::{Expr, ForClause, FunctionArguments, Query, SelectItem, Statement};

use crate::analysis::model_builder::{leftmost_select, project_item_name, top_level_queries};
use crate::fragment::{find_top_level_ci, split_statement_windows};
use crate::model::ProcedureModel;
use crate::util::{contains_ci, find_ci, starts_with_ci};

/// Lookahead after the `FOR JSON` token inside which options are recognized
const OPTION_LOOKAHEAD: usize = 160;

static ROOT_OPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bROOT\s*\(\s*'([^']*)'\s*\)").unwrap());

/// A recognized `FOR JSON` clause shape
#[derive(Debug, Clone, PartialEq)]
pub struct JsonClause {
    /// False when `WITHOUT_ARRAY_WRAPPER` suppresses the outer array
    pub is_array: bool,
    pub root: Option<String>,
}

/// Annotate the model's result sets and columns with JSON shape findings
pub fn apply(statements: &[Statement], model: &mut ProcedureModel, raw_text: &str) {
    let select_windows = query_windows(raw_text);

    for (set_index, query) in top_level_queries(statements).into_iter().enumerate() {
        let clause = structured_json_clause(query).or_else(|| {
            select_windows
                .get(set_index)
                .and_then(|window| scan_window_for_json(window))
        });

        if let Some(clause) = clause {
            if let Some(set) = model.result_sets.get_mut(set_index) {
                set.returns_json = true;
                set.returns_json_array = clause.is_array;
                set.json_root = clause.root;
            }
        }

        // Nested JSON one level below the top
        let Some(select) = leftmost_select(&query.body) else {
            continue;
        };
        for (index, item) in select.projection.iter().enumerate() {
            let Some(name) = project_item_name(item, index) else {
                continue;
            };
            let expr = match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
                _ => continue,
            };
            if let Some(clause) = detect_nested_json(expr) {
                model.update_column(set_index, &name, |column| {
                    column.is_nested_json = true;
                    column.returns_json = true;
                    column.returns_json_array = clause.is_array;
                    column.json_root = clause.root;
                    // A routine-backed JSON column is a placeholder for that
                    // routine's payload and must be expanded, not emitted
                    if column.reference.is_some() {
                        column.deferred_expansion = true;
                    }
                });
            }
        }
    }
}

fn structured_json_clause(query: &Query) -> Option<JsonClause> {
    match &query.for_clause {
        Some(ForClause::Json {
            root,
            without_array_wrapper,
            ..
        }) => Some(JsonClause {
            is_array: !without_array_wrapper,
            root: root.clone(),
        }),
        _ => None,
    }
}

/// Statement windows that are themselves top-level queries, in statement
/// order. Windows belonging to non-query statements (`INSERT ... SELECT`,
/// `IF EXISTS(SELECT ...)`) are dropped so window indexes line up with the
/// parsed query list.
fn query_windows(raw_text: &str) -> Vec<&str> {
    split_statement_windows(raw_text)
        .into_iter()
        .filter(|w| {
            let head = w.trim_start();
            starts_with_ci(head, "select")
                || starts_with_ci(head, "with")
                || head.starts_with('(')
        })
        .collect()
}

/// Degraded but deterministic fallback for a whole statement window: only a
/// `FOR JSON` at parenthesis depth zero belongs to the window's own query.
fn scan_window_for_json(window: &str) -> Option<JsonClause> {
    let offset = find_top_level_ci(window, "for json")?;
    Some(read_json_options(&window[offset..]))
}

/// Find the `FOR JSON` token anywhere in a raw expression snippet and read
/// its options. Used for nested payloads, where the snippet is already known
/// to be the subquery's own text.
pub fn scan_raw_for_json(text: &str) -> Option<JsonClause> {
    let offset = find_ci(text, "for json")?;
    Some(read_json_options(&text[offset..]))
}

fn read_json_options(tail: &str) -> JsonClause {
    let tail = &tail[..tail.len().min(OPTION_LOOKAHEAD)];
    JsonClause {
        is_array: !contains_ci(tail, "without_array_wrapper"),
        root: ROOT_OPTION_RE
            .captures(tail)
            .map(|caps| caps[1].to_string()),
    }
}

/// Detect a nested JSON payload in a projected expression: a sub-select with
/// its own `FOR JSON` clause, or a `JSON_QUERY` call. Only the immediate
/// subquery is inspected; deeper scalar subqueries are out of bounds.
fn detect_nested_json(expr: &Expr) -> Option<JsonClause> {
    match expr {
        Expr::Subquery(subquery) => structured_json_clause(subquery)
            .or_else(|| scan_raw_for_json(&subquery.to_string())),
        Expr::Function(function) => {
            let name = function.name.0.last()?.value.to_ascii_lowercase();
            if name != "json_query" {
                return None;
            }
            // JSON_QUERY((SELECT ... FOR JSON ...)) forwards the inner shape;
            // a bare JSON_QUERY(column) extracts a single object
            if let FunctionArguments::List(list) = &function.args {
                for arg in &list.args {
                    let text = arg.to_string();
                    if contains_ci(&text, "for json") {
                        return scan_raw_for_json(&text);
                    }
                }
            }
            Some(JsonClause {
                is_array: false,
                root: None,
            })
        }
        Expr::Cast { expr: inner, .. } | Expr::Nested(inner) => detect_nested_json(inner),
        _ => None,
    }
}
