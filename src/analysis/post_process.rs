//! Post-processing: normalizes aggregate annotations after the AST passes.
//!
//! A single deterministic, idempotent pass. Columns the AST-based aggregate
//! pass could not classify (parser quirks, expressions degraded to
//! `Computed`) are caught here by a textual aggregate-call pattern. Type
//! heuristics themselves live in the resolver chain so that table-bound and
//! cast-bound types always outrank them.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::{ExpressionKind, ProcedureModel};

static AGGREGATE_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(count_big|count|sum|avg|min|max|exists)\s*\(").unwrap()
});

/// Normalize aggregate flags across the whole model.
///
/// Only `Computed` columns are scanned textually: every other kind was fully
/// classified by the AST pass, and re-scanning them would break subquery
/// opacity (a scalar subquery's text contains its inner aggregates).
pub fn apply(model: &mut ProcedureModel) {
    for set in &mut model.result_sets {
        for column in &mut set.columns {
            if !column.is_aggregate && column.expression_kind == ExpressionKind::Computed {
                if let Some(caps) = AGGREGATE_CALL_RE.captures(&column.raw_expression) {
                    column.is_aggregate = true;
                    column.aggregate_function = Some(caps[1].to_ascii_lowercase());
                }
            }
        }
    }
}
