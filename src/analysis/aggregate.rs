//! Aggregate analysis: the second AST pass.
//!
//! Recognizes `COUNT`, `COUNT_BIG`, `SUM`, `AVG`, `MIN`, `MAX` and `EXISTS`
//! anywhere in a scalar expression tree. Aggregate-ness propagates through
//! operators, `CASE`, `COALESCE`/`NULLIF`, parenthesization and
//! (`TRY_`)`CAST`/`CONVERT`; columns re-projected from derived tables or
//! CTEs inherit the derived column's aggregate flag. A scalar subquery is an
//! opaque boundary: nothing propagates out of it.
//!
//! The pass computes its findings per query, then merges them into the model
//! through a reducer keyed by `(result set index, column name)`.

use std::collections::HashMap;

use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, Query, SelectItem, Statement,
    TableFactor, Value,
};

use crate::analysis::model_builder::{leftmost_select, project_item_name, top_level_queries};
use crate::model::ProcedureModel;

const AGGREGATE_FUNCTIONS: &[&str] = &["count", "count_big", "sum", "avg", "min", "max"];

/// Aggregate-ness and literal-shape evidence for one expression
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateFinding {
    /// Lower-cased aggregate function name, when the expression aggregates
    pub function: Option<String>,
    pub has_integer_literal: bool,
    pub has_decimal_literal: bool,
}

impl AggregateFinding {
    fn merge(mut self, other: AggregateFinding) -> AggregateFinding {
        if self.function.is_none() {
            self.function = other.function;
        }
        self.has_integer_literal |= other.has_integer_literal;
        self.has_decimal_literal |= other.has_decimal_literal;
        self
    }

    fn is_aggregate(&self) -> bool {
        self.function.is_some()
    }
}

/// Projected-column findings of one derived-table or CTE scope, keyed by
/// lower-cased column name
type ScopeMap = HashMap<String, AggregateFinding>;

/// A column that referenced a derived-table alias before that scope had been
/// visited; resolved once all scopes are known.
struct PendingReference {
    column_name: String,
    alias: String,
    source_column: String,
}

/// Annotate the model's columns with aggregate findings
pub fn apply(statements: &[Statement], model: &mut ProcedureModel) {
    for (set_index, query) in top_level_queries(statements).into_iter().enumerate() {
        let mut scopes: HashMap<String, ScopeMap> = HashMap::new();
        collect_scopes(query, &mut scopes);

        let Some(select) = leftmost_select(&query.body) else {
            continue;
        };

        let mut pending: Vec<PendingReference> = Vec::new();
        let mut findings: Vec<(String, AggregateFinding)> = Vec::new();

        for (index, item) in select.projection.iter().enumerate() {
            let Some(name) = project_item_name(item, index) else {
                continue;
            };
            let expr = match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
                _ => continue,
            };
            let finding = scan_expr(expr, &scopes, &name, &mut pending);
            findings.push((name, finding));
        }

        // Forward references: scopes visited after the referencing column
        for p in pending {
            if let Some(finding) = scopes
                .get(&p.alias)
                .and_then(|scope| scope.get(&p.source_column))
            {
                if let Some(entry) = findings.iter_mut().find(|(n, _)| *n == p.column_name) {
                    entry.1 = std::mem::take(&mut entry.1).merge(finding.clone());
                }
            }
        }

        for (name, finding) in findings {
            if finding.is_aggregate()
                || finding.has_integer_literal
                || finding.has_decimal_literal
            {
                model.update_column(set_index, &name, |column| {
                    if let Some(function) = finding.function {
                        column.is_aggregate = true;
                        column.aggregate_function = Some(function);
                    }
                    column.has_integer_literal |= finding.has_integer_literal;
                    column.has_decimal_literal |= finding.has_decimal_literal;
                });
            }
        }
    }
}

/// Collect derived-table and CTE scopes of a query, recursively, keyed by
/// alias (lower-cased)
fn collect_scopes(query: &Query, scopes: &mut HashMap<String, ScopeMap>) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            let scope = analyze_scope(&cte.query, scopes);
            scopes.insert(cte.alias.name.value.to_ascii_lowercase(), scope);
        }
    }

    let Some(select) = leftmost_select(&query.body) else {
        return;
    };
    for table_with_joins in &select.from {
        collect_factor_scopes(&table_with_joins.relation, scopes);
        for join in &table_with_joins.joins {
            collect_factor_scopes(&join.relation, scopes);
        }
    }
}

fn collect_factor_scopes(relation: &TableFactor, scopes: &mut HashMap<String, ScopeMap>) {
    match relation {
        TableFactor::Derived {
            subquery, alias, ..
        } => {
            let scope = analyze_scope(subquery, scopes);
            if let Some(alias) = alias {
                scopes.insert(alias.name.value.to_ascii_lowercase(), scope);
            }
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            collect_factor_scopes(&table_with_joins.relation, scopes);
            for join in &table_with_joins.joins {
                collect_factor_scopes(&join.relation, scopes);
            }
        }
        _ => {}
    }
}

/// Compute the per-column findings of a derived table's own projection.
/// Inner scopes (derived tables nested inside this one) are collected first
/// so the inner projection can inherit through them.
fn analyze_scope(query: &Query, outer: &HashMap<String, ScopeMap>) -> ScopeMap {
    let mut scopes = outer.clone();
    collect_scopes(query, &mut scopes);

    let mut map = ScopeMap::new();
    let Some(select) = leftmost_select(&query.body) else {
        return map;
    };
    let mut pending = Vec::new();
    for (index, item) in select.projection.iter().enumerate() {
        let Some(name) = project_item_name(item, index) else {
            continue;
        };
        let expr = match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
            _ => continue,
        };
        let finding = scan_expr(expr, &scopes, &name, &mut pending);
        map.insert(name.to_ascii_lowercase(), finding);
    }
    map
}

fn scan_expr(
    expr: &Expr,
    scopes: &HashMap<String, ScopeMap>,
    column_name: &str,
    pending: &mut Vec<PendingReference>,
) -> AggregateFinding {
    match expr {
        Expr::Function(function) => {
            // Only bare names are built-in aggregates; `dbo.Count(...)` is a
            // user function
            let name = match function.name.0.as_slice() {
                [ident] => ident.value.to_ascii_lowercase(),
                _ => String::new(),
            };

            let mut finding = AggregateFinding::default();
            if let FunctionArguments::List(list) = &function.args {
                for arg in &list.args {
                    let arg_expr = match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => e,
                        FunctionArg::Named {
                            arg: FunctionArgExpr::Expr(e),
                            ..
                        } => e,
                        _ => continue,
                    };
                    finding = finding.merge(scan_expr(arg_expr, scopes, column_name, pending));
                }
            }

            if AGGREGATE_FUNCTIONS.contains(&name.as_str()) {
                // The aggregate itself wins over anything found in arguments
                finding.function = Some(name);
            }
            finding
        }
        Expr::Exists { .. } => AggregateFinding {
            function: Some("exists".to_string()),
            ..Default::default()
        },
        // A scalar subquery is an opaque boundary for this pass
        Expr::Subquery(_) => AggregateFinding::default(),
        Expr::BinaryOp { left, right, .. } => scan_expr(left, scopes, column_name, pending)
            .merge(scan_expr(right, scopes, column_name, pending)),
        Expr::UnaryOp { expr: inner, .. } | Expr::Nested(inner) => {
            scan_expr(inner, scopes, column_name, pending)
        }
        Expr::Cast { expr: inner, .. } => scan_expr(inner, scopes, column_name, pending),
        Expr::Convert { expr: inner, .. } => scan_expr(inner, scopes, column_name, pending),
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            let mut finding = AggregateFinding::default();
            if let Some(operand) = operand {
                finding = finding.merge(scan_expr(operand, scopes, column_name, pending));
            }
            for expr in conditions.iter().chain(results.iter()) {
                finding = finding.merge(scan_expr(expr, scopes, column_name, pending));
            }
            if let Some(else_result) = else_result {
                finding = finding.merge(scan_expr(else_result, scopes, column_name, pending));
            }
            finding
        }
        Expr::Value(Value::Number(text, _)) => AggregateFinding {
            has_integer_literal: !text.contains(['.', 'e', 'E']),
            has_decimal_literal: text.contains(['.', 'e', 'E']),
            ..Default::default()
        },
        Expr::CompoundIdentifier(parts) if parts.len() == 2 => {
            let alias = parts[0].value.to_ascii_lowercase();
            let source_column = parts[1].value.to_ascii_lowercase();
            match scopes.get(&alias) {
                Some(scope) => scope.get(&source_column).cloned().unwrap_or_default(),
                None => {
                    pending.push(PendingReference {
                        column_name: column_name.to_string(),
                        alias,
                        source_column,
                    });
                    AggregateFinding::default()
                }
            }
        }
        _ => AggregateFinding::default(),
    }
}
