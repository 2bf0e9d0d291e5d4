//! Procedure model building: the first AST pass.
//!
//! Walks every top-level query specification (the first SELECT per batch;
//! subqueries are analyzed in context by the later passes, never promoted to
//! top level), classifies each projected expression into a column record, and
//! captures `EXEC` calls via a token scan of the raw body.
//!
//! Malformed or unrecognized expressions degrade to
//! `ExpressionKind::Computed` with no further inference — this pass never
//! fails; a column is simply type-less until the heuristics apply.

use sqlparser::ast::{
    Expr, JoinOperator, Query, Select, SelectItem, SetExpr, Statement, TableFactor, Value,
};
use sqlparser::dialect::MsSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::analysis::scalar_types::parse_type_token;
use crate::model::{
    ColumnModel, ExecutedProcedureRef, ExpressionKind, ObjectReference, ProcedureModel,
    ReferenceKind, ResultSetModel, TableSource,
};
use crate::util::unquote_ident;

/// Build the working model from a parsed body
pub fn build(statements: &[Statement], raw_body: &str, default_schema: &str) -> ProcedureModel {
    let mut model = ProcedureModel::default();

    for (index, query) in top_level_queries(statements).into_iter().enumerate() {
        model
            .result_sets
            .push(build_result_set(query, index, default_schema));
    }

    model.executed_procedures = scan_executed_procedures(raw_body);

    // A procedure with no SELECT of its own but one or more EXEC calls
    // forwards the executed procedures' result shapes
    if model.result_sets.is_empty() {
        for (index, exec) in model.executed_procedures.iter().enumerate() {
            model.result_sets.push(ResultSetModel {
                index,
                exec_reference: Some(ObjectReference::new(
                    ReferenceKind::Procedure,
                    exec.schema.clone().unwrap_or_else(|| default_schema.to_string()),
                    exec.name.clone(),
                )),
                ..Default::default()
            });
        }
    }

    model
}

/// Top-level queries in statement order. The later passes iterate this same
/// list, so result-set indexes stay aligned across passes.
pub(crate) fn top_level_queries(statements: &[Statement]) -> Vec<&Query> {
    statements
        .iter()
        .filter_map(|statement| match statement {
            Statement::Query(query) => Some(query.as_ref()),
            _ => None,
        })
        .collect()
}

/// The left-most SELECT of a query body (set operations take their shape
/// from the first branch)
pub(crate) fn leftmost_select(body: &SetExpr) -> Option<&Select> {
    match body {
        SetExpr::Select(select) => Some(select.as_ref()),
        SetExpr::Query(query) => leftmost_select(&query.body),
        SetExpr::SetOperation { left, .. } => leftmost_select(left),
        _ => None,
    }
}

/// Output name of a projection item, shared by every pass so annotations
/// merge on the same keys. `None` for bare wildcards.
pub(crate) fn project_item_name(item: &SelectItem, index: usize) -> Option<String> {
    match item {
        SelectItem::Wildcard(_) => None,
        SelectItem::QualifiedWildcard(qualifier, _) => {
            Some(wildcard_qualifier(&qualifier.to_string()))
        }
        SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.clone()),
        SelectItem::UnnamedExpr(expr) => Some(expression_name(expr, index)),
    }
}

fn expression_name(expr: &Expr, index: usize) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|i| i.value.clone())
            .unwrap_or_else(|| format!("Column{}", index + 1)),
        Expr::Nested(inner) => expression_name(inner, index),
        _ => format!("Column{}", index + 1),
    }
}

fn wildcard_qualifier(text: &str) -> String {
    text.rsplit('.')
        .next()
        .map(unquote_ident)
        .unwrap_or(text)
        .to_string()
}

fn build_result_set(query: &Query, index: usize, default_schema: &str) -> ResultSetModel {
    let mut set = ResultSetModel {
        index,
        ..Default::default()
    };

    let Some(select) = leftmost_select(&query.body) else {
        return set;
    };

    for table_with_joins in &select.from {
        collect_table_sources(&table_with_joins.relation, false, &mut set.tables);
        for join in &table_with_joins.joins {
            let (prior_nullable, joined_nullable) = match &join.join_operator {
                JoinOperator::LeftOuter(_) => (false, true),
                JoinOperator::RightOuter(_) => (true, false),
                JoinOperator::FullOuter(_) => (true, true),
                JoinOperator::OuterApply => (false, true),
                _ => (false, false),
            };
            if prior_nullable {
                for table in set.tables.iter_mut() {
                    table.nullable_side = true;
                }
            }
            collect_table_sources(&join.relation, joined_nullable, &mut set.tables);
        }
    }

    for (item_index, item) in select.projection.iter().enumerate() {
        match item {
            SelectItem::Wildcard(_) => set.has_select_star = true,
            SelectItem::QualifiedWildcard(qualifier, _) => {
                set.has_select_star = true;
                // Synthesize a single placeholder field named for the qualifier
                let mut column = ColumnModel::named(wildcard_qualifier(&qualifier.to_string()));
                column.raw_expression = item.to_string();
                set.columns.push(column);
            }
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                let name = project_item_name(item, item_index)
                    .unwrap_or_else(|| format!("Column{}", item_index + 1));
                let column = build_column(expr, name, &set, default_schema);
                set.columns.push(column);
            }
        }
    }

    set
}

fn collect_table_sources(relation: &TableFactor, nullable_side: bool, out: &mut Vec<TableSource>) {
    match relation {
        TableFactor::Table { name, alias, .. } => {
            let parts: Vec<String> = name.0.iter().map(|i| i.value.clone()).collect();
            let (schema, table) = match parts.as_slice() {
                [table] => (None, table.clone()),
                [schema, table] => (Some(schema.clone()), table.clone()),
                [.., schema, table] => (Some(schema.clone()), table.clone()),
                [] => return,
            };
            out.push(TableSource {
                schema,
                name: table,
                alias: alias.as_ref().map(|a| a.name.value.clone()),
                nullable_side,
            });
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            collect_table_sources(&table_with_joins.relation, nullable_side, out);
            for join in &table_with_joins.joins {
                let joined_nullable = matches!(
                    join.join_operator,
                    JoinOperator::LeftOuter(_) | JoinOperator::FullOuter(_)
                );
                collect_table_sources(&join.relation, nullable_side || joined_nullable, out);
            }
        }
        // Derived tables are not physical sources; their projected columns
        // are resolved by the aggregate pass through its scope map
        _ => {}
    }
}

fn build_column(
    expr: &Expr,
    name: String,
    set: &ResultSetModel,
    default_schema: &str,
) -> ColumnModel {
    let mut column = ColumnModel::named(name);
    column.raw_expression = expr.to_string();
    classify_into(expr, &mut column, set, default_schema);
    column
}

fn classify_into(expr: &Expr, column: &mut ColumnModel, set: &ResultSetModel, default_schema: &str) {
    match expr {
        Expr::Identifier(ident) => {
            column.expression_kind = ExpressionKind::ColumnRef;
            column.source_column = Some(ident.value.clone());
            // An unqualified column of a single-table FROM binds to that table
            if set.tables.len() == 1 {
                let table = &set.tables[0];
                column.source_schema = table
                    .schema
                    .clone()
                    .or_else(|| Some(default_schema.to_string()));
                column.source_table = Some(table.name.clone());
                column.forced_nullable = table.nullable_side;
            }
        }
        Expr::CompoundIdentifier(parts) => {
            column.expression_kind = ExpressionKind::ColumnRef;
            // Identifier parts walked right-to-left: column, table, schema
            let len = parts.len();
            column.source_column = parts.last().map(|i| i.value.clone());
            if len >= 2 {
                let qualifier = &parts[len - 2].value;
                if let Some(source) = set.table_for_qualifier(qualifier) {
                    column.source_schema = source
                        .schema
                        .clone()
                        .or_else(|| Some(default_schema.to_string()));
                    column.source_table = Some(source.name.clone());
                    column.forced_nullable = source.nullable_side;
                } else {
                    column.source_table = Some(qualifier.clone());
                    column.source_schema = if len >= 3 {
                        Some(parts[len - 3].value.clone())
                    } else {
                        None
                    };
                }
            }
        }
        Expr::Function(function) => {
            column.expression_kind = ExpressionKind::FunctionCall;
            let parts: Vec<String> = function.name.0.iter().map(|i| i.value.clone()).collect();
            if parts.len() >= 2 {
                let name = parts[parts.len() - 1].clone();
                let schema = parts[parts.len() - 2].clone();
                column.reference = Some(ObjectReference::new(ReferenceKind::Function, schema, name));
            }
        }
        Expr::Cast {
            expr: inner,
            data_type,
            ..
        } => {
            column.expression_kind = ExpressionKind::Cast;
            column.cast_type = parse_type_token(&data_type.to_string());
            inherit_source_binding(inner, column, set, default_schema);
        }
        Expr::Convert {
            expr: inner,
            data_type,
            ..
        } => match data_type {
            Some(data_type) => {
                column.expression_kind = ExpressionKind::Cast;
                column.cast_type = parse_type_token(&data_type.to_string());
                inherit_source_binding(inner, column, set, default_schema);
            }
            None => column.expression_kind = ExpressionKind::Computed,
        },
        Expr::Value(value) => {
            column.expression_kind = ExpressionKind::Literal;
            record_literal_shape(value, column);
        }
        Expr::Case {
            conditions,
            results,
            else_result,
            ..
        } => {
            column.expression_kind = ExpressionKind::Case;
            for result in results.iter().chain(else_result.as_deref()) {
                collect_literal_hints(result, column);
            }
            for condition in conditions {
                collect_literal_hints(condition, column);
            }
        }
        Expr::Subquery(_) => column.expression_kind = ExpressionKind::Subquery,
        Expr::Nested(inner) => classify_into(inner, column, set, default_schema),
        Expr::UnaryOp { expr: inner, .. } => classify_into(inner, column, set, default_schema),
        _ => column.expression_kind = ExpressionKind::Computed,
    }
}

/// Carry the source binding of a cast's argument so nullability can still
/// come from table metadata; the cast target itself always wins for the type.
fn inherit_source_binding(
    inner: &Expr,
    column: &mut ColumnModel,
    set: &ResultSetModel,
    default_schema: &str,
) {
    let mut probe = ColumnModel::default();
    classify_into(inner, &mut probe, set, default_schema);
    column.source_schema = probe.source_schema;
    column.source_table = probe.source_table;
    column.source_column = probe.source_column;
    column.forced_nullable = probe.forced_nullable;
}

fn record_literal_shape(value: &Value, column: &mut ColumnModel) {
    if let Value::Number(text, _) = value {
        if text.contains('.') || text.contains('e') || text.contains('E') {
            column.has_decimal_literal = true;
        } else {
            column.has_integer_literal = true;
        }
    }
}

fn collect_literal_hints(expr: &Expr, column: &mut ColumnModel) {
    match expr {
        Expr::Value(value) => record_literal_shape(value, column),
        Expr::Nested(inner) | Expr::UnaryOp { expr: inner, .. } => {
            collect_literal_hints(inner, column)
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_literal_hints(left, column);
            collect_literal_hints(right, column);
        }
        _ => {}
    }
}

// ============================================================================
// EXEC call scanning (token-based; procedure bodies routinely defeat the
// structured parser here)
// ============================================================================

/// Scan the raw body for `EXEC`/`EXECUTE` calls and return the referenced
/// procedures, schema-qualified references superseding schema-less ones of
/// the same name (case-insensitive).
pub fn scan_executed_procedures(sql: &str) -> Vec<ExecutedProcedureRef> {
    let dialect = MsSqlDialect {};
    let Ok(tokens) = Tokenizer::new(&dialect, sql).tokenize() else {
        return Vec::new();
    };

    let significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();

    let mut refs: Vec<ExecutedProcedureRef> = Vec::new();
    let mut i = 0;
    while i < significant.len() {
        let Token::Word(word) = significant[i] else {
            i += 1;
            continue;
        };
        if !word.value.eq_ignore_ascii_case("EXEC") && !word.value.eq_ignore_ascii_case("EXECUTE") {
            i += 1;
            continue;
        }
        i += 1;

        // EXEC @ret = schema.proc
        if let Some(Token::Word(w)) = significant.get(i).copied() {
            if w.value.starts_with('@') && matches!(significant.get(i + 1), Some(Token::Eq)) {
                i += 2;
            }
        }

        // Dynamic SQL (EXEC('...')) and procedure-name variables are opaque
        match significant.get(i).copied() {
            Some(Token::LParen)
            | Some(Token::SingleQuotedString(_))
            | Some(Token::NationalStringLiteral(_)) => continue,
            Some(Token::Word(w)) if w.value.starts_with('@') => continue,
            _ => {}
        }

        let mut parts: Vec<String> = Vec::new();
        while let Some(Token::Word(w)) = significant.get(i).copied() {
            if w.value.starts_with('@') {
                break;
            }
            parts.push(w.value.clone());
            if matches!(significant.get(i + 1), Some(Token::Period)) {
                i += 2;
            } else {
                i += 1;
                break;
            }
        }

        let reference = match parts.as_slice() {
            [] => continue,
            [name] => ExecutedProcedureRef {
                schema: None,
                name: name.clone(),
            },
            [.., schema, name] => ExecutedProcedureRef {
                schema: Some(schema.clone()),
                name: name.clone(),
            },
        };
        // System procedures are not project dependencies
        if reference.schema.is_none() && reference.name.to_ascii_lowercase().starts_with("sp_") {
            continue;
        }
        refs.push(reference);
    }

    supersede(refs)
}

fn supersede(refs: Vec<ExecutedProcedureRef>) -> Vec<ExecutedProcedureRef> {
    let qualified: Vec<String> = refs
        .iter()
        .filter(|r| r.schema.is_some())
        .map(|r| r.name.to_ascii_lowercase())
        .collect();

    let mut seen: Vec<(Option<String>, String)> = Vec::new();
    let mut result = Vec::new();
    for reference in refs {
        let name_lower = reference.name.to_ascii_lowercase();
        if reference.schema.is_none() && qualified.contains(&name_lower) {
            continue;
        }
        let key = (
            reference.schema.as_deref().map(str::to_ascii_lowercase),
            name_lower,
        );
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        result.push(reference);
    }
    result
}
