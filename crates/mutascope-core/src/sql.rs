use sqlparser::ast::{
    BinaryOperator, Expr, Ident, SelectItem, SetExpr, Statement, TableFactor, UnaryOperator,
    Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use crate::error::EngineError;
use crate::pushdown::{CompareOp, Predicate};

/// A `SELECT` against `system.mutations`.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemQuery {
    pub database: Option<String>,
    pub table: String,
    /// `None` for `SELECT *`.
    pub columns: Option<Vec<String>>,
    pub predicate: Predicate,
}

/// Parse a bare `WHERE` clause body, e.g. `database = 'db1' AND table LIKE 't%'`.
pub fn parse_predicate(sql: &str) -> Result<Predicate, EngineError> {
    if sql.trim().is_empty() {
        return Ok(Predicate::True);
    }
    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(sql)
        .map_err(|e| EngineError::InvalidPredicate(format!("SQL parse error: {e}")))?;
    let expr = parser
        .parse_expr()
        .map_err(|e| EngineError::InvalidPredicate(format!("SQL parse error: {e}")))?;
    let next = parser.peek_token();
    if next.token != Token::EOF {
        return Err(EngineError::InvalidPredicate(format!(
            "unexpected trailing input: {}",
            next.token
        )));
    }
    predicate_from_expr(&expr)
}

/// Parse `SELECT <columns|*> FROM [db.]table [WHERE ...]`.
pub fn parse_system_query(sql: &str) -> Result<SystemQuery, EngineError> {
    let dialect = GenericDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql)
        .map_err(|e| EngineError::InvalidArgument(format!("SQL parse error: {e}")))?;
    if statements.len() != 1 {
        return Err(EngineError::InvalidArgument(
            "expected exactly one SQL statement".into(),
        ));
    }
    let Statement::Query(query) = statements.remove(0) else {
        return Err(EngineError::InvalidArgument("expected a SELECT query".into()));
    };
    let SetExpr::Select(select) = *query.body else {
        return Err(EngineError::InvalidArgument("expected a plain SELECT".into()));
    };
    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return Err(EngineError::InvalidArgument(
            "expected a single table in FROM".into(),
        ));
    }
    let (database, table) = match &select.from[0].relation {
        TableFactor::Table { name, .. } => match name.0.as_slice() {
            [table] => (None, table.value.clone()),
            [database, table] => (Some(database.value.clone()), table.value.clone()),
            _ => {
                return Err(EngineError::InvalidArgument(format!(
                    "unsupported table name: {name}"
                )))
            }
        },
        other => {
            return Err(EngineError::InvalidArgument(format!(
                "unsupported FROM clause: {other}"
            )))
        }
    };

    let mut columns = Vec::new();
    let mut wildcard = false;
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) => wildcard = true,
            SelectItem::UnnamedExpr(expr) => columns.push(column_name(expr).ok_or_else(|| {
                EngineError::InvalidArgument(format!("unsupported select item: {expr}"))
            })?),
            other => {
                return Err(EngineError::InvalidArgument(format!(
                    "unsupported select item: {other}"
                )))
            }
        }
    }
    if wildcard && !columns.is_empty() {
        return Err(EngineError::InvalidArgument(
            "cannot mix * with named columns".into(),
        ));
    }

    let predicate = match &select.selection {
        Some(expr) => predicate_from_expr(expr)?,
        None => Predicate::True,
    };

    Ok(SystemQuery {
        database,
        table,
        columns: if wildcard { None } else { Some(columns) },
        predicate,
    })
}

/// Column name of an identifier. Qualifiers such as `system.mutations.`
/// are dropped, except for the nested `block_numbers.*` columns.
fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => compound_column_name(parts),
        _ => None,
    }
}

fn compound_column_name(parts: &[Ident]) -> Option<String> {
    let last = parts.last()?;
    if parts.len() >= 2 && parts[parts.len() - 2].value == "block_numbers" {
        return Some(format!("block_numbers.{}", last.value));
    }
    Some(last.value.clone())
}

fn literal(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Value(Value::SingleQuotedString(s)) => Some(s.clone()),
        Expr::Value(Value::Number(n, _)) => Some(n.clone()),
        Expr::Value(Value::Boolean(b)) => Some(if *b { "1" } else { "0" }.to_string()),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(Value::Number(n, _)) => Some(format!("-{n}")),
            _ => None,
        },
        Expr::Nested(inner) => literal(inner),
        _ => None,
    }
}

fn compare_op(op: &BinaryOperator) -> Option<CompareOp> {
    match op {
        BinaryOperator::Eq => Some(CompareOp::Eq),
        BinaryOperator::NotEq => Some(CompareOp::NotEq),
        BinaryOperator::Lt => Some(CompareOp::Lt),
        BinaryOperator::LtEq => Some(CompareOp::LtEq),
        BinaryOperator::Gt => Some(CompareOp::Gt),
        BinaryOperator::GtEq => Some(CompareOp::GtEq),
        _ => None,
    }
}

fn predicate_from_expr(expr: &Expr) -> Result<Predicate, EngineError> {
    match expr {
        Expr::Nested(inner) => predicate_from_expr(inner),
        Expr::Value(Value::Boolean(true)) => Ok(Predicate::True),
        Expr::Value(Value::Boolean(false)) => Ok(Predicate::True.negate()),
        Expr::Value(Value::Number(n, _)) => {
            let value: f64 = n.parse().map_err(|_| {
                EngineError::InvalidPredicate(format!("invalid numeric constant: {n}"))
            })?;
            Ok(if value == 0.0 {
                Predicate::True.negate()
            } else {
                Predicate::True
            })
        }
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => Ok(predicate_from_expr(expr)?.negate()),
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => Ok(predicate_from_expr(left)?.and(predicate_from_expr(right)?)),
            BinaryOperator::Or => Ok(predicate_from_expr(left)?.or(predicate_from_expr(right)?)),
            _ => {
                let op = compare_op(op).ok_or_else(|| {
                    EngineError::InvalidPredicate(format!("unsupported operator: {op}"))
                })?;
                if let (Some(column), Some(value)) = (column_name(left), literal(right)) {
                    Ok(Predicate::Compare { column, op, value })
                } else if let (Some(value), Some(column)) = (literal(left), column_name(right)) {
                    Ok(Predicate::Compare {
                        column,
                        op: op.flip(),
                        value,
                    })
                } else {
                    Err(EngineError::InvalidPredicate(format!(
                        "comparison must be between a column and a literal: {expr}"
                    )))
                }
            }
        },
        Expr::InList {
            expr: target,
            list,
            negated,
        } => {
            let column = column_name(target).ok_or_else(|| {
                EngineError::InvalidPredicate(format!("IN target must be a column: {target}"))
            })?;
            let values = list
                .iter()
                .map(|item| {
                    literal(item).ok_or_else(|| {
                        EngineError::InvalidPredicate(format!(
                            "IN list items must be literals: {item}"
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Predicate::In {
                column,
                values,
                negated: *negated,
            })
        }
        Expr::Like {
            negated,
            expr: target,
            pattern,
            ..
        } => {
            let column = column_name(target).ok_or_else(|| {
                EngineError::InvalidPredicate(format!("LIKE target must be a column: {target}"))
            })?;
            let pattern = literal(pattern).ok_or_else(|| {
                EngineError::InvalidPredicate(format!("LIKE pattern must be a literal: {pattern}"))
            })?;
            Ok(Predicate::Like {
                column,
                pattern,
                negated: *negated,
            })
        }
        other => Err(EngineError::InvalidPredicate(format!(
            "unsupported expression: {other}"
        ))),
    }
}
