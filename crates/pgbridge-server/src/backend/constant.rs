//! Backend for constant-only SELECTs
//!
//! Answers probes such as `SELECT 1` or `SELECT 'ok' AS status, $1` without
//! any storage behind it. Used as the default metadata backend.

use super::{BackendError, ColumnMetadata, PreparedStatement, ResultSet, SessionHandler, Statement, VecResultSet};
use crate::errors::sqlstate;
use crate::pg_wire::protocol::types::{PgType, Value};
use parking_lot::Mutex;
use sqlparser::ast::{Expr, SelectItem, SetExpr, Statement as SqlStatement, UnaryOperator, Value as SqlValue};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;

/// Column name PostgreSQL gives unaliased expressions
const UNNAMED_COLUMN: &str = "?column?";

#[derive(Debug, Default)]
pub struct ConstantSessionHandler;

#[derive(Debug, Clone, PartialEq)]
enum Projection {
    Literal(Value),
    /// Zero-based parameter index
    Parameter(usize),
}

#[derive(Debug, Clone)]
struct ConstantQuery {
    columns: Vec<(String, Projection)>,
}

impl ConstantQuery {
    fn compile(sql: &str) -> anyhow::Result<Self> {
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| {
            BackendError::new(e.to_string())
                .with_sqlstate(sqlstate::SYNTAX_ERROR)
                .with_routine("prepare")
        })?;
        let select = match statements.as_slice() {
            [SqlStatement::Query(query)] => match query.body.as_ref() {
                SetExpr::Select(select) if select.from.is_empty() => select.clone(),
                _ => return Err(unsupported(sql)),
            },
            _ => return Err(unsupported(sql)),
        };

        let mut columns = Vec::with_capacity(select.projection.len());
        for item in &select.projection {
            let (name, expr) = match item {
                SelectItem::UnnamedExpr(expr) => (UNNAMED_COLUMN.to_string(), expr),
                SelectItem::ExprWithAlias { expr, alias } => (alias.value.clone(), expr),
                _ => return Err(unsupported(sql)),
            };
            let projection = projection(expr).ok_or_else(|| unsupported(sql))?;
            columns.push((name, projection));
        }
        Ok(Self { columns })
    }

    fn parameter_count(&self) -> usize {
        self.columns
            .iter()
            .filter_map(|(_, p)| match p {
                Projection::Parameter(idx) => Some(idx + 1),
                Projection::Literal(_) => None,
            })
            .max()
            .unwrap_or(0)
    }

    fn metadata(&self) -> Vec<ColumnMetadata> {
        self.columns
            .iter()
            .map(|(name, projection)| {
                let pg_type = match projection {
                    Projection::Literal(Value::Null) | Projection::Parameter(_) => PgType::Text,
                    Projection::Literal(value) => value.natural_type(),
                };
                ColumnMetadata::new(name.clone(), pg_type)
            })
            .collect()
    }

    fn evaluate(&self, params: &[Value]) -> anyhow::Result<Box<dyn ResultSet>> {
        let mut row = Vec::with_capacity(self.columns.len());
        for (_, projection) in &self.columns {
            let value = match projection {
                Projection::Literal(value) => value.clone(),
                Projection::Parameter(idx) => params.get(*idx).cloned().ok_or_else(|| {
                    BackendError::new(format!("there is no parameter ${}", idx + 1))
                        .with_sqlstate(sqlstate::UNDEFINED_PARAMETER)
                        .with_routine("execute")
                })?,
            };
            row.push(value);
        }
        Ok(Box::new(VecResultSet::new(self.metadata(), vec![row])))
    }
}

#[track_caller]
fn unsupported(sql: &str) -> anyhow::Error {
    BackendError::new(format!("only constant SELECT statements are supported: {}", sql.trim()))
        .with_sqlstate(sqlstate::FEATURE_NOT_SUPPORTED)
        .with_routine("prepare")
        .into()
}

fn projection(expr: &Expr) -> Option<Projection> {
    match expr {
        Expr::Value(value) => match &value.value {
            SqlValue::Number(n, _) => Some(Projection::Literal(number(n))),
            SqlValue::SingleQuotedString(s) => Some(Projection::Literal(Value::Text(s.clone()))),
            SqlValue::Boolean(b) => Some(Projection::Literal(Value::Bool(*b))),
            SqlValue::Null => Some(Projection::Literal(Value::Null)),
            SqlValue::Placeholder(p) => p
                .strip_prefix('$')
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n >= 1)
                .map(|n| Projection::Parameter(n - 1)),
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(value) => match &value.value {
                SqlValue::Number(n, _) => Some(Projection::Literal(number(&format!("-{}", n)))),
                _ => None,
            },
            _ => None,
        },
        Expr::Nested(inner) => projection(inner),
        _ => None,
    }
}

fn number(text: &str) -> Value {
    if let Ok(v) = text.parse::<i32>() {
        Value::Int4(v)
    } else if let Ok(v) = text.parse::<i64>() {
        Value::Int8(v)
    } else {
        Value::Numeric(text.to_string())
    }
}

struct ConstantStatement {
    query: ConstantQuery,
    params: Mutex<Vec<Value>>,
}

impl PreparedStatement for ConstantStatement {
    fn parameter_types(&self) -> anyhow::Result<Vec<PgType>> {
        Ok(vec![PgType::Text; self.query.parameter_count()])
    }

    fn result_columns(&self) -> anyhow::Result<Option<Vec<ColumnMetadata>>> {
        Ok(Some(self.query.metadata()))
    }

    fn set_parameter(&self, index: usize, value: Value) -> anyhow::Result<()> {
        let mut params = self.params.lock();
        if params.len() <= index {
            params.resize(index + 1, Value::Null);
        }
        params[index] = value;
        Ok(())
    }

    fn execute(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn result_set(&self) -> anyhow::Result<Box<dyn ResultSet>> {
        let params = self.params.lock().clone();
        self.query.evaluate(&params)
    }
}

#[derive(Default)]
struct ConstantOneShot {
    query: Option<ConstantQuery>,
}

impl Statement for ConstantOneShot {
    fn execute(&mut self, sql: &str) -> anyhow::Result<bool> {
        self.query = Some(ConstantQuery::compile(sql)?);
        Ok(true)
    }

    fn result_set(&mut self) -> anyhow::Result<Box<dyn ResultSet>> {
        match &self.query {
            Some(query) => query.evaluate(&[]),
            None => anyhow::bail!("statement has not been executed"),
        }
    }
}

impl SessionHandler for ConstantSessionHandler {
    fn name(&self) -> &str {
        "constant"
    }

    fn prepare_statement(&self, sql: &str) -> anyhow::Result<Arc<dyn PreparedStatement>> {
        Ok(Arc::new(ConstantStatement {
            query: ConstantQuery::compile(sql)?,
            params: Mutex::new(Vec::new()),
        }))
    }

    fn create_statement(&self) -> anyhow::Result<Box<dyn Statement>> {
        Ok(Box::new(ConstantOneShot::default()))
    }
}
