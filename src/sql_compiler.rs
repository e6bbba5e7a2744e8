//! SQL compiler that converts a normalized query to SQL using sea-query.

use crate::ast::{CompOp, Expr as AstExpr, Literal, Query};
use crate::compiler::{flatten, is_exists_sentinel, BoolOp, CompileResult, NativeQuery, Optimization, QueryCompiler};
use crate::error::CompileError;
use sea_query::{
    Asterisk, Condition, Expr, Func, Iden, MysqlQueryBuilder, Order, PostgresQueryBuilder, SelectStatement,
    SimpleExpr, SqliteQueryBuilder, Value,
};
use serde::Deserialize;
use std::fmt::Write as _;

/// Configuration for SQL optimization
#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    /// Minimum number of same-field equalities in an OR chain before it is emitted as IN
    pub max_or_conditions_for_in: usize,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self { max_or_conditions_for_in: 5 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Postgres,
    Mysql,
    #[default]
    Sqlite,
}

/// Table identifier wrapper
#[derive(Debug, Clone)]
pub struct TableName(pub String);

impl Iden for TableName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let _ = write!(s, "{}", self.0);
    }
}

/// Column identifier wrapper
#[derive(Debug, Clone)]
pub struct ColumnName(pub String);

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let _ = write!(s, "{}", self.0);
    }
}

/// SQL Compiler for relational backends
pub struct SqlCompiler {
    config: OptimizationConfig,
    table: String,
    dialect: SqlDialect,
}

impl SqlCompiler {
    pub fn new(table: impl Into<String>, dialect: SqlDialect) -> Self {
        Self {
            config: OptimizationConfig::default(),
            table: table.into(),
            dialect,
        }
    }

    pub fn with_config(mut self, config: OptimizationConfig) -> Self {
        self.config = config;
        self
    }

    fn compile_expr(&self, expr: &AstExpr, optimizations: &mut Vec<Optimization>) -> Result<Condition, CompileError> {
        match expr {
            AstExpr::And(_, _) => {
                let operands = flatten(expr, BoolOp::And);
                self.compile_group(Condition::all(), BoolOp::And, &operands, optimizations)
            }
            AstExpr::Or(_, _) => {
                let operands = flatten(expr, BoolOp::Or);
                if let Some((in_expr, opt)) = self.try_optimize_or_to_in(&operands)? {
                    optimizations.push(opt);
                    return Ok(Condition::all().add(in_expr));
                }
                self.compile_group(Condition::any(), BoolOp::Or, &operands, optimizations)
            }
            AstExpr::Paren(inner) => self.compile_expr(inner, optimizations),
            AstExpr::Comparison { field, op, value } => {
                Ok(Condition::all().add(self.compile_comparison(field.as_str(), *op, value)?))
            }
            AstExpr::Between { field, from, to } => {
                let col = Expr::col(ColumnName(field.0.clone()));
                Ok(Condition::all().add(col.between(literal_to_value(from)?, literal_to_value(to)?)))
            }
        }
    }

    fn compile_group(
        &self,
        mut group: Condition,
        operator: BoolOp,
        operands: &[&AstExpr],
        optimizations: &mut Vec<Optimization>,
    ) -> Result<Condition, CompileError> {
        if operands.len() > 2 {
            optimizations.push(Optimization::Flattened {
                operator,
                operand_count: operands.len(),
            });
        }
        for operand in operands {
            group = group.add(self.compile_expr(operand, optimizations)?);
        }
        Ok(group)
    }

    /// Try to optimize OR conditions to IN clauses
    fn try_optimize_or_to_in(&self, operands: &[&AstExpr]) -> Result<Option<(SimpleExpr, Optimization)>, CompileError> {
        if operands.len() < self.config.max_or_conditions_for_in {
            return Ok(None);
        }

        let mut field_name: Option<&str> = None;
        let mut values = Vec::with_capacity(operands.len());
        for operand in operands {
            match operand {
                AstExpr::Comparison { field, op: CompOp::Eq, value }
                    if !matches!(value, Literal::Column(_) | Literal::List(_)) =>
                {
                    match field_name {
                        Some(name) if name != field.as_str() => return Ok(None),
                        _ => field_name = Some(field.as_str()),
                    }
                    values.push(literal_to_value(value)?);
                }
                // Other condition types break the equality pattern
                _ => return Ok(None),
            }
        }

        let Some(field) = field_name else {
            return Ok(None);
        };
        let optimization = Optimization::OrToIn {
            field: field.to_string(),
            value_count: values.len(),
        };
        Ok(Some((Expr::col(ColumnName(field.to_string())).is_in(values), optimization)))
    }

    /// Compile a comparison operation
    fn compile_comparison(&self, field: &str, op: CompOp, value: &Literal) -> Result<SimpleExpr, CompileError> {
        let col = Expr::col(ColumnName(field.to_string()));

        if is_exists_sentinel(value) {
            return match op {
                CompOp::Eq => Ok(col.is_not_null()),
                CompOp::NotEq => Ok(col.is_null()),
                _ => Err(CompileError::new(format!("'exist' can only be used with = and != (field '{}')", field))),
            };
        }

        let expr = match op {
            CompOp::Eq => col.eq(literal_to_value(value)?),
            CompOp::NotEq => col.ne(literal_to_value(value)?),
            CompOp::Gt => col.gt(literal_to_value(value)?),
            CompOp::Lt => col.lt(literal_to_value(value)?),
            CompOp::Gte => col.gte(literal_to_value(value)?),
            CompOp::Lte => col.lte(literal_to_value(value)?),
            CompOp::In => col.is_in(list_values(value)?),
            CompOp::NotIn => col.is_not_in(list_values(value)?),
            CompOp::Like | CompOp::NotLike => {
                let pattern = match value {
                    Literal::String(s) => s.to_lowercase(),
                    other => return Err(CompileError::new(format!("LIKE pattern must be a string, got {}", other))),
                };
                // Case-insensitive on every dialect
                let lowered = Expr::expr(Func::lower(Expr::col(ColumnName(field.to_string()))));
                if op == CompOp::Like {
                    lowered.like(pattern)
                } else {
                    lowered.not_like(pattern)
                }
            }
        };

        Ok(expr)
    }
}

impl QueryCompiler for SqlCompiler {
    fn name(&self) -> &'static str {
        "sql"
    }

    fn compile(&self, query: &Query) -> Result<CompileResult, CompileError> {
        let mut optimizations = Vec::new();
        let condition = self.compile_expr(&query.predicate, &mut optimizations)?;

        let mut select = SelectStatement::new();
        select
            .column(Asterisk)
            .from(TableName(self.table.clone()))
            .cond_where(condition);
        for order in &query.order_by {
            let direction = if order.descending { Order::Desc } else { Order::Asc };
            select.order_by(ColumnName(order.field.0.clone()), direction);
        }
        select.limit(query.rowcount).offset(query.offset);

        let statement = match self.dialect {
            SqlDialect::Postgres => select.to_string(PostgresQueryBuilder),
            SqlDialect::Mysql => select.to_string(MysqlQueryBuilder),
            SqlDialect::Sqlite => select.to_string(SqliteQueryBuilder),
        };

        Ok(CompileResult {
            native: NativeQuery::Sql { statement },
            optimizations,
        })
    }
}

/// Convert AST Literal to sea-query Value
fn literal_to_value(literal: &Literal) -> Result<Value, CompileError> {
    match literal {
        Literal::String(s) => Ok(Value::String(Some(Box::new(s.clone())))),
        Literal::Integer(n) => Ok(Value::BigInt(Some(*n))),
        Literal::Float(n) => Ok(Value::Double(Some(*n))),
        Literal::Bool(b) => Ok(Value::Bool(Some(*b))),
        Literal::Column(_) => Err(CompileError::new(
            "Column name on the right side of compare operator is not supported",
        )),
        Literal::List(_) => Err(CompileError::new("A value list is only valid with IN and NOT IN")),
    }
}

fn list_values(literal: &Literal) -> Result<Vec<Value>, CompileError> {
    match literal {
        Literal::List(items) => items.iter().map(literal_to_value).collect(),
        other => Ok(vec![literal_to_value(other)?]),
    }
}
