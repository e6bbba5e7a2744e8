//! Compiler for document stores speaking a Mongo-style filter language.

use crate::ast::{CompOp, Expr, Literal, Query};
use crate::compiler::{
    flatten, is_exists_sentinel, like_to_regex, BoolOp, CompileResult, DocumentQuery, NativeQuery, Optimization,
    QueryCompiler, SortKey,
};
use crate::error::CompileError;
use serde_json::{json, Value};

#[derive(Debug, Default, Clone)]
pub struct DocumentCompiler;

impl DocumentCompiler {
    pub fn new() -> Self {
        Self
    }

    fn compile_expr(&self, expr: &Expr, optimizations: &mut Vec<Optimization>) -> Result<Value, CompileError> {
        match expr {
            Expr::And(_, _) => self.compile_group("$and", BoolOp::And, expr, optimizations),
            Expr::Or(_, _) => self.compile_group("$or", BoolOp::Or, expr, optimizations),
            Expr::Paren(inner) => self.compile_expr(inner, optimizations),
            Expr::Between { field, from, to } => Ok(json!({
                field.as_str(): { "$gte": scalar(from)?, "$lte": scalar(to)? }
            })),
            Expr::Comparison { field, op, value } => compile_comparison(field.as_str(), *op, value),
        }
    }

    fn compile_group(
        &self,
        key: &str,
        operator: BoolOp,
        expr: &Expr,
        optimizations: &mut Vec<Optimization>,
    ) -> Result<Value, CompileError> {
        let operands = flatten(expr, operator);
        if operands.len() > 2 {
            optimizations.push(Optimization::Flattened {
                operator,
                operand_count: operands.len(),
            });
        }
        let clauses = operands
            .into_iter()
            .map(|operand| self.compile_expr(operand, optimizations))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(json!({ key: clauses }))
    }
}

fn compile_comparison(field: &str, op: CompOp, value: &Literal) -> Result<Value, CompileError> {
    if is_exists_sentinel(value) {
        return match op {
            CompOp::Eq => Ok(json!({ field: { "$exists": true } })),
            CompOp::NotEq => Ok(json!({ field: { "$exists": false } })),
            _ => Err(CompileError::new(format!("'exist' can only be used with = and != (field '{}')", field))),
        };
    }

    let condition = match op {
        CompOp::Eq => scalar(value)?,
        CompOp::NotEq => json!({ "$ne": scalar(value)? }),
        CompOp::Lt => json!({ "$lt": scalar(value)? }),
        CompOp::Gt => json!({ "$gt": scalar(value)? }),
        CompOp::Lte => json!({ "$lte": scalar(value)? }),
        CompOp::Gte => json!({ "$gte": scalar(value)? }),
        CompOp::In => json!({ "$in": list(value)? }),
        CompOp::NotIn => json!({ "$nin": list(value)? }),
        CompOp::Like => regex_condition(value)?,
        CompOp::NotLike => json!({ "$not": regex_condition(value)? }),
    };
    Ok(json!({ field: condition }))
}

fn regex_condition(value: &Literal) -> Result<Value, CompileError> {
    match value {
        Literal::String(pattern) => Ok(json!({ "$regex": like_to_regex(pattern), "$options": "i" })),
        other => Err(CompileError::new(format!("LIKE pattern must be a string, got {}", other))),
    }
}

fn scalar(value: &Literal) -> Result<Value, CompileError> {
    match value {
        Literal::Column(_) => Err(CompileError::new(
            "Column name on the right side of compare operator is not supported",
        )),
        Literal::List(_) => Err(CompileError::new("A value list is only valid with IN and NOT IN")),
        other => Ok(other.to_json()),
    }
}

fn list(value: &Literal) -> Result<Vec<Value>, CompileError> {
    match value {
        Literal::List(items) => items.iter().map(scalar).collect(),
        other => Ok(vec![scalar(other)?]),
    }
}

impl QueryCompiler for DocumentCompiler {
    fn name(&self) -> &'static str {
        "document"
    }

    fn compile(&self, query: &Query) -> Result<CompileResult, CompileError> {
        let mut optimizations = Vec::new();
        let filter = self.compile_expr(&query.predicate, &mut optimizations)?;
        let sort = query
            .order_by
            .iter()
            .map(|o| SortKey {
                field: o.field.0.clone(),
                direction: if o.descending { -1 } else { 1 },
            })
            .collect();

        Ok(CompileResult {
            native: NativeQuery::Document(DocumentQuery {
                filter,
                sort,
                skip: query.offset,
                limit: query.rowcount,
            }),
            optimizations,
        })
    }
}
