//! The backend compiler contract and helpers shared by all compilers.
//!
//! A compiler turns a normalized [`Query`] into the query object its backend
//! executes. Compilers assume the tree was validated by the normalizer.

use crate::ast::{Expr, Literal, Query, EXISTS_SENTINEL};
use crate::error::CompileError;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fmt;

/// A compiled, backend-native query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NativeQuery {
    Sql { statement: String },
    Document(DocumentQuery),
    /// A single field/value probe for stores without a filter language
    Lookup { field: String, value: String },
}

/// Mongo-style filter document plus paging
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentQuery {
    pub filter: JsonValue,
    pub sort: Vec<SortKey>,
    pub skip: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortKey {
    pub field: String,
    /// 1 ascending, -1 descending
    pub direction: i8,
}

impl fmt::Display for NativeQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeQuery::Sql { statement } => f.write_str(statement),
            NativeQuery::Document(doc) => match serde_json::to_string(doc) {
                Ok(text) => f.write_str(&text),
                Err(_) => Err(fmt::Error),
            },
            NativeQuery::Lookup { field, value } => write!(f, "{}={}", field, value),
        }
    }
}

/// Represents an optimization applied during compilation
#[derive(Debug, Clone, PartialEq)]
pub enum Optimization {
    /// An OR chain of equalities on one field became a single IN
    OrToIn { field: String, value_count: usize },
    /// Nested operands of the same boolean operator were merged
    Flattened { operator: BoolOp, operand_count: usize },
}

/// Result of compilation with optimization information
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub native: NativeQuery,
    pub optimizations: Vec<Optimization>,
}

pub trait QueryCompiler: Send + Sync {
    /// Compiler family name, used in debug output
    fn name(&self) -> &'static str;

    fn compile(&self, query: &Query) -> Result<CompileResult, CompileError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

/// Collects the operands of a chain of `op`, looking through groups, so
/// `(a AND b) AND c` yields `[a, b, c]` in left-to-right order.
pub fn flatten(expr: &Expr, op: BoolOp) -> Vec<&Expr> {
    let mut operands = Vec::new();
    collect_operands(expr, op, &mut operands);
    operands
}

fn collect_operands<'e>(expr: &'e Expr, op: BoolOp, out: &mut Vec<&'e Expr>) {
    match (expr, op) {
        (Expr::And(l, r), BoolOp::And) | (Expr::Or(l, r), BoolOp::Or) => {
            collect_operands(l, op, out);
            collect_operands(r, op, out);
        }
        (Expr::Paren(inner), _) if is_op(inner, op) => collect_operands(inner, op, out),
        _ => out.push(expr),
    }
}

fn is_op(expr: &Expr, op: BoolOp) -> bool {
    match expr {
        Expr::And(_, _) => op == BoolOp::And,
        Expr::Or(_, _) => op == BoolOp::Or,
        Expr::Paren(inner) => is_op(inner, op),
        _ => false,
    }
}

/// Whether the right-hand side is the bare `exist` identifier
pub fn is_exists_sentinel(value: &Literal) -> bool {
    matches!(value, Literal::Column(id) if id.as_str() == EXISTS_SENTINEL)
}

/// Translates a SQL LIKE pattern to a regular expression.
///
/// `%` becomes `.*`, `_` becomes `.`, everything else is matched literally.
/// The result is anchored at each end that does not start or end with `%`.
pub fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    if !pattern.starts_with('%') {
        out.push('^');
    }
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '%' | '_' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if c == '%' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    out.push_str(&regex::escape(&literal));
    if !pattern.ends_with('%') {
        out.push('$');
    }
    out
}
