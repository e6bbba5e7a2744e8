//! Query normalization.
//!
//! Normalization runs in two phases:
//!
//! * [`prepare`] parses and validates the raw text once per search. Every
//!   failure here is query-scoped and aborts the search before any backend
//!   is contacted.
//! * [`specialize`] adapts the prepared query to one backend: it strips the
//!   datetime range, decomposes disjunctions for backends without boolean
//!   support and renames fields.

use crate::ast::{CompOp, Expr, Literal, Query};
use crate::error::QueryError;
use crate::parser::parse_statement;
use crate::rewriter::rewrite_query;
use std::collections::HashMap;

/// Backend capabilities that shape a specialized query
#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions<'a> {
    /// The backend has a `datetime` field
    pub include_datetime: bool,
    /// User field name → backend field name
    pub rename: &'a HashMap<String, String>,
    /// The backend evaluates AND/OR/IN itself
    pub supports_native_booleans: bool,
}

/// Parses and validates a raw query, filling in LIMIT defaults.
pub fn prepare(raw: &str, max_rowcount: u64) -> Result<Query, QueryError> {
    let statement = parse_statement(raw)?;

    if statement.distinct {
        return Err(QueryError::validation(
            "DISTINCT shouldn't be used, API service already returns unique nodes pairs only",
        ));
    }
    if statement.sources.len() > 1 {
        return Err(QueryError::validation("Multiple FROM currently not supported"));
    }
    if !statement.group_by.is_empty() {
        return Err(QueryError::validation("'GROUP BY' & aggregation are not supported"));
    }

    let predicate = statement
        .selection
        .ok_or_else(|| QueryError::validation("WHERE filters are missing"))?;

    match predicate {
        Expr::Paren(_) | Expr::And(_, _) | Expr::Or(_, _) | Expr::Comparison { .. } => {}
        Expr::Between { .. } => {
            return Err(QueryError::validation("WHERE statement is not a list of filters"));
        }
    }
    if predicate.datetime_range_count() > 1 {
        return Err(QueryError::validation("Only one datetime range is allowed"));
    }

    let (offset, rowcount) = match statement.limit {
        None => (0, max_rowcount),
        Some(limit) => {
            let offset = limit.offset.unwrap_or(0);
            if offset < 0 {
                return Err(QueryError::validation("LIMIT offset can't be less than 0"));
            }
            if limit.rowcount < 0 {
                return Err(QueryError::validation("LIMIT rowcount can't be less than 0"));
            }
            (offset as u64, (limit.rowcount as u64).min(max_rowcount))
        }
    };

    // `parse` guarantees at least one source
    let source = statement
        .sources
        .into_iter()
        .next()
        .ok_or_else(|| QueryError::validation("FROM is missing"))?;

    Ok(Query {
        source,
        predicate,
        order_by: statement.order_by,
        offset,
        rowcount,
    })
}

/// Produces the ordered list of queries one backend has to run.
///
/// The list holds a single query when the backend supports native booleans.
pub fn specialize(query: &Query, options: &NormalizeOptions<'_>) -> Result<Vec<Query>, QueryError> {
    let predicate = if options.include_datetime {
        query.predicate.clone()
    } else {
        strip_datetime(&query.predicate).ok_or_else(|| QueryError::validation("WHERE filters are missing"))?
    };

    let predicates = if options.supports_native_booleans {
        vec![predicate]
    } else {
        split(&predicate).map_err(QueryError::Split)?
    };

    Ok(predicates
        .into_iter()
        .map(|predicate| {
            let query = Query {
                source: query.source.clone(),
                predicate,
                order_by: query.order_by.clone(),
                offset: query.offset,
                rowcount: query.rowcount,
            };
            rewrite_query(&query, options.rename)
        })
        .collect())
}

/// [`prepare`] followed by [`specialize`]
pub fn normalize(raw: &str, max_rowcount: u64, options: &NormalizeOptions<'_>) -> Result<Vec<Query>, QueryError> {
    let query = prepare(raw, max_rowcount)?;
    specialize(&query, options)
}

/// The `FROM` target of a raw query, used to route it.
pub fn target_source(raw: &str) -> Result<String, QueryError> {
    let statement = parse_statement(raw)?;
    match statement.sources.as_slice() {
        [source] => Ok(source.0.clone()),
        [] => Err(QueryError::validation("FROM is missing")),
        _ => Err(QueryError::validation("Multiple FROM currently not supported")),
    }
}

/// Removes the datetime range where it is an AND operand. `None` means
/// nothing is left.
fn strip_datetime(expr: &Expr) -> Option<Expr> {
    match expr {
        Expr::Between { .. } if expr.is_datetime_range() => None,
        Expr::And(left, right) => match (strip_datetime(left), strip_datetime(right)) {
            (Some(l), Some(r)) => Some(Expr::and(l, r)),
            (Some(only), None) | (None, Some(only)) => Some(only),
            (None, None) => None,
        },
        Expr::Paren(inner) => strip_datetime(inner).map(|e| Expr::Paren(Box::new(e))),
        other => Some(other.clone()),
    }
}

/// Decomposes a clean disjunction into single comparisons.
///
/// Accepted shapes: an OR chain (or IN list) of `field = value` terms,
/// optionally AND-joined with one datetime range that is re-attached to
/// every resulting predicate.
fn split(expr: &Expr) -> Result<Vec<Expr>, String> {
    let (core, range) = match expr {
        Expr::Paren(inner) => return split(inner),
        Expr::And(left, right) if right.is_datetime_range() => (left.as_ref(), Some(right.as_ref())),
        Expr::And(left, right) if left.is_datetime_range() => (right.as_ref(), Some(left.as_ref())),
        Expr::And(_, _) => {
            return Err("only a single datetime range can be combined with AND".to_string());
        }
        other => (other, None),
    };

    let mut items = Vec::new();
    collect_disjuncts(core, &mut items)?;

    Ok(items
        .into_iter()
        .map(|item| match range {
            Some(range) => Expr::and(item, range.clone()),
            None => item,
        })
        .collect())
}

fn collect_disjuncts(expr: &Expr, out: &mut Vec<Expr>) -> Result<(), String> {
    match expr {
        Expr::Or(left, right) => {
            collect_disjuncts(left, out)?;
            collect_disjuncts(right, out)
        }
        Expr::Paren(inner) => collect_disjuncts(inner, out),
        Expr::Comparison { op: CompOp::Eq, .. } => {
            out.push(expr.clone());
            Ok(())
        }
        Expr::Comparison {
            field,
            op: CompOp::In,
            value: Literal::List(values),
        } => {
            out.extend(values.iter().map(|value| Expr::Comparison {
                field: field.clone(),
                op: CompOp::Eq,
                value: value.clone(),
            }));
            Ok(())
        }
        Expr::Comparison { op, .. } => Err(format!(
            "operator '{}' is not supported, only '=' can be split",
            op
        )),
        Expr::Between { field, .. } => Err(format!("BETWEEN on '{}' can't be split", field)),
        Expr::And(_, _) => Err("AND inside a disjunction can't be split".to_string()),
    }
}
