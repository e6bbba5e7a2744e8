//! Identifier rewriting over the predicate tree.
//!
//! Rewrites never touch their input: every pass builds a fresh tree, so one
//! parsed query can be specialized for many backends at once.

use crate::ast::{Expr, Identifier, Literal, OrderBy, Query};
use std::collections::HashMap;

/// A post-order fold over [`Expr`]. Children are folded before their parent
/// is rebuilt; implementors override only the hooks they care about.
pub trait ExprFold {
    fn fold_field(&mut self, field: &Identifier) -> Identifier {
        field.clone()
    }

    fn fold_literal(&mut self, literal: &Literal) -> Literal {
        literal.clone()
    }

    fn fold_expr(&mut self, expr: &Expr) -> Expr {
        walk_expr(self, expr)
    }
}

/// Default traversal used by [`ExprFold::fold_expr`].
pub fn walk_expr<F: ExprFold + ?Sized>(folder: &mut F, expr: &Expr) -> Expr {
    match expr {
        Expr::Comparison { field, op, value } => {
            let value = folder.fold_literal(value);
            Expr::Comparison {
                field: folder.fold_field(field),
                op: *op,
                value,
            }
        }
        Expr::Between { field, from, to } => {
            let from = folder.fold_literal(from);
            let to = folder.fold_literal(to);
            Expr::Between {
                field: folder.fold_field(field),
                from,
                to,
            }
        }
        Expr::And(left, right) => {
            let left = folder.fold_expr(left);
            let right = folder.fold_expr(right);
            Expr::And(Box::new(left), Box::new(right))
        }
        Expr::Or(left, right) => {
            let left = folder.fold_expr(left);
            let right = folder.fold_expr(right);
            Expr::Or(Box::new(left), Box::new(right))
        }
        Expr::Paren(inner) => Expr::Paren(Box::new(folder.fold_expr(inner))),
    }
}

/// Renames field references according to a user-name → backend-name table.
/// Names missing from the table are kept as they are.
pub struct FieldRenamer<'t> {
    table: &'t HashMap<String, String>,
    renamed: usize,
}

impl<'t> FieldRenamer<'t> {
    pub fn new(table: &'t HashMap<String, String>) -> Self {
        Self { table, renamed: 0 }
    }

    /// Number of field references substituted so far
    pub fn renamed(&self) -> usize {
        self.renamed
    }
}

impl ExprFold for FieldRenamer<'_> {
    fn fold_field(&mut self, field: &Identifier) -> Identifier {
        match self.table.get(field.as_str()) {
            Some(target) => {
                self.renamed += 1;
                Identifier::new(target.clone())
            }
            None => field.clone(),
        }
    }

    fn fold_expr(&mut self, expr: &Expr) -> Expr {
        match expr {
            // each group is renamed by its own sub-pass
            Expr::Paren(inner) => {
                let mut sub = FieldRenamer::new(self.table);
                let inner = sub.fold_expr(inner);
                self.renamed += sub.renamed;
                Expr::Paren(Box::new(inner))
            }
            _ => walk_expr(self, expr),
        }
    }
}

pub fn rename_fields(expr: &Expr, table: &HashMap<String, String>) -> Expr {
    if table.is_empty() {
        return expr.clone();
    }
    FieldRenamer::new(table).fold_expr(expr)
}

/// Renames the predicate and the ORDER BY fields of a query.
pub fn rewrite_query(query: &Query, table: &HashMap<String, String>) -> Query {
    let mut renamer = FieldRenamer::new(table);
    let predicate = renamer.fold_expr(&query.predicate);
    let order_by = query
        .order_by
        .iter()
        .map(|o| OrderBy {
            field: renamer.fold_field(&o.field),
            descending: o.descending,
        })
        .collect();

    Query {
        source: query.source.clone(),
        predicate,
        order_by,
        offset: query.offset,
        rowcount: query.rowcount,
    }
}
