//! Compiler for key-value stores that can only be probed by one field.

use crate::ast::{CompOp, Expr, Literal, Query};
use crate::compiler::{CompileResult, NativeQuery, QueryCompiler};
use crate::error::CompileError;

pub struct LookupCompiler {
    field: String,
}

impl LookupCompiler {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl QueryCompiler for LookupCompiler {
    fn name(&self) -> &'static str {
        "lookup"
    }

    fn compile(&self, query: &Query) -> Result<CompileResult, CompileError> {
        let mut expr = &query.predicate;
        while let Expr::Paren(inner) = expr {
            expr = inner.as_ref();
        }

        let (field, value) = match expr {
            Expr::Comparison { field, op: CompOp::Eq, value } => (field, value),
            Expr::Comparison { op, .. } => {
                return Err(CompileError::new(format!(
                    "operator '{}' is not supported, only {} = value lookups",
                    op, self.field
                )))
            }
            _ => {
                return Err(CompileError::new(format!(
                    "only a single {} = value comparison is supported",
                    self.field
                )))
            }
        };

        if field.as_str() != self.field {
            return Err(CompileError::new(format!(
                "field '{}' can't be searched, expected '{}'",
                field, self.field
            )));
        }

        let value = match value {
            Literal::String(s) => s.clone(),
            Literal::Integer(n) => n.to_string(),
            Literal::Float(n) => n.to_string(),
            Literal::Bool(b) => b.to_string(),
            Literal::Column(_) | Literal::List(_) => {
                return Err(CompileError::new(format!("unsupported lookup value {}", value)))
            }
        };

        Ok(CompileResult {
            native: NativeQuery::Lookup {
                field: self.field.clone(),
                value,
            },
            optimizations: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::prepare;

    fn compile_raw(raw: &str) -> Result<CompileResult, CompileError> {
        let query = prepare(raw, 500).unwrap();
        LookupCompiler::new("ip").compile(&query)
    }

    #[test]
    fn test_single_equality() {
        let result = compile_raw("FROM kv WHERE ((ip = '8.8.8.8'))").unwrap();
        assert_eq!(
            result.native,
            NativeQuery::Lookup { field: "ip".to_string(), value: "8.8.8.8".to_string() }
        );
    }

    #[test]
    fn test_rejects_deeper_trees_and_other_fields() {
        assert!(compile_raw("FROM kv WHERE ip = '1' OR ip = '2'").is_err());
        assert!(compile_raw("FROM kv WHERE ip != '1'").is_err());
        assert!(compile_raw("FROM kv WHERE domain = 'x'").is_err());
        assert!(compile_raw("FROM kv WHERE ip = exist").is_err());
    }
}
