//! Query federation: one restricted SQL query fanned out to heterogeneous
//! backends, merged into a single relation graph.

pub mod ast;
pub mod backends;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod document_compiler;
pub mod error;
pub mod executor;
pub mod extract;
pub mod federation;
pub mod lexer;
pub mod lookup_compiler;
pub mod normalizer;
pub mod parser;
pub mod processor;
pub mod record;
pub mod registry;
pub mod relation;
pub mod rewriter;
pub mod sql_compiler;
pub mod stats;
pub mod token;

pub use config::{ServerConfig, GLOBAL_SOURCE};
pub use error::{CompileError, ExecutionError, QueryError};
pub use federation::{AggregateResult, Federator, SearchLimits, SearchOptions};
pub use registry::{Backend, BackendRegistry};
