//! Error types shared across the federation pipeline.

use crate::parser::ParseError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Query-scoped errors. Raised before any backend is contacted, or while
/// specializing a query for one backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("{0}")]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Validation(String),
    #[error("Can't split query: {0}")]
    Split(String),
}

impl QueryError {
    pub fn validation(message: impl Into<String>) -> Self {
        QueryError::Validation(message.into())
    }
}

/// A backend compiler could not represent a valid predicate.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Backend(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("unsupported native query: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("search cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Error)]
#[error("{plugin}: {message}")]
pub struct ProcessorError {
    pub plugin: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("cannot read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
