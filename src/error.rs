//! Error types for minitsdb
//!
//! Defines a unified error type that can represent failures from all
//! components: the backend key-value database, the block storage engine,
//! and the HTTP request layer.

use std::fmt;
use std::io;

/// Unified error type for minitsdb operations
#[derive(Debug)]
pub enum TsdbError {
    /// I/O error (network, sockets)
    Io(io::Error),
    /// Generic backend database failure (throttling, timeout, rejection)
    Backend(String),
    /// A physical table does not exist
    TableNotFound(String),
    /// A physical table already exists
    TableExists(String),
    /// Malformed item or key read back from the backend
    Item(String),
    /// Block lifecycle misuse or failure
    Block(String),
    /// Schema-level failure (master table, slot records)
    Schema(String),
    /// JSON-related error
    Json(String),
    /// Malformed client request
    Request(String),
    /// Generic internal error
    Internal(String),
}

impl TsdbError {
    /// Create a "table not found" error
    pub fn table_not_found(name: &str) -> Self {
        TsdbError::TableNotFound(format!("Table '{}' does not exist", name))
    }

    /// Create a "table already exists" error
    pub fn table_exists(name: &str) -> Self {
        TsdbError::TableExists(format!("Table '{}' already exists", name))
    }

    /// Create the error for `replace` called with a timestamp that maps to a
    /// different ring slot. This is a programmer error, not a data condition.
    pub fn wrong_slot(timestamp: u64, pos: usize, n: usize) -> Self {
        TsdbError::Block(format!(
            "time {} (pos={}) is not valid for block (pos={})",
            timestamp, pos, n
        ))
    }

    /// Create a malformed-request error
    pub fn request(msg: impl Into<String>) -> Self {
        TsdbError::Request(msg.into())
    }

    /// HTTP status code for this error, used at the request boundary.
    /// Everything the client can fix is 400; the rest is 500.
    pub fn http_status(&self) -> u16 {
        match self {
            TsdbError::Request(_) | TsdbError::Json(_) => 400,
            _ => 500,
        }
    }
}

impl fmt::Display for TsdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TsdbError::Io(e) => write!(f, "{}", e),
            TsdbError::Backend(msg) => write!(f, "{}", msg),
            TsdbError::TableNotFound(msg) => write!(f, "{}", msg),
            TsdbError::TableExists(msg) => write!(f, "{}", msg),
            TsdbError::Item(msg) => write!(f, "{}", msg),
            TsdbError::Block(msg) => write!(f, "{}", msg),
            TsdbError::Schema(msg) => write!(f, "{}", msg),
            TsdbError::Json(msg) => write!(f, "{}", msg),
            TsdbError::Request(msg) => write!(f, "{}", msg),
            TsdbError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for TsdbError {}

impl From<io::Error> for TsdbError {
    fn from(e: io::Error) -> Self {
        TsdbError::Io(e)
    }
}

impl From<serde_json::Error> for TsdbError {
    fn from(e: serde_json::Error) -> Self {
        TsdbError::Json(e.to_string())
    }
}

/// Result type alias for minitsdb operations
pub type Result<T> = std::result::Result<T, TsdbError>;
