//! CLI-specific error types

use std::fmt;
use std::io;

use crate::parser::QueryError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Model file missing or malformed
    ModelError,
    /// I/O error (stdin/stdout)
    IoError,
    /// Compilation or execution failure, with the query error code
    QueryFailed(&'static str),
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModelError => "DOCQL_CLI_MODEL_ERROR",
            Self::IoError => "DOCQL_CLI_IO_ERROR",
            Self::QueryFailed(code) => code,
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn model_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ModelError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<QueryError> for CliError {
    fn from(e: QueryError) -> Self {
        let message = match e.path() {
            Some(path) => format!("{} (path: {})", e.message(), path),
            None => e.message().to_string(),
        };
        Self::new(CliErrorCode::QueryFailed(e.code()), message)
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_errors_keep_their_code() {
        let err: CliError = QueryError::invalid_argument("Array expected for pipeline").into();
        assert_eq!(err.code_str(), "QUERY_INVALID_ARGUMENT");
        assert_eq!(err.to_string(), "QUERY_INVALID_ARGUMENT: Array expected for pipeline");
    }
}
