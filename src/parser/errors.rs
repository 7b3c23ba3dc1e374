//! Query compiler error types
//!
//! Kinds:
//! - invalidArgument: malformed input, exceeded bound, type mismatch
//! - unsupportedOperation: well-formed but disallowed combination
//! - accessDenied: explicit ACL refusal
//! - notFound: hidden or missing property
//! - aborted: cooperative cancellation
//! - store: passed through from the document store

use std::fmt;

use thiserror::Error;

use crate::schema::SchemaError;
use crate::store::StoreError;

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryErrorKind {
    InvalidArgument,
    UnsupportedOperation,
    AccessDenied,
    NotFound,
    Aborted,
    Store,
}

impl QueryErrorKind {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            QueryErrorKind::InvalidArgument => "QUERY_INVALID_ARGUMENT",
            QueryErrorKind::UnsupportedOperation => "QUERY_UNSUPPORTED_OPERATION",
            QueryErrorKind::AccessDenied => "QUERY_ACCESS_DENIED",
            QueryErrorKind::NotFound => "QUERY_NOT_FOUND",
            QueryErrorKind::Aborted => "QUERY_ABORTED",
            QueryErrorKind::Store => "QUERY_STORE_ERROR",
        }
    }
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Compilation or execution failure
#[derive(Debug, Clone, Error)]
#[error("[{kind}] {message}{}", .path.as_ref().map(|p| format!(" (path: {})", p)).unwrap_or_default())]
pub struct QueryError {
    kind: QueryErrorKind,
    reason: Option<&'static str>,
    message: String,
    path: Option<String>,
    #[source]
    source: Option<StoreError>,
}

impl QueryError {
    fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            reason: None,
            message: message.into(),
            path: None,
            source: None,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::InvalidArgument, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::UnsupportedOperation, message)
    }

    /// Exact matching against arrays or sub-documents is not supported
    pub fn exact_matching() -> Self {
        let mut err = Self::new(
            QueryErrorKind::UnsupportedOperation,
            "Exact matching of arrays and documents is not supported.",
        );
        err.reason = Some("exactMatching");
        err
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::AccessDenied, message)
    }

    /// Property lookup failed or the property is hidden from the caller
    pub fn property_not_found() -> Self {
        let mut err = Self::new(QueryErrorKind::NotFound, "Property not found.");
        err.reason = Some("property");
        err
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Aborted, message)
    }

    /// Attaches the chain or field path the error refers to
    pub fn at(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        if !path.is_empty() {
            self.path = Some(path);
        }
        self
    }

    pub fn kind(&self) -> QueryErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Sub-code, such as `exactMatching`
    pub fn reason(&self) -> Option<&'static str> {
        self.reason
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn is_store(&self) -> bool {
        self.kind == QueryErrorKind::Store
    }

    pub fn store_error(&self) -> Option<&StoreError> {
        self.source.as_ref()
    }
}

impl From<StoreError> for QueryError {
    fn from(e: StoreError) -> Self {
        let mut err = Self::new(QueryErrorKind::Store, e.to_string());
        err.source = Some(e);
        err
    }
}

impl From<SchemaError> for QueryError {
    fn from(e: SchemaError) -> Self {
        match &e {
            SchemaError::Cast { path, .. } => {
                let path = path.clone();
                Self::invalid_argument(e.to_string()).at(path)
            }
            SchemaError::InvalidModel { .. } => Self::invalid_argument(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_argument(format!("Invalid JSON: {}", e))
    }
}

/// Result type for query compilation and execution
pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(QueryErrorKind::InvalidArgument.code(), "QUERY_INVALID_ARGUMENT");
        assert_eq!(QueryErrorKind::AccessDenied.code(), "QUERY_ACCESS_DENIED");
        assert_eq!(QueryErrorKind::NotFound.code(), "QUERY_NOT_FOUND");
    }

    #[test]
    fn test_display_includes_path() {
        let err = QueryError::invalid_argument("Maximum query depth exceeded").at("c_a.$and");
        let display = err.to_string();
        assert!(display.contains("QUERY_INVALID_ARGUMENT"));
        assert!(display.contains("c_a.$and"));
    }

    #[test]
    fn test_exact_matching_reason() {
        let err = QueryError::exact_matching();
        assert_eq!(err.kind(), QueryErrorKind::UnsupportedOperation);
        assert_eq!(err.reason(), Some("exactMatching"));
    }

    #[test]
    fn test_store_errors_keep_source() {
        let err: QueryError = StoreError::Timeout(250).into();
        assert!(err.is_store());
        assert!(matches!(err.store_error(), Some(StoreError::Timeout(250))));
    }
}
