//! Schema-side errors

use thiserror::Error;

use super::property::PropertyType;

/// Result type for schema operations
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors raised while assembling models or casting values
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    /// A value could not be cast to the property's type
    #[error("Cannot cast {value} to {expected} for property '{path}'")]
    Cast {
        path: String,
        expected: PropertyType,
        value: String,
    },

    /// A model definition is malformed
    #[error("Invalid model '{model}': {reason}")]
    InvalidModel { model: String, reason: String },
}

impl SchemaError {
    pub fn cast(path: &str, expected: PropertyType, value: &serde_json::Value) -> Self {
        Self::Cast {
            path: path.to_string(),
            expected,
            value: value.to_string(),
        }
    }

    pub fn invalid_model(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidModel {
            model: model.into(),
            reason: reason.into(),
        }
    }
}
