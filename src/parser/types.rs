//! Inferred types of group expressions

use std::fmt;

use crate::schema::PropertyType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprType {
    String,
    Number,
    Boolean,
    Date,
    ObjectId,
    Any,
    Array(Box<ExprType>),
}

impl ExprType {
    pub fn array_of(element: ExprType) -> Self {
        ExprType::Array(Box::new(element))
    }

    /// Type of a property reference. Structured values are opaque (`Any`).
    pub fn from_property(property_type: PropertyType, array: bool) -> Self {
        let scalar = match property_type {
            PropertyType::String => ExprType::String,
            PropertyType::Number => ExprType::Number,
            PropertyType::Boolean => ExprType::Boolean,
            PropertyType::Date => ExprType::Date,
            PropertyType::ObjectId | PropertyType::Reference => ExprType::ObjectId,
            PropertyType::Geometry | PropertyType::Document | PropertyType::Set | PropertyType::Any => {
                ExprType::Any
            }
        };
        if array {
            ExprType::array_of(scalar)
        } else {
            scalar
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ExprType::Array(_))
    }

    pub fn is_numeric_or_date(&self) -> bool {
        matches!(self, ExprType::Number | ExprType::Date)
    }

    /// Derived document fields carry no static type and satisfy any
    /// expectation.
    pub fn satisfies(&self, expected: &ExprType) -> bool {
        *self == ExprType::Any || self == expected
    }

    /// Name used when recording variables, e.g. `String[]`
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ExprType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprType::String => f.write_str("String"),
            ExprType::Number => f.write_str("Number"),
            ExprType::Boolean => f.write_str("Boolean"),
            ExprType::Date => f.write_str("Date"),
            ExprType::ObjectId => f.write_str("ObjectId"),
            ExprType::Any => f.write_str("Any"),
            ExprType::Array(inner) => write!(f, "{}[]", inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_types() {
        assert_eq!(
            ExprType::from_property(PropertyType::Reference, false),
            ExprType::ObjectId
        );
        assert_eq!(
            ExprType::from_property(PropertyType::Number, true),
            ExprType::array_of(ExprType::Number)
        );
        assert_eq!(ExprType::from_property(PropertyType::Document, false), ExprType::Any);
    }

    #[test]
    fn test_array_element_types_distinguish() {
        assert_ne!(
            ExprType::array_of(ExprType::Number),
            ExprType::array_of(ExprType::String)
        );
        assert_eq!(ExprType::array_of(ExprType::Any).to_string(), "Any[]");
    }

    #[test]
    fn test_any_satisfies_everything() {
        assert!(ExprType::Any.satisfies(&ExprType::Date));
        assert!(ExprType::Number.satisfies(&ExprType::Number));
        assert!(!ExprType::String.satisfies(&ExprType::Number));
    }
}
