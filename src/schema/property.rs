//! Property metadata consumed by the query compiler

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::access::{AccessContext, AccessLevel, AclEntry};
use super::errors::{SchemaError, SchemaResult};

/// Value types a property may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    String,
    Number,
    Boolean,
    Date,
    ObjectId,
    Geometry,
    Document,
    Set,
    Reference,
    Any,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::String => "String",
            PropertyType::Number => "Number",
            PropertyType::Boolean => "Boolean",
            PropertyType::Date => "Date",
            PropertyType::ObjectId => "ObjectId",
            PropertyType::Geometry => "Geometry",
            PropertyType::Document => "Document",
            PropertyType::Set => "Set",
            PropertyType::Reference => "Reference",
            PropertyType::Any => "Any",
        }
    }

    /// Document and Set hold child properties
    pub fn is_container(&self) -> bool {
        matches!(self, PropertyType::Document | PropertyType::Set)
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-property override of how the property is referenced in a plan.
///
/// Every method defaults to the unmodified path.
pub trait PropertyModifier: Send + Sync + fmt::Debug {
    /// Writes the sort entry for this property into `into`
    fn sort(&self, _ac: &AccessContext, path: &str, direction: i64, into: &mut Map<String, Value>) {
        into.insert(path.to_string(), Value::from(direction));
    }

    /// Path used when the property is referenced from a group expression
    fn group_path(&self, _ac: &AccessContext, path: &str) -> String {
        path.to_string()
    }

    /// Path used for the logical predicate of a match
    fn match_path(&self, _ac: &AccessContext, path: &str) -> String {
        path.to_string()
    }
}

fn default_true() -> bool {
    true
}

/// Field metadata. Properties form a tree through `properties`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub name: String,

    #[serde(rename = "type")]
    pub property_type: PropertyType,

    /// Internal numeric id used to look up the index slot
    #[serde(default)]
    pub id: Option<u32>,

    #[serde(default = "default_true")]
    pub readable: bool,

    /// Explicit grants. Empty means the global `read_access` applies.
    #[serde(default)]
    pub acl: Vec<AclEntry>,

    #[serde(default)]
    pub read_access: AccessLevel,

    #[serde(default)]
    pub indexed: bool,

    /// Stored as a top-level indexed field, no slot indirection
    #[serde(default)]
    pub native_index: bool,

    #[serde(default)]
    pub unique: bool,

    #[serde(default)]
    pub array: bool,

    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,

    /// Value is produced by a reader rather than stored as-is
    #[serde(default)]
    pub custom_reader: bool,

    #[serde(default)]
    pub properties: Vec<Arc<Property>>,

    #[serde(skip)]
    full_path: String,

    #[serde(skip)]
    modifier: Option<Arc<dyn PropertyModifier>>,
}

impl Property {
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        let name = name.into();
        Self {
            full_path: name.clone(),
            name,
            property_type,
            id: None,
            readable: true,
            acl: Vec::new(),
            read_access: AccessLevel::Read,
            indexed: false,
            native_index: false,
            unique: false,
            array: false,
            is_virtual: false,
            custom_reader: false,
            properties: Vec::new(),
            modifier: None,
        }
    }

    /// Marks the property as slot-indexed under the given internal id
    pub fn indexed(mut self, id: u32) -> Self {
        self.id = Some(id);
        self.indexed = true;
        self
    }

    pub fn native(mut self) -> Self {
        self.native_index = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }

    pub fn unreadable(mut self) -> Self {
        self.readable = false;
        self
    }

    pub fn virtual_property(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    pub fn with_read_access(mut self, level: AccessLevel) -> Self {
        self.read_access = level;
        self
    }

    pub fn with_acl(mut self, acl: Vec<AclEntry>) -> Self {
        self.acl = acl;
        self
    }

    pub fn with_properties(mut self, children: Vec<Property>) -> Self {
        self.properties = children.into_iter().map(Arc::new).collect();
        self
    }

    pub fn with_modifier(mut self, modifier: Arc<dyn PropertyModifier>) -> Self {
        self.modifier = Some(modifier);
        self
    }

    /// Dotted path from the model root, set when the model is assembled
    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    pub(crate) fn set_full_path(&mut self, path: String) {
        self.full_path = path;
    }

    pub fn type_name(&self) -> PropertyType {
        self.property_type
    }

    pub fn modifier(&self) -> Option<&Arc<dyn PropertyModifier>> {
        self.modifier.as_ref()
    }

    pub fn child(&self, name: &str) -> Option<&Arc<Property>> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Depth-first walk over this property and all descendants
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Property)) {
        f(self);
        for child in &self.properties {
            child.walk(f);
        }
    }

    /// Casts a caller-supplied value into the stored representation of this
    /// property's type.
    pub fn cast_for_query(&self, _ac: &AccessContext, value: &Value) -> SchemaResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let fail = || SchemaError::cast(self.full_path(), self.property_type, value);

        match self.property_type {
            PropertyType::String => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(fail()),
            },
            PropertyType::Number => match value {
                Value::Number(_) => Ok(value.clone()),
                Value::String(s) => parse_number(s).ok_or_else(fail),
                _ => Err(fail()),
            },
            PropertyType::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) if s == "true" => Ok(Value::Bool(true)),
                Value::String(s) if s == "false" => Ok(Value::Bool(false)),
                _ => Err(fail()),
            },
            PropertyType::Date => cast_date(value).ok_or_else(fail),
            PropertyType::ObjectId | PropertyType::Reference => match value {
                Value::String(s) if is_object_id(s) => Ok(Value::String(s.to_ascii_lowercase())),
                _ => Err(fail()),
            },
            PropertyType::Any => match value {
                Value::Array(_) | Value::Object(_) => Err(fail()),
                _ => Ok(value.clone()),
            },
            PropertyType::Geometry | PropertyType::Document | PropertyType::Set => Err(fail()),
        }
    }
}

fn parse_number(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Value::from(i));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
}

/// Dates are stored as UTC RFC 3339 strings with millisecond precision, which
/// keeps lexical and chronological order identical.
pub fn cast_date(value: &Value) -> Option<Value> {
    let parsed: DateTime<Utc> = match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok()?.with_timezone(&Utc),
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single()?,
        _ => return None,
    };
    Some(Value::String(
        parsed.to_rfc3339_opts(SecondsFormat::Millis, true),
    ))
}

pub fn is_object_id(s: &str) -> bool {
    s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Principal;
    use serde_json::json;

    fn ac() -> AccessContext {
        AccessContext::new(Principal::anonymous(), AccessLevel::Read)
    }

    #[test]
    fn test_cast_number_from_string() {
        let prop = Property::new("c_age", PropertyType::Number);
        assert_eq!(prop.cast_for_query(&ac(), &json!("42")).unwrap(), json!(42));
        assert_eq!(prop.cast_for_query(&ac(), &json!(1.5)).unwrap(), json!(1.5));
        assert!(prop.cast_for_query(&ac(), &json!("abc")).is_err());
    }

    #[test]
    fn test_cast_date_normalizes_to_utc() {
        let prop = Property::new("created", PropertyType::Date);
        let cast = prop
            .cast_for_query(&ac(), &json!("2024-03-01T10:00:00+02:00"))
            .unwrap();
        assert_eq!(cast, json!("2024-03-01T08:00:00.000Z"));
    }

    #[test]
    fn test_cast_object_id() {
        let prop = Property::new("_id", PropertyType::ObjectId);
        assert!(prop
            .cast_for_query(&ac(), &json!("5F1B2C3D4E5F6A7B8C9D0E1F"))
            .is_ok());
        assert!(prop.cast_for_query(&ac(), &json!("nope")).is_err());
    }

    #[test]
    fn test_containers_are_not_castable() {
        let prop = Property::new("c_doc", PropertyType::Document);
        assert!(prop.cast_for_query(&ac(), &json!("x")).is_err());
    }

    #[test]
    fn test_property_deserializes_with_defaults() {
        let prop: Property = serde_json::from_value(json!({
            "name": "c_name",
            "type": "String",
            "id": 3,
            "indexed": true
        }))
        .unwrap();
        assert!(prop.readable);
        assert_eq!(prop.read_access, AccessLevel::Read);
        assert_eq!(prop.id, Some(3));
    }
}
