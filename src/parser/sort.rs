//! Sort compiler
//!
//! Sorting on stored documents must go through an index: either every
//! candidate is natively indexed, or they all share one custom slot and the
//! sort runs on `idx.<slot>`. After a `$group` or computed `$project`, any
//! output field may be sorted.

use serde_json::{Map, Value};

use crate::schema::PropertyType;

use super::access::PropertyChecks;
use super::chain::Chain;
use super::consts::{INDEX_PREFIX, MAX_EXPRESSION_KEYS};
use super::context::CompileContext;
use super::errors::{QueryError, QueryResult};
use super::rules::{normalize_object, validate_field_path};

/// A compiled sort and the property paths it touches
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSort {
    pub expression: Map<String, Value>,
    pub paths: Vec<String>,
}

/// Accepts a bare field name (`"c_name"`), an array of single-key objects,
/// an object, or a JSON string of either.
pub fn normalize_sort(value: &Value) -> QueryResult<Map<String, Value>> {
    match value {
        Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => {
            let mut map = Map::new();
            map.insert(s.clone(), Value::from(1));
            Ok(map)
        }
        Value::String(s) => {
            let parsed: Value = serde_json::from_str(s)
                .map_err(|e| QueryError::invalid_argument(format!("Invalid sort JSON format: {}", e)))?;
            normalize_sort(&parsed)
        }
        Value::Array(items) => {
            let mut merged = Map::new();
            for item in items {
                let entry = item
                    .as_object()
                    .ok_or_else(|| QueryError::invalid_argument("Object expected for sort expression"))?;
                merged.extend(entry.clone());
            }
            Ok(merged)
        }
        other => normalize_object(other, "sort"),
    }
}

pub struct SortCompiler<'a> {
    cx: &'a mut CompileContext,
    skip_acl: bool,
}

impl<'a> SortCompiler<'a> {
    pub fn new(cx: &'a mut CompileContext, skip_acl: bool) -> Self {
        Self { cx, skip_acl }
    }

    pub fn compile(mut self, value: &Value) -> QueryResult<CompiledSort> {
        let sort = normalize_sort(value)?;
        if !self.cx.relax() && sort.len() > MAX_EXPRESSION_KEYS {
            return Err(QueryError::invalid_argument(format!(
                "Maximum sort elements ({}) exceeded",
                MAX_EXPRESSION_KEYS
            )));
        }

        let mut expression = Map::new();
        let mut paths = Vec::new();
        for (field, direction) in &sort {
            let direction = match self.direction(field, direction)? {
                Some(direction) => direction,
                None => {
                    // placeholder, resolved at execution
                    expression.insert(field.clone(), direction.clone());
                    continue;
                }
            };
            if self.cx.shape().is_derived() {
                if !self.cx.shape().has_field(field) {
                    return Err(QueryError::invalid_argument(format!(
                        "Field is not available at this point of the pipeline ({}).",
                        field
                    ))
                    .at(field.as_str()));
                }
                expression.insert(field.clone(), Value::from(direction));
                continue;
            }
            self.property(field, direction, &mut expression)?;
            paths.push(field.clone());
        }

        Ok(CompiledSort { expression, paths })
    }

    /// `Some(1 | -1)`, or `None` for a variable
    fn direction(&mut self, field: &str, value: &Value) -> QueryResult<Option<i64>> {
        if self.cx.variables.check(value, "Number")? {
            return Ok(None);
        }
        match value.as_i64() {
            Some(d @ (1 | -1)) => Ok(Some(d)),
            _ => Err(QueryError::invalid_argument(
                "Sort value must be 1 for ascending, or -1 for descending order",
            )
            .at(field)),
        }
    }

    fn property(&mut self, field: &str, direction: i64, into: &mut Map<String, Value>) -> QueryResult<()> {
        let chain = Chain::new();
        validate_field_path(field, &chain)?;

        let mut checks = PropertyChecks::new()
            .trusted(self.skip_acl)
            .skip_index_check()
            .skip_children();
        checks.allow_custom_readers = true;
        let candidates = self.cx.process_property(field, &chain, checks)?;

        for candidate in &candidates {
            if self.cx.is_array(candidate) {
                return Err(QueryError::invalid_argument("Array sorting is unsupported.").at(field));
            }
            let concrete = candidate
                .parents()
                .iter()
                .map(|p| p.as_ref())
                .chain(std::iter::once(candidate.property()))
                .all(|p| !p.custom_reader && !p.is_virtual);
            if !concrete {
                return Err(QueryError::invalid_argument(format!(
                    "Sorting cannot occur on properties not backed by concrete data ({})",
                    candidate.full_path()
                ))
                .at(field));
            }
            if matches!(
                candidate.type_name(),
                PropertyType::Document | PropertyType::Set | PropertyType::Geometry
            ) {
                return Err(QueryError::invalid_argument("Sorting can only occur on primitive values").at(field));
            }
        }

        let native = candidates.iter().filter(|c| c.property().native_index).count();
        let slots: Vec<&str> = candidates
            .iter()
            .filter(|c| c.property().indexed)
            .filter_map(|c| c.slot())
            .collect();

        if native > 0 {
            if native < candidates.len() && !self.cx.options().ignores_indexes() {
                return Err(QueryError::invalid_argument(
                    "Native properties can only sorted when they are all indexed.",
                )
                .at(field));
            }
            let first = &candidates[0];
            match first.property().modifier() {
                Some(modifier) => modifier.sort(self.cx.ac(), first.full_path(), direction, into),
                None => {
                    into.insert(first.full_path().to_string(), Value::from(direction));
                }
            }
            return Ok(());
        }

        match slots.first() {
            Some(slot) if slots.len() == candidates.len() => {
                if slots.iter().any(|s| s != slot) {
                    return Err(QueryError::invalid_argument(
                        "Sorting cannot occur across similarly named custom properties.",
                    )
                    .at(field));
                }
                let first = &candidates[0];
                let mut key = format!("{}.{}", INDEX_PREFIX, slot);
                if first.property().unique {
                    key.push_str(".v");
                }
                into.insert(key, Value::from(direction));
                Ok(())
            }
            _ if self.cx.options().ignores_indexes() => {
                into.insert(candidates[0].full_path().to_string(), Value::from(direction));
                Ok(())
            }
            _ => Err(QueryError::invalid_argument("Sorting can only occur against indexed properties.").at(field)),
        }
    }
}

/// Flips every literal direction; placeholders are left alone
pub fn invert_sort(sort: &Map<String, Value>) -> Map<String, Value> {
    sort.iter()
        .map(|(k, v)| {
            let flipped = v.as_i64().map(|d| Value::from(-d)).unwrap_or_else(|| v.clone());
            (k.clone(), flipped)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::parser::context::Shape;
    use crate::parser::options::ParserOptions;
    use crate::schema::{AccessContext, AccessLevel, IndexSlot, Model, Principal, Property};

    fn model(name: &str, slot: &str) -> Arc<Model> {
        Arc::new(
            Model::new(
                name,
                "contexts",
                vec![
                    Property::new("c_name", PropertyType::String).indexed(1),
                    Property::new("c_rank", PropertyType::Number).indexed(2).unique(),
                    Property::new("c_tags", PropertyType::String).indexed(3).array(),
                    Property::new("c_note", PropertyType::String),
                    Property::new("c_computed", PropertyType::Number).indexed(4).virtual_property(),
                    Property::new("c_created", PropertyType::Date)
                        .native()
                        .with_read_access(AccessLevel::Share),
                ],
                vec![
                    IndexSlot::new(1, slot),
                    IndexSlot::new(2, "u1"),
                    IndexSlot::new(3, "s9"),
                    IndexSlot::new(4, "s8"),
                ],
            )
            .unwrap(),
        )
    }

    fn context(models: Vec<Arc<Model>>) -> CompileContext {
        CompileContext::new(
            models,
            AccessContext::new(Principal::anonymous(), AccessLevel::Read),
            ParserOptions::default(),
        )
    }

    fn compile(cx: &mut CompileContext, value: Value) -> QueryResult<Value> {
        SortCompiler::new(cx, false)
            .compile(&value)
            .map(|s| Value::Object(s.expression))
    }

    #[test]
    fn test_slot_and_native_keys() {
        let mut cx = context(vec![model("c_a", "s1")]);
        assert_eq!(
            compile(&mut cx, json!({"c_name": 1, "c_rank": -1, "c_created": -1})).unwrap(),
            json!({"idx.s1": 1, "idx.u1.v": -1, "c_created": -1})
        );
        assert_eq!(cx.access_level(), AccessLevel::Share);
    }

    #[test]
    fn test_normalized_forms() {
        let mut cx = context(vec![model("c_a", "s1")]);
        assert_eq!(compile(&mut cx, json!("c_name")).unwrap(), json!({"idx.s1": 1}));
        assert_eq!(
            compile(&mut cx, json!([{"c_name": -1}, {"_id": 1}])).unwrap(),
            json!({"idx.s1": -1, "_id": 1})
        );
        assert_eq!(compile(&mut cx, json!(r#"{"_id": -1}"#)).unwrap(), json!({"_id": -1}));
    }

    #[test]
    fn test_rejections() {
        let mut cx = context(vec![model("c_a", "s1")]);
        assert!(compile(&mut cx, json!({"c_tags": 1})).is_err());
        assert!(compile(&mut cx, json!({"c_note": 1})).is_err());
        assert!(compile(&mut cx, json!({"c_name": 2})).is_err());
        let err = compile(&mut cx, json!({"c_computed": 1})).unwrap_err();
        assert!(err.message().contains("concrete data"));
    }

    #[test]
    fn test_disparate_slots_rejected() {
        let mut cx = context(vec![model("c_a", "s1"), model("c_b", "s2")]);
        let err = compile(&mut cx, json!({"c_name": 1})).unwrap_err();
        assert!(err.message().contains("similarly named"));

        let mut shared = context(vec![model("c_a", "s1"), model("c_b", "s1")]);
        assert_eq!(compile(&mut shared, json!({"c_name": 1})).unwrap(), json!({"idx.s1": 1}));
    }

    #[test]
    fn test_derived_fields() {
        let mut cx = context(vec![model("c_a", "s1")]);
        cx.set_shape(Shape::Derived {
            fields: vec!["_id".into(), "total".into()],
            single: false,
        });
        assert_eq!(compile(&mut cx, json!({"total": -1})).unwrap(), json!({"total": -1}));
        assert!(compile(&mut cx, json!({"c_name": 1})).is_err());
    }

    #[test]
    fn test_invert() {
        let sort = normalize_sort(&json!({"_id": -1, "c_a": "{{dir}}"})).unwrap();
        assert_eq!(
            Value::Object(invert_sort(&sort)),
            json!({"_id": 1, "c_a": "{{dir}}"})
        );
    }
}
