//! Find filter evaluation
//!
//! Covers the predicate forms the compiler emits: field equality, the
//! comparison and set operators, `$regex`, `$exists`, `$type`, `$not`,
//! `$size`, `$all`, `$elemMatch`, `$geoWithin.$centerSphere` and the
//! logical `$and`/`$or`/`$nor`.

use regex::RegexBuilder;
use serde_json::{Map, Value};

use super::path::{compare, elements, equal, resolve};
use crate::schema::is_object_id;
use crate::store::{StoreError, StoreResult};

use std::cmp::Ordering;

pub fn matches(document: &Value, filter: &Map<String, Value>) -> StoreResult<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for branch in branches(key, condition)? {
                    if !matches(document, branch)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" | "$nor" => {
                let mut any = false;
                for branch in branches(key, condition)? {
                    if matches(document, branch)? {
                        any = true;
                        break;
                    }
                }
                if key == "$or" {
                    any
                } else {
                    !any
                }
            }
            operator if operator.starts_with('$') => {
                return Err(StoreError::Unsupported(format!("top-level operator {}", operator)))
            }
            path => value_matches(&resolve(document, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn branches<'a>(operator: &str, value: &'a Value) -> StoreResult<Vec<&'a Map<String, Value>>> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_object).collect::<Vec<_>>())
        .filter(|objects| value.as_array().map_or(false, |items| items.len() == objects.len()))
        .ok_or_else(|| StoreError::Internal(format!("{} expects an array of objects", operator)))
}

/// An object whose keys are all operators
fn operators(condition: &Value) -> Option<&Map<String, Value>> {
    condition
        .as_object()
        .filter(|map| !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

fn value_matches(values: &[&Value], condition: &Value) -> StoreResult<bool> {
    let Some(ops) = operators(condition) else {
        return Ok(equals_any(values, condition));
    };
    for (operator, argument) in ops {
        if operator == "$options" {
            continue;
        }
        if !operator_matches(values, operator, argument, ops)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Missing values match null
fn equals_any(values: &[&Value], target: &Value) -> bool {
    if target.is_null() && values.is_empty() {
        return true;
    }
    elements(values).iter().any(|v| equal(v, target))
}

fn compares(values: &[&Value], target: &Value, accept: fn(Ordering) -> bool) -> bool {
    elements(values)
        .iter()
        .filter(|v| same_kind(v, target))
        .any(|v| accept(compare(v, target)))
}

fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Null, Value::Null)
    )
}

fn in_list(values: &[&Value], list: &Value) -> StoreResult<bool> {
    let items = list
        .as_array()
        .ok_or_else(|| StoreError::Internal("$in expects an array".into()))?;
    for item in items {
        let hit = match item.as_object().and_then(|m| m.get("$regex")) {
            Some(pattern) => regex_matches(values, pattern, item.get("$options"))?,
            None => equals_any(values, item),
        };
        if hit {
            return Ok(true);
        }
    }
    Ok(false)
}

fn regex_matches(values: &[&Value], pattern: &Value, options: Option<&Value>) -> StoreResult<bool> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| StoreError::Internal("$regex expects a string".into()))?;
    let flags = options.and_then(Value::as_str).unwrap_or("");
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .ignore_whitespace(flags.contains('x'))
        .build()
        .map_err(|e| StoreError::Internal(format!("invalid regex: {}", e)))?;
    Ok(elements(values)
        .iter()
        .filter_map(|v| v.as_str())
        .any(|s| regex.is_match(s)))
}

fn elem_match(values: &[&Value], condition: &Value) -> StoreResult<bool> {
    for value in values {
        let Value::Array(items) = value else {
            continue;
        };
        for item in items {
            let hit = match (operators(condition), condition.as_object(), item) {
                (Some(_), _, _) => value_matches(&[item], condition)?,
                (None, Some(filter), Value::Object(_)) => matches(item, filter)?,
                _ => false,
            };
            if hit {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn type_matches(value: &Value, name: &str) -> bool {
    match (name, value) {
        ("double" | "decimal", Value::Number(_)) => true,
        ("int" | "long", Value::Number(n)) => n.is_i64() || n.is_u64(),
        ("string", Value::String(_)) => true,
        ("objectId", Value::String(s)) => is_object_id(s),
        ("date", Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s).is_ok(),
        ("object", Value::Object(_)) => true,
        ("array", Value::Array(_)) => true,
        ("bool", Value::Bool(_)) => true,
        ("null", Value::Null) => true,
        _ => false,
    }
}

/// `[lng, lat]` of a GeoJSON point or a bare coordinate pair
fn point(value: &Value) -> Option<(f64, f64)> {
    let coordinates = match value {
        Value::Object(map) => map.get("coordinates")?,
        other => other,
    };
    let pair = coordinates.as_array().filter(|a| a.len() == 2)?;
    Some((pair[0].as_f64()?, pair[1].as_f64()?))
}

/// Angular distance in radians
fn central_angle((lng1, lat1): (f64, f64), (lng2, lat2): (f64, f64)) -> f64 {
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = lat2 - lat1;
    let dlng = (lng2 - lng1).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * h.sqrt().min(1.0).asin()
}

fn geo_within(values: &[&Value], argument: &Value) -> StoreResult<bool> {
    let sphere = argument
        .get("$centerSphere")
        .and_then(Value::as_array)
        .filter(|a| a.len() == 2)
        .ok_or_else(|| StoreError::Unsupported("$geoWithin supports $centerSphere only".into()))?;
    let center = point(&sphere[0]).ok_or_else(|| StoreError::Internal("invalid $centerSphere center".into()))?;
    let radius = sphere[1]
        .as_f64()
        .ok_or_else(|| StoreError::Internal("invalid $centerSphere radius".into()))?;
    Ok(values
        .iter()
        .filter_map(|v| point(v))
        .any(|p| central_angle(center, p) <= radius))
}

fn operator_matches(
    values: &[&Value],
    operator: &str,
    argument: &Value,
    siblings: &Map<String, Value>,
) -> StoreResult<bool> {
    Ok(match operator {
        "$eq" => equals_any(values, argument),
        "$ne" => !equals_any(values, argument),
        "$gt" => compares(values, argument, Ordering::is_gt),
        "$gte" => compares(values, argument, Ordering::is_ge),
        "$lt" => compares(values, argument, Ordering::is_lt),
        "$lte" => compares(values, argument, Ordering::is_le),
        "$in" => in_list(values, argument)?,
        "$nin" => !in_list(values, argument)?,
        "$exists" => values.is_empty() != super::path::truthy(argument),
        "$regex" => regex_matches(values, argument, siblings.get("$options"))?,
        "$not" => !value_matches(values, argument)?,
        "$size" => {
            let size = argument.as_u64();
            values
                .iter()
                .any(|v| matches!(v, Value::Array(items) if Some(items.len() as u64) == size))
        }
        "$all" => {
            let items = argument
                .as_array()
                .ok_or_else(|| StoreError::Internal("$all expects an array".into()))?;
            let mut all = !items.is_empty();
            for item in items {
                let hit = match item.as_object().and_then(|m| m.get("$elemMatch")) {
                    Some(inner) => elem_match(values, inner)?,
                    None => equals_any(values, item),
                };
                if !hit {
                    all = false;
                    break;
                }
            }
            all
        }
        "$elemMatch" => elem_match(values, argument)?,
        "$type" => {
            let name = argument.as_str().unwrap_or_default();
            elements(values).iter().any(|v| type_matches(v, name))
        }
        "$geoWithin" => geo_within(values, argument)?,
        other => return Err(StoreError::Unsupported(format!("filter operator {}", other))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(document: Value, filter: Value) -> bool {
        matches(&document, filter.as_object().unwrap()).unwrap()
    }

    #[test]
    fn test_equality_and_comparisons() {
        let doc = json!({"c_name": "ann", "c_age": 31, "idx": {"s1": "ann"}});
        assert!(check(doc.clone(), json!({"c_name": "ann", "idx.s1": "ann"})));
        assert!(check(doc.clone(), json!({"c_age": {"$gt": 30, "$lte": 31}})));
        assert!(!check(doc.clone(), json!({"c_age": {"$gt": "30"}})));
        assert!(check(doc.clone(), json!({"c_missing": null})));
        assert!(check(doc, json!({"c_age": {"$in": [1, 31.0]}})));
    }

    #[test]
    fn test_array_semantics() {
        let doc = json!({"c_tags": ["a", "b"], "c_comments": [{"c_body": "x", "c_votes": 2}]});
        assert!(check(doc.clone(), json!({"c_tags": "a"})));
        assert!(check(doc.clone(), json!({"c_tags": {"$size": 2}})));
        assert!(check(doc.clone(), json!({"c_tags": {"$all": ["a", "b"]}})));
        assert!(!check(doc.clone(), json!({"c_tags": {"$all": ["a", "z"]}})));
        assert!(check(
            doc.clone(),
            json!({"c_comments": {"$elemMatch": {"c_body": "x", "c_votes": {"$gte": 2}}}})
        ));
        assert!(check(doc.clone(), json!({"c_comments.c_body": "x"})));
        assert!(check(doc, json!({"c_tags": {"$elemMatch": {"$gt": "a"}}})));
    }

    #[test]
    fn test_negation_regex_and_logic() {
        let doc = json!({"c_name": "Annie"});
        assert!(check(doc.clone(), json!({"c_name": {"$regex": "^ann", "$options": "i"}})));
        assert!(check(doc.clone(), json!({"c_name": {"$not": {"$in": ["bob"]}}})));
        assert!(check(doc.clone(), json!({"c_name": {"$in": [{"$regex": "nie$", "$options": ""}]}})));
        assert!(check(doc.clone(), json!({"$or": [{"c_name": "x"}, {"c_name": "Annie"}]})));
        assert!(!check(doc.clone(), json!({"$and": [{"c_name": "Annie"}, {"c_name": {"$exists": false}}]})));
        assert!(check(doc, json!({"c_name": {"$type": "string"}, "c_other": {"$exists": false}})));
    }

    #[test]
    fn test_geo_within_center_sphere() {
        let doc = json!({"c_where": {"type": "Point", "coordinates": [-79.38, 43.65]}});
        let near = json!({"c_where": {"$geoWithin": {"$centerSphere": [[-79.4, 43.6], 10.0 / 6378.1]}}});
        let far = json!({"c_where": {"$geoWithin": {"$centerSphere": [[2.35, 48.85], 10.0 / 6378.1]}}});
        assert!(check(doc.clone(), near));
        assert!(!check(doc, far));
    }
}
