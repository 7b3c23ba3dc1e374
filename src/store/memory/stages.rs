//! Aggregation pipeline evaluation

use serde_json::{Map, Value};

use super::expr::evaluate;
use super::filter::matches;
use super::path::{compare, equal, get, number, remove, set};
use crate::store::{StoreError, StoreResult};

pub fn run(mut documents: Vec<Value>, pipeline: &[Value]) -> StoreResult<Vec<Value>> {
    for stage in pipeline {
        let (name, body) = stage
            .as_object()
            .filter(|m| m.len() == 1)
            .and_then(|m| m.iter().next())
            .ok_or_else(|| StoreError::Internal(format!("invalid pipeline stage {}", stage)))?;

        documents = match name.as_str() {
            "$match" => {
                let filter = object(name, body)?;
                let mut kept = Vec::with_capacity(documents.len());
                for document in documents {
                    if matches(&document, filter)? {
                        kept.push(document);
                    }
                }
                kept
            }
            "$sort" => {
                sort(&mut documents, object(name, body)?);
                documents
            }
            "$skip" => documents.into_iter().skip(count(name, body)?).collect(),
            "$limit" => {
                documents.truncate(count(name, body)?);
                documents
            }
            "$project" => {
                let spec = object(name, body)?;
                documents
                    .iter()
                    .map(|d| project(d, spec))
                    .collect::<StoreResult<Vec<_>>>()?
            }
            "$addFields" => {
                let spec = object(name, body)?;
                let mut out = Vec::with_capacity(documents.len());
                for document in documents {
                    let mut fields = document.as_object().cloned().unwrap_or_default();
                    for (key, expression) in spec {
                        set(&mut fields, key, evaluate(&document, expression)?);
                    }
                    out.push(Value::Object(fields));
                }
                out
            }
            "$unwind" => unwind(documents, body)?,
            "$group" => group(&documents, object(name, body)?)?,
            "$count" => {
                let field = body
                    .as_str()
                    .ok_or_else(|| StoreError::Internal("$count expects a field name".into()))?;
                let mut out = Map::new();
                out.insert(field.to_string(), Value::from(documents.len()));
                vec![Value::Object(out)]
            }
            other => return Err(StoreError::Unsupported(format!("pipeline stage {}", other))),
        };
    }
    Ok(documents)
}

fn object<'a>(name: &str, body: &'a Value) -> StoreResult<&'a Map<String, Value>> {
    body.as_object()
        .ok_or_else(|| StoreError::Internal(format!("{} expects an object", name)))
}

fn count(name: &str, body: &Value) -> StoreResult<usize> {
    body.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| StoreError::Internal(format!("{} expects a non-negative integer", name)))
}

/// Stable multi-key sort; missing values sort as null
pub fn sort(documents: &mut [Value], spec: &Map<String, Value>) {
    documents.sort_by(|a, b| {
        for (key, direction) in spec {
            let x = get(a, key).unwrap_or(Value::Null);
            let y = get(b, key).unwrap_or(Value::Null);
            let mut ordering = compare(&x, &y);
            if direction.as_i64() == Some(-1) {
                ordering = ordering.reverse();
            }
            if ordering.is_ne() {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
}

/// Inclusion projection, or exclusion when every entry is a false flag
pub fn project(document: &Value, spec: &Map<String, Value>) -> StoreResult<Value> {
    if spec.values().all(|v| flag(v) == Some(false)) {
        let mut out = document.as_object().cloned().unwrap_or_default();
        for key in spec.keys() {
            remove(&mut out, key);
        }
        return Ok(Value::Object(out));
    }

    let mut out = Map::new();
    if spec.get("_id").and_then(flag) != Some(false) {
        if let Some(id) = document.get("_id") {
            out.insert("_id".to_string(), id.clone());
        }
    }
    for (key, value) in spec {
        match flag(value) {
            Some(true) => {
                if let Some(found) = get(document, key) {
                    set(&mut out, key, found);
                }
            }
            Some(false) => {}
            None => set(&mut out, key, evaluate(document, value)?),
        }
    }
    Ok(Value::Object(out))
}

fn unwind(documents: Vec<Value>, body: &Value) -> StoreResult<Vec<Value>> {
    let path = match body {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("path").and_then(Value::as_str).unwrap_or_default(),
        _ => "",
    };
    let path = path
        .strip_prefix('$')
        .ok_or_else(|| StoreError::Internal("$unwind expects a $-prefixed path".into()))?;

    let mut out = Vec::new();
    for document in documents {
        match get(&document, path) {
            Some(Value::Array(items)) => {
                for item in items {
                    let mut copy = document.as_object().cloned().unwrap_or_default();
                    set(&mut copy, path, item);
                    out.push(Value::Object(copy));
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => out.push(document),
        }
    }
    Ok(out)
}

fn group(documents: &[Value], spec: &Map<String, Value>) -> StoreResult<Vec<Value>> {
    let id = spec.get("_id").unwrap_or(&Value::Null);

    let mut buckets: Vec<(Value, Vec<&Value>)> = Vec::new();
    for document in documents {
        let key = evaluate(document, id)?;
        match buckets.iter_mut().find(|(k, _)| equal(k, &key)) {
            Some((_, members)) => members.push(document),
            None => buckets.push((key, vec![document])),
        }
    }

    let mut out = Vec::with_capacity(buckets.len());
    for (key, members) in buckets {
        let mut row = Map::new();
        row.insert("_id".to_string(), key);
        for (field, accumulator) in spec.iter().filter(|(k, _)| *k != "_id") {
            let (operator, expression) = accumulator
                .as_object()
                .filter(|m| m.len() == 1)
                .and_then(|m| m.iter().next())
                .ok_or_else(|| StoreError::Internal(format!("invalid accumulator for {}", field)))?;
            let values = members
                .iter()
                .map(|d| evaluate(d, expression))
                .collect::<StoreResult<Vec<_>>>()?;
            row.insert(field.clone(), accumulate(operator, values)?);
        }
        out.push(Value::Object(row));
    }
    Ok(out)
}

fn accumulate(operator: &str, values: Vec<Value>) -> StoreResult<Value> {
    let numbers = || values.iter().filter_map(Value::as_f64);
    Ok(match operator {
        "$sum" => number(numbers().sum()),
        "$avg" => {
            let collected: Vec<f64> = numbers().collect();
            if collected.is_empty() {
                Value::Null
            } else {
                number(collected.iter().sum::<f64>() / collected.len() as f64)
            }
        }
        "$first" => values.first().cloned().unwrap_or(Value::Null),
        "$last" => values.last().cloned().unwrap_or(Value::Null),
        "$min" | "$max" => {
            let mut present = values.iter().filter(|v| !v.is_null());
            let first = present.next().cloned();
            present
                .fold(first, |best, v| match best {
                    Some(b) if (operator == "$min") == compare(v, &b).is_lt() => Some(v.clone()),
                    other => other,
                })
                .unwrap_or(Value::Null)
        }
        "$push" => Value::Array(values),
        "$addToSet" => {
            let mut set: Vec<Value> = Vec::new();
            for value in values {
                if !set.iter().any(|v| equal(v, &value)) {
                    set.push(value);
                }
            }
            Value::Array(set)
        }
        other => return Err(StoreError::Unsupported(format!("accumulator {}", other))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs() -> Vec<Value> {
        vec![
            json!({"_id": 1, "c_site": "a", "c_duration": 10, "c_labels": ["x", "y"]}),
            json!({"_id": 2, "c_site": "b", "c_duration": 5, "c_labels": []}),
            json!({"_id": 3, "c_site": "a", "c_duration": 20, "c_labels": ["x"]}),
        ]
    }

    #[test]
    fn test_group_accumulators() {
        let out = run(
            docs(),
            &[
                json!({"$group": {
                    "_id": "$c_site",
                    "total": {"$sum": "$c_duration"},
                    "avg": {"$avg": "$c_duration"},
                    "longest": {"$max": "$c_duration"},
                    "ids": {"$push": "$_id"}
                }}),
                json!({"$sort": {"total": -1}}),
            ],
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                json!({"_id": "a", "total": 30, "avg": 15, "longest": 20, "ids": [1, 3]}),
                json!({"_id": "b", "total": 5, "avg": 5, "longest": 5, "ids": [2]}),
            ]
        );
    }

    #[test]
    fn test_unwind_then_count() {
        let out = run(docs(), &[json!({"$unwind": "$c_labels"}), json!({"$count": "n"})]).unwrap();
        assert_eq!(out, vec![json!({"n": 3})]);
    }

    #[test]
    fn test_projection_modes() {
        let doc = json!({"_id": 1, "c_site": "a", "idx": {"s1": "a"}, "meta": {}});
        assert_eq!(
            project(&doc, json!({"idx": 0, "meta": 0}).as_object().unwrap()).unwrap(),
            json!({"_id": 1, "c_site": "a"})
        );
        assert_eq!(
            project(&doc, json!({"_id": 0, "site": "$c_site"}).as_object().unwrap()).unwrap(),
            json!({"site": "a"})
        );
    }

    #[test]
    fn test_pagination_stages() {
        let out = run(
            docs(),
            &[json!({"$sort": {"_id": -1}}), json!({"$limit": 2}), json!({"$skip": 1})],
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["_id"], json!(2));
        assert!(run(docs(), &[json!({"$sample": {"size": 1}})]).is_err());
    }
}
