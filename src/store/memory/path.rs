//! Dotted path access with implicit array traversal

use std::cmp::Ordering;

use serde_json::{Map, Value};

/// Every value reached by `path`. Arrays met before the last segment are
/// traversed element by element.
pub fn resolve<'a>(document: &'a Value, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    walk(document, &segments, &mut out);
    out
}

fn walk<'a>(current: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(current);
        return;
    };
    match current {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                walk(next, rest, out);
            }
        }
        Value::Array(items) => {
            for item in items.iter().filter(|i| i.is_object()) {
                walk(item, segments, out);
            }
        }
        _ => {}
    }
}

/// Expression-style lookup: arrays on the way map to arrays of the
/// sub-values, a missing path is `None`
pub fn get(document: &Value, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    get_segments(document, &segments)
}

fn get_segments(current: &Value, segments: &[&str]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(current.clone());
    };
    match current {
        Value::Object(map) => map.get(*head).and_then(|next| get_segments(next, rest)),
        Value::Array(items) => Some(Value::Array(
            items.iter().filter_map(|item| get_segments(item, segments)).collect(),
        )),
        _ => None,
    }
}

/// `get`, with a missing path read as null
pub fn lookup(document: &Value, path: &str) -> Value {
    get(document, path).unwrap_or(Value::Null)
}

/// Writes `value` at `path`, creating intermediate objects
pub fn set(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                set(child, rest, value);
            }
        }
    }
}

pub fn remove(target: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            target.shift_remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = target.get_mut(head) {
                remove(child, rest);
            }
        }
    }
}

/// Each value, followed by its elements when it is an array
pub fn elements<'a>(values: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        out.push(*value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

/// Integral results stay integers
pub fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order across JSON values: null, numbers, strings, objects, arrays,
/// booleans
pub fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (i, j) in x.iter().zip(y.iter()) {
                let ordering = compare(i, j);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Equality with numbers compared by value
pub fn equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare(a, b) == Ordering::Equal,
        (Value::Array(x), Value::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(i, j)| equal(i, j)),
        _ => a == b,
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_traverses_arrays() {
        let doc = json!({"c_comments": [{"c_body": "a"}, {"c_body": "b"}, {"other": 1}]});
        assert_eq!(resolve(&doc, "c_comments.c_body"), vec![&json!("a"), &json!("b")]);
        assert!(resolve(&doc, "c_missing").is_empty());
        assert_eq!(lookup(&doc, "c_comments.c_body"), json!(["a", "b"]));
        assert_eq!(lookup(&doc, "c_missing.x"), Value::Null);
    }

    #[test]
    fn test_set_and_remove_nested() {
        let mut map = Map::new();
        set(&mut map, "a.b", json!(1));
        set(&mut map, "a.c", json!(2));
        assert_eq!(Value::Object(map.clone()), json!({"a": {"b": 1, "c": 2}}));
        remove(&mut map, "a.b");
        assert_eq!(Value::Object(map), json!({"a": {"c": 2}}));
    }

    #[test]
    fn test_ordering_and_equality() {
        assert_eq!(compare(&json!(1), &json!(1.5)), Ordering::Less);
        assert_eq!(compare(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare(&json!("b"), &json!("a")), Ordering::Greater);
        assert!(equal(&json!(2), &json!(2.0)));
        assert_eq!(number(4.0), json!(4));
        assert_eq!(number(0.5), json!(0.5));
    }
}
