//! Aggregation expression evaluation

use std::cmp::Ordering;

use chrono::{DateTime, Datelike, Duration, SecondsFormat, Timelike, Utc};
use serde_json::{Map, Value};

use super::path::{compare, equal, lookup, number, truthy};
use crate::store::{StoreError, StoreResult};

pub fn evaluate(document: &Value, expression: &Value) -> StoreResult<Value> {
    match expression {
        Value::String(s) if s.starts_with('$') => Ok(lookup(document, &s[1..])),
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate(document, item))
            .collect::<StoreResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => match map.iter().next() {
            Some((key, argument)) if map.len() == 1 && key.starts_with('$') => operator(document, key, argument),
            _ => {
                let mut out = Map::new();
                for (key, value) in map {
                    out.insert(key.clone(), evaluate(document, value)?);
                }
                Ok(Value::Object(out))
            }
        },
        other => Ok(other.clone()),
    }
}

fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn format_date(date: DateTime<Utc>) -> Value {
    Value::String(date.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn arguments(document: &Value, argument: &Value) -> StoreResult<Vec<Value>> {
    match argument {
        Value::Array(items) => items.iter().map(|item| evaluate(document, item)).collect(),
        other => Ok(vec![evaluate(document, other)?]),
    }
}

fn fixed<const N: usize>(operator: &str, values: Vec<Value>) -> StoreResult<[Value; N]> {
    values
        .try_into()
        .map_err(|_| StoreError::Internal(format!("{} expects {} arguments", operator, N)))
}

fn numeric(operator: &str, value: &Value) -> StoreResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| StoreError::Internal(format!("{} only supports numeric types", operator)))
}

fn array<'a>(operator: &str, value: &'a Value) -> StoreResult<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| StoreError::Internal(format!("{} expects arrays", operator)))
}

fn unique(values: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for value in values {
        if !out.iter().any(|v| equal(v, value)) {
            out.push(value.clone());
        }
    }
    out
}

fn contains(set: &[Value], value: &Value) -> bool {
    set.iter().any(|v| equal(v, value))
}

fn ordering(value: Ordering) -> Value {
    Value::from(match value {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}

fn operator(document: &Value, name: &str, argument: &Value) -> StoreResult<Value> {
    match name {
        "$literal" => Ok(argument.clone()),
        "$ifNull" => {
            let [value, fallback] = fixed(name, arguments(document, argument)?)?;
            Ok(if value.is_null() { fallback } else { value })
        }
        "$cond" => {
            let (condition, then, otherwise) = match argument {
                Value::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
                Value::Object(map) => match (map.get("if"), map.get("then"), map.get("else")) {
                    (Some(c), Some(t), Some(e)) => (c, t, e),
                    _ => return Err(StoreError::Internal("$cond expects if, then and else".into())),
                },
                _ => return Err(StoreError::Internal("$cond expects 3 arguments".into())),
            };
            if truthy(&evaluate(document, condition)?) {
                evaluate(document, then)
            } else {
                evaluate(document, otherwise)
            }
        }
        "$and" => Ok(Value::Bool(arguments(document, argument)?.iter().all(truthy))),
        "$or" => Ok(Value::Bool(arguments(document, argument)?.iter().any(truthy))),
        "$not" => {
            let [value] = fixed(name, arguments(document, argument)?)?;
            Ok(Value::Bool(!truthy(&value)))
        }
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$cmp" => {
            let [a, b] = fixed(name, arguments(document, argument)?)?;
            let order = compare(&a, &b);
            Ok(match name {
                "$eq" => Value::Bool(equal(&a, &b)),
                "$ne" => Value::Bool(!equal(&a, &b)),
                "$gt" => Value::Bool(order.is_gt()),
                "$gte" => Value::Bool(order.is_ge()),
                "$lt" => Value::Bool(order.is_lt()),
                "$lte" => Value::Bool(order.is_le()),
                _ => ordering(order),
            })
        }
        "$add" => {
            let values = arguments(document, argument)?;
            if values.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            let mut date = None;
            let mut sum = 0.0;
            for value in &values {
                match parse_date(value) {
                    Some(d) => date = Some(d),
                    None => sum += numeric(name, value)?,
                }
            }
            Ok(match date {
                Some(d) => format_date(d + Duration::milliseconds(sum as i64)),
                None => number(sum),
            })
        }
        "$subtract" => {
            let [a, b] = fixed(name, arguments(document, argument)?)?;
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            match (parse_date(&a), parse_date(&b)) {
                (Some(x), Some(y)) => Ok(Value::from((x - y).num_milliseconds())),
                (Some(x), None) => Ok(format_date(x - Duration::milliseconds(numeric(name, &b)? as i64))),
                _ => Ok(number(numeric(name, &a)? - numeric(name, &b)?)),
            }
        }
        "$multiply" => {
            let values = arguments(document, argument)?;
            if values.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            let mut product = 1.0;
            for value in &values {
                product *= numeric(name, value)?;
            }
            Ok(number(product))
        }
        "$divide" | "$mod" => {
            let [a, b] = fixed(name, arguments(document, argument)?)?;
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let (x, y) = (numeric(name, &a)?, numeric(name, &b)?);
            if y == 0.0 {
                return Err(StoreError::Internal(format!("{} by zero", name)));
            }
            Ok(number(if name == "$divide" { x / y } else { x % y }))
        }
        "$concat" => {
            let values = arguments(document, argument)?;
            let mut out = String::new();
            for value in &values {
                match value {
                    Value::Null => return Ok(Value::Null),
                    Value::String(s) => out.push_str(s),
                    _ => return Err(StoreError::Internal("$concat only supports strings".into())),
                }
            }
            Ok(Value::String(out))
        }
        "$substr" => {
            let [s, start, length] = fixed(name, arguments(document, argument)?)?;
            let s = s.as_str().unwrap_or_default();
            let start = start.as_i64().unwrap_or(0).max(0) as usize;
            let taken: String = match length.as_i64() {
                Some(n) if n >= 0 => s.chars().skip(start).take(n as usize).collect(),
                _ => s.chars().skip(start).collect(),
            };
            Ok(Value::String(taken))
        }
        "$toLower" | "$toUpper" => {
            let [value] = fixed(name, arguments(document, argument)?)?;
            let s = value.as_str().unwrap_or_default();
            Ok(Value::String(if name == "$toLower" {
                s.to_lowercase()
            } else {
                s.to_uppercase()
            }))
        }
        "$strcasecmp" => {
            let [a, b] = fixed(name, arguments(document, argument)?)?;
            let a = a.as_str().unwrap_or_default().to_lowercase();
            let b = b.as_str().unwrap_or_default().to_lowercase();
            Ok(ordering(a.cmp(&b)))
        }
        "$size" => {
            let [value] = fixed(name, arguments(document, argument)?)?;
            Ok(Value::from(array(name, &value)?.len()))
        }
        "$setEquals" | "$setIsSubset" | "$setDifference" => {
            let [a, b] = fixed(name, arguments(document, argument)?)?;
            let (a, b) = (unique(array(name, &a)?), unique(array(name, &b)?));
            Ok(match name {
                "$setEquals" => Value::Bool(a.len() == b.len() && a.iter().all(|v| contains(&b, v))),
                "$setIsSubset" => Value::Bool(a.iter().all(|v| contains(&b, v))),
                _ => Value::Array(a.into_iter().filter(|v| !contains(&b, v)).collect()),
            })
        }
        "$setUnion" | "$setIntersection" => {
            let sets = arguments(document, argument)?;
            let mut result: Option<Vec<Value>> = None;
            for set in &sets {
                let items = unique(array(name, set)?);
                result = Some(match result {
                    None => items,
                    Some(acc) if name == "$setUnion" => unique(&[acc, items].concat()),
                    Some(acc) => acc.into_iter().filter(|v| contains(&items, v)).collect(),
                });
            }
            Ok(Value::Array(result.unwrap_or_default()))
        }
        "$anyElementTrue" | "$allElementsTrue" => {
            let [value] = fixed(name, arguments(document, argument)?)?;
            let items = array(name, &value)?;
            Ok(Value::Bool(if name == "$anyElementTrue" {
                items.iter().any(truthy)
            } else {
                items.iter().all(truthy)
            }))
        }
        "$year" | "$month" | "$week" | "$dayOfYear" | "$dayOfMonth" | "$dayOfWeek" | "$hour" | "$minute"
        | "$second" | "$millisecond" => {
            let [value] = fixed(name, arguments(document, argument)?)?;
            let date = parse_date(&value)
                .ok_or_else(|| StoreError::Internal(format!("{} expects a date", name)))?;
            let part = match name {
                "$year" => i64::from(date.year()),
                "$month" => i64::from(date.month()),
                "$week" => date.format("%U").to_string().parse::<i64>().unwrap_or(0),
                "$dayOfYear" => i64::from(date.ordinal()),
                "$dayOfMonth" => i64::from(date.day()),
                "$dayOfWeek" => i64::from(date.weekday().number_from_sunday()),
                "$hour" => i64::from(date.hour()),
                "$minute" => i64::from(date.minute()),
                "$second" => i64::from(date.second()),
                _ => i64::from(date.timestamp_subsec_millis()),
            };
            Ok(Value::from(part))
        }
        other => Err(StoreError::Unsupported(format!("expression operator {}", other))),
    }
}
