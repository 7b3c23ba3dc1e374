//! Shape rules shared by the stage compilers

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};

use super::chain::Chain;
use super::consts::{is_field_path, MAX_LOGICAL_CONDITIONS, MAX_REGEXP_LENGTH};
use super::errors::{QueryError, QueryResult};

/// Accepts an object or a JSON string encoding one
pub fn normalize_object(value: &Value, what: &str) -> QueryResult<Map<String, Value>> {
    let parsed;
    let value = match value {
        Value::String(s) => {
            parsed = serde_json::from_str::<Value>(s).map_err(|e| {
                QueryError::invalid_argument(format!("Invalid {} JSON format: {}", what, e))
            })?;
            &parsed
        }
        other => other,
    };
    match value {
        Value::Object(map) => Ok(map.clone()),
        _ => Err(QueryError::invalid_argument(format!(
            "Object expected for {} expression",
            what
        ))),
    }
}

/// Dotted paths must have non-empty segments of field characters
pub fn validate_field_path(path: &str, chain: &Chain) -> QueryResult<()> {
    let valid = is_field_path(path) && path.split('.').all(|segment| !segment.is_empty());
    if !valid {
        return Err(QueryError::unsupported(format!("Invalid field name ({}).", path)).at(chain.to_string()));
    }
    Ok(())
}

pub fn is_primitive(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

/// Integral JSON numbers, including floats with no fractional part
pub fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        _ => None,
    }
}

/// An array with at most `max` elements (`None` lifts the bound)
pub fn bounded_array<'a>(
    value: &'a Value,
    operator: &str,
    max: Option<usize>,
    chain: &Chain,
) -> QueryResult<&'a Vec<Value>> {
    let items = value.as_array().ok_or_else(|| {
        QueryError::invalid_argument(format!(
            "Operator {} expects an array of values for property.",
            operator
        ))
        .at(chain.to_string())
    })?;
    if let Some(max) = max {
        if items.len() > max {
            return Err(QueryError::invalid_argument(format!(
                "Operator {} expects an array with between 0 and {} values, inclusive.",
                operator, max
            ))
            .at(chain.to_string()));
        }
    }
    Ok(items)
}

/// `$and`/`$or` values: a non-empty array of objects
pub fn logical_branches<'a>(
    value: &'a Value,
    operator: &str,
    relax: bool,
    chain: &Chain,
) -> QueryResult<Vec<&'a Map<String, Value>>> {
    let items = value.as_array().ok_or_else(|| {
        QueryError::invalid_argument(format!("Operator {} value must be an array.", operator))
            .at(chain.to_string())
    })?;
    if items.is_empty() {
        return Err(QueryError::invalid_argument(format!(
            "Operator {} must contain at least 1 element.",
            operator
        ))
        .at(chain.to_string()));
    }
    if !relax && items.len() > MAX_LOGICAL_CONDITIONS {
        return Err(QueryError::invalid_argument(format!(
            "Maximum {} count ({}) exceeded.",
            operator, MAX_LOGICAL_CONDITIONS
        ))
        .at(chain.to_string()));
    }
    items
        .iter()
        .map(|item| {
            item.as_object().ok_or_else(|| {
                QueryError::invalid_argument(format!("Operator {} elements must be objects.", operator))
                    .at(chain.to_string())
            })
        })
        .collect()
}

/// Compiles a pattern body and its flags. Accepted flags are `i`, `m`, `s`
/// and `x`.
pub fn compile_regex(body: &str, flags: &str) -> Result<Regex, String> {
    let mut builder = RegexBuilder::new(body);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => return Err(format!("unsupported flag '{}'", other)),
        };
    }
    builder.build().map_err(|e| e.to_string())
}

/// Validates a `/body/flags` literal and returns its store form,
/// `{"$regex": body, "$options": flags}`.
pub fn validate_regex(pattern: &Value, relax: bool, chain: &Chain) -> QueryResult<Value> {
    let invalid = |reason: String| QueryError::invalid_argument(reason).at(chain.to_string());

    let text = match pattern {
        Value::String(s) if !s.is_empty() && (relax || s.chars().count() <= MAX_REGEXP_LENGTH) => s,
        _ => {
            return Err(invalid(format!(
                "Pattern ({}) for $regex must be a string between 1 and {} characters.",
                pattern, MAX_REGEXP_LENGTH
            )))
        }
    };

    let (body, flags) = text
        .strip_prefix('/')
        .and_then(|rest| rest.rfind('/').map(|end| (&rest[..end], &rest[end + 1..])))
        .ok_or_else(|| invalid(format!("Invalid operator $regex pattern: {}", text)))?;

    compile_regex(body, flags)
        .map_err(|_| invalid(format!("Invalid operator $regex pattern: {}", text)))?;

    let mut out = Map::new();
    out.insert("$regex".to_string(), Value::String(body.to_string()));
    out.insert("$options".to_string(), Value::String(flags.to_string()));
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_object_from_string() {
        let map = normalize_object(&json!(r#"{"c_a": 1}"#), "where").unwrap();
        assert_eq!(map.get("c_a"), Some(&json!(1)));
        assert!(normalize_object(&json!("[1]"), "where").is_err());
        assert!(normalize_object(&json!("{nope"), "where").is_err());
    }

    #[test]
    fn test_field_path_validation() {
        let chain = Chain::new();
        assert!(validate_field_path("c_doc.c_name", &chain).is_ok());
        assert!(validate_field_path("c_doc..c_name", &chain).is_err());
        assert!(validate_field_path("c_doc.$where", &chain).is_err());
    }

    #[test]
    fn test_regex_literal() {
        let chain = Chain::new();
        assert_eq!(
            validate_regex(&json!("/^ab/i"), false, &chain).unwrap(),
            json!({"$regex": "^ab", "$options": "i"})
        );
        assert!(validate_regex(&json!("^ab"), false, &chain).is_err());
        assert!(validate_regex(&json!("/(/"), false, &chain).is_err());
        assert!(validate_regex(&json!("/a/g"), false, &chain).is_err());
        assert!(validate_regex(&json!(""), false, &chain).is_err());
    }

    #[test]
    fn test_regex_length_is_relaxable() {
        let chain = Chain::new();
        let long = format!("/{}/", "a".repeat(45));
        assert!(validate_regex(&json!(long), false, &chain).is_err());
        assert!(validate_regex(&json!(long), true, &chain).is_ok());
    }

    #[test]
    fn test_logical_branches() {
        let chain = Chain::new();
        assert!(logical_branches(&json!([]), "$and", false, &chain).is_err());
        assert!(logical_branches(&json!([1]), "$and", false, &chain).is_err());
        let many = Value::Array((0..11).map(|i| json!({ "c_a": i })).collect());
        assert!(logical_branches(&many, "$or", false, &chain).is_err());
        assert_eq!(logical_branches(&many, "$or", true, &chain).unwrap().len(), 11);
    }

    #[test]
    fn test_as_integer() {
        assert_eq!(as_integer(&json!(3)), Some(3));
        assert_eq!(as_integer(&json!(3.0)), Some(3));
        assert_eq!(as_integer(&json!(3.5)), None);
        assert_eq!(as_integer(&json!("3")), None);
    }
}
