//! Pipeline stages
//!
//! A stage is compiled as soon as it is created, against the shape the
//! documents have at that point. Raw stages (caller selections, hook
//! filters, native passthrough) carry their value through untouched.

use serde_json::{Map, Value};

use super::access::PropertyChecks;
use super::chain::Chain;
use super::consts::{is_field_name, is_field_path, MAX_SKIP};
use super::context::{CompileContext, Shape};
use super::errors::{QueryError, QueryResult};
use super::group::GroupCompiler;
use super::matcher::{MatchCompiler, MatchOptions};
use super::operators::StageName;
use super::rules::{as_integer, normalize_object, validate_field_path};
use super::sort::{normalize_sort, SortCompiler};

#[derive(Debug, Clone, Copy, Default)]
pub struct StageOptions {
    /// Keep the value as given, without compiling it
    pub raw: bool,
    /// Trusted stage: no ACL evaluation
    pub skip_acl: bool,
}

impl StageOptions {
    pub fn raw() -> Self {
        Self {
            raw: true,
            skip_acl: false,
        }
    }

    pub fn trusted() -> Self {
        Self {
            raw: false,
            skip_acl: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    name: StageName,
    body: Value,
    raw: bool,
    skip_acl: bool,
    paths: Vec<String>,
    /// Set on a `$group` keyed by null: the projection stripping its `_id`
    null_id_projection: Option<Map<String, Value>>,
}

impl Stage {
    pub fn create(
        cx: &mut CompileContext,
        name: StageName,
        value: &Value,
        options: StageOptions,
    ) -> QueryResult<Stage> {
        let mut stage = Stage {
            name,
            body: Value::Null,
            raw: options.raw,
            skip_acl: options.skip_acl,
            paths: Vec::new(),
            null_id_projection: None,
        };

        if options.raw || !name.is_core() {
            stage.body = match name {
                StageName::Match | StageName::Project | StageName::Sort => {
                    Value::Object(normalize_object(value, name.as_str())?)
                }
                _ => value.clone(),
            };
            return Ok(stage);
        }

        match name {
            StageName::Match => {
                let object = normalize_object(value, "where")?;
                if !object.is_empty() {
                    let compiled = MatchCompiler::new(
                        cx,
                        MatchOptions {
                            skip_acl: options.skip_acl,
                            ..MatchOptions::default()
                        },
                    )
                    .compile(&Value::Object(object))?;
                    stage.body = Value::Object(compiled.expression);
                    stage.paths = compiled.paths;
                } else {
                    stage.body = Value::Object(Map::new());
                }
            }
            StageName::Sort => {
                if normalize_sort(value)?.is_empty() {
                    stage.body = Value::Object(Map::new());
                } else {
                    let compiled = SortCompiler::new(cx, options.skip_acl).compile(value)?;
                    stage.body = Value::Object(compiled.expression);
                    stage.paths = compiled.paths;
                }
            }
            StageName::Group => {
                let mut compiler = GroupCompiler::new(cx, options.skip_acl);
                let compiled = compiler.compile_group(value)?;
                stage.paths = compiler.into_paths();
                if compiled.null_id {
                    stage.null_id_projection = Some(compiled.null_id_projection());
                }
                cx.set_shape(compiled.shape());
                stage.body = Value::Object(compiled.body);
            }
            StageName::Project => {
                let (body, paths) = compile_project(cx, value, options.skip_acl)?;
                stage.body = Value::Object(body);
                stage.paths = paths;
            }
            StageName::Unwind => {
                let (path, built) = compile_unwind(cx, value, options.skip_acl)?;
                stage.paths = vec![path];
                stage.body = built;
            }
            StageName::Skip => {
                stage.body = compile_count(cx, value, "$skip", 0)?;
            }
            StageName::Limit => {
                stage.body = compile_count(cx, value, "$limit", 1)?;
            }
            _ => stage.body = value.clone(),
        }

        Ok(stage)
    }

    /// A raw `$project` stage
    pub fn raw_project(projection: Map<String, Value>) -> Stage {
        Stage {
            name: StageName::Project,
            body: Value::Object(projection),
            raw: true,
            skip_acl: false,
            paths: Vec::new(),
            null_id_projection: None,
        }
    }

    pub fn name(&self) -> StageName {
        self.name
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Store form, `{"$name": body}`
    pub fn json(&self) -> Value {
        let mut map = Map::new();
        map.insert(self.name.as_str().to_string(), self.body.clone());
        Value::Object(map)
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub fn skip_acl(&self) -> bool {
        self.skip_acl
    }

    pub fn is_null_id_group(&self) -> bool {
        self.null_id_projection.is_some()
    }

    pub fn null_id_projection(&self) -> Option<&Map<String, Value>> {
        self.null_id_projection.as_ref()
    }

    /// Property paths this stage touches
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        match &self.body {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        }
    }

    /// Integer value of a `$skip` or `$limit`; `None` for placeholders
    pub fn count(&self) -> Option<u64> {
        match self.name {
            StageName::Skip | StageName::Limit => as_integer(&self.body).and_then(|n| u64::try_from(n).ok()),
            _ => None,
        }
    }

    /// Cross-stage checks, given whether upstream stages have collapsed the
    /// stream into a single document.
    pub fn validate(&self, single: bool) -> QueryResult<()> {
        if single && matches!(self.name, StageName::Sort | StageName::Skip) && !self.is_empty() {
            return Err(QueryError::invalid_argument(format!(
                "{} cannot be applied to the single result of a group by null.",
                self.name
            ))
            .at(self.name.as_str()));
        }
        Ok(())
    }
}

/// `$skip` takes 0 and up, `$limit` 1 and up
fn compile_count(cx: &mut CompileContext, value: &Value, name: &str, min: i64) -> QueryResult<Value> {
    if cx.variables.check(value, "Number")? {
        return Ok(value.clone());
    }
    let parsed = as_integer(value).or_else(|| value.as_str().and_then(|s| s.trim().parse::<i64>().ok()));
    match parsed {
        Some(n) if n >= min && (name != "$skip" || cx.relax() || n as u64 <= MAX_SKIP) => Ok(Value::from(n)),
        _ if name == "$skip" => Err(QueryError::invalid_argument(format!(
            "$skip must be an integer between 0 and {}, inclusive",
            MAX_SKIP
        ))
        .at(name)),
        _ => Err(QueryError::invalid_argument("$limit must be a positive integer").at(name)),
    }
}

/// Accepts `"c_path"`, `"$c_path"` or `{"path": ...}`
fn compile_unwind(cx: &mut CompileContext, value: &Value, skip_acl: bool) -> QueryResult<(String, Value)> {
    let path = match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            if map.len() != 1 {
                return Err(QueryError::invalid_argument(
                    "Unwinding must consist of a single path component",
                )
                .at("$unwind"));
            }
            match map.get("path").and_then(Value::as_str) {
                Some(s) => s.to_string(),
                None => return Err(QueryError::invalid_argument("Invalid unwind property.").at("$unwind")),
            }
        }
        _ => return Err(QueryError::invalid_argument("Object expected for $unwind expression").at("$unwind")),
    };
    let path = path.strip_prefix('$').unwrap_or(&path).to_string();

    if cx.variables.check(&Value::String(path.clone()), "String")? {
        return Ok((path.clone(), Value::String(path)));
    }
    if !is_field_path(&path) {
        return Err(QueryError::invalid_argument(format!("Invalid $unwind property name: ({})", path)).at("$unwind"));
    }

    if cx.shape().is_derived() {
        if !cx.shape().has_field(&path) {
            return Err(QueryError::invalid_argument(format!(
                "Field is not available at this point of the pipeline ({}).",
                path
            ))
            .at("$unwind"));
        }
        return Ok((path.clone(), Value::String(format!("${}", path))));
    }

    let chain = Chain::new();
    let checks = PropertyChecks::new()
        .trusted(skip_acl)
        .skip_index_check()
        .skip_children()
        .require_array();
    let candidates = cx.process_property(&path, &chain, checks)?;
    for candidate in &candidates {
        let concrete = candidate
            .parents()
            .iter()
            .map(|p| p.as_ref())
            .chain(std::iter::once(candidate.property()))
            .all(|p| !p.is_virtual);
        if !concrete {
            return Err(QueryError::invalid_argument(format!(
                "Unwinding cannot occur on properties not backed by concrete data ({})",
                candidate.full_path()
            ))
            .at("$unwind"));
        }
    }
    let property = cx.single_property(&candidates)?;
    let full_path = property.full_path().to_string();
    cx.set_treat_as_array(full_path.clone(), false);
    Ok((full_path.clone(), Value::String(format!("${}", full_path))))
}

/// Compiles a computed `$project`. Fields are included (`true`/`1`),
/// renamed (`"$path"`), or computed from a group expression; only `_id` may
/// be excluded.
fn compile_project(
    cx: &mut CompileContext,
    value: &Value,
    skip_acl: bool,
) -> QueryResult<(Map<String, Value>, Vec<String>)> {
    let object = match value {
        Value::String(s) if is_field_name(s) => {
            let mut map = Map::new();
            map.insert(s.clone(), Value::Bool(true));
            map
        }
        other => normalize_object(other, "project")?,
    };
    if object.is_empty() {
        return Ok((Map::new(), Vec::new()));
    }

    let chain = Chain::new();
    let mut body = Map::new();
    let mut fields: Vec<String> = Vec::new();
    let mut include_id = true;
    let mut paths: Vec<String> = Vec::new();

    let mut group = GroupCompiler::new(cx, skip_acl);
    for (key, spec) in &object {
        validate_field_path(key, &chain)?;

        let included = match spec {
            Value::Bool(b) => Some(*b),
            Value::Number(_) => match as_integer(spec) {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            _ => None,
        };

        match (included, spec) {
            (Some(false), _) => {
                if key != "_id" {
                    return Err(QueryError::invalid_argument("Only _id may be excluded from a projection.")
                        .at(key.as_str()));
                }
                include_id = false;
                body.insert(key.clone(), Value::from(0));
            }
            (Some(true), _) => {
                group.include(key)?;
                body.insert(key.clone(), Value::from(1));
                fields.push(key.clone());
            }
            (None, Value::String(reference)) => {
                if !is_field_name(key) {
                    return Err(QueryError::invalid_argument(
                        "Top-level projection fields must be plain field names.",
                    )
                    .at(key.as_str()));
                }
                let path = reference.strip_prefix('$').unwrap_or(reference);
                let built = group.field_reference(path, &chain)?;
                body.insert(key.clone(), built);
                fields.push(key.clone());
            }
            (None, Value::Object(_)) => {
                if !is_field_name(key) {
                    return Err(QueryError::invalid_argument(
                        "Top-level projection fields must be plain field names.",
                    )
                    .at(key.as_str()));
                }
                let (built, _) = group.expression(spec, &chain)?;
                body.insert(key.clone(), built);
                fields.push(key.clone());
            }
            _ => {
                return Err(QueryError::invalid_argument(
                    "Projection values must be true, a field reference or an expression.",
                )
                .at(key.as_str()))
            }
        }
    }
    paths.extend(group.into_paths());

    if include_id && !fields.iter().any(|f| f == "_id") {
        fields.insert(0, "_id".to_string());
    }
    let single = matches!(cx.shape(), Shape::Derived { single: true, .. });
    cx.set_shape(Shape::Derived { fields, single });

    Ok((body, paths))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::parser::options::ParserOptions;
    use crate::schema::{AccessContext, AccessLevel, IndexSlot, Model, Principal, Property, PropertyType};

    fn context() -> CompileContext {
        let model = Model::new(
            "c_visit",
            "contexts",
            vec![
                Property::new("c_site", PropertyType::String).indexed(1),
                Property::new("c_duration", PropertyType::Number).indexed(2),
                Property::new("c_labels", PropertyType::String).indexed(3).array(),
            ],
            vec![IndexSlot::new(1, "s1"), IndexSlot::new(2, "s2"), IndexSlot::new(3, "s3")],
        )
        .unwrap();
        CompileContext::new(
            vec![Arc::new(model)],
            AccessContext::new(Principal::anonymous(), AccessLevel::Read),
            ParserOptions::default(),
        )
    }

    #[test]
    fn test_empty_stages() {
        let mut cx = context();
        assert!(Stage::create(&mut cx, StageName::Match, &json!({}), StageOptions::default())
            .unwrap()
            .is_empty());
        assert!(Stage::create(&mut cx, StageName::Sort, &json!("{}"), StageOptions::default())
            .unwrap()
            .is_empty());
        assert!(!Stage::create(&mut cx, StageName::Skip, &json!(0), StageOptions::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_skip_and_limit_bounds() {
        let mut cx = context();
        assert!(Stage::create(&mut cx, StageName::Limit, &json!(0), StageOptions::default()).is_err());
        assert!(Stage::create(&mut cx, StageName::Skip, &json!(-1), StageOptions::default()).is_err());
        assert!(Stage::create(&mut cx, StageName::Skip, &json!(500_001), StageOptions::default()).is_err());
        let limit = Stage::create(&mut cx, StageName::Limit, &json!("5"), StageOptions::default()).unwrap();
        assert_eq!(limit.count(), Some(5));
        assert_eq!(limit.json(), json!({"$limit": 5}));
    }

    #[test]
    fn test_unwind_marks_path_scalar() {
        let mut cx = context();
        let stage = Stage::create(&mut cx, StageName::Unwind, &json!("c_labels"), StageOptions::default()).unwrap();
        assert_eq!(stage.json(), json!({"$unwind": "$c_labels"}));
        assert_eq!(cx.unwound_paths(), vec!["c_labels".to_string()]);
        assert!(Stage::create(&mut cx, StageName::Unwind, &json!("c_site"), StageOptions::default()).is_err());
    }

    #[test]
    fn test_group_shapes_downstream_stages() {
        let mut cx = context();
        let group = Stage::create(
            &mut cx,
            StageName::Group,
            &json!({"_id": "c_site", "total": {"$sum": "c_duration"}}),
            StageOptions::default(),
        )
        .unwrap();
        assert!(!group.is_null_id_group());
        assert_eq!(group.paths(), ["c_site", "c_duration"]);

        let sort = Stage::create(&mut cx, StageName::Sort, &json!({"total": -1}), StageOptions::default()).unwrap();
        assert_eq!(sort.json(), json!({"$sort": {"total": -1}}));
        assert!(Stage::create(&mut cx, StageName::Match, &json!({"c_site": "a"}), StageOptions::default()).is_err());
    }

    #[test]
    fn test_project_derives_fields() {
        let mut cx = context();
        let project = Stage::create(
            &mut cx,
            StageName::Project,
            &json!({"c_site": true, "site": "$c_site", "minutes": {"$divide": ["c_duration", {"$number": 60}]}}),
            StageOptions::default(),
        )
        .unwrap();
        assert_eq!(
            project.json(),
            json!({"$project": {
                "c_site": 1,
                "site": "$c_site",
                "minutes": {"$divide": ["$c_duration", {"$literal": 60}]}
            }})
        );
        assert!(cx.shape().has_field("_id"));
        assert!(cx.shape().has_field("minutes"));
        assert!(!cx.shape().has_field("c_duration"));
    }

    #[test]
    fn test_project_exclusions() {
        let mut cx = context();
        assert!(Stage::create(&mut cx, StageName::Project, &json!({"c_site": 0}), StageOptions::default()).is_err());
        Stage::create(&mut cx, StageName::Project, &json!({"_id": 0, "c_site": 1}), StageOptions::default()).unwrap();
        assert!(!cx.shape().has_field("_id"));
    }

    #[test]
    fn test_sort_or_skip_after_null_group_rejected() {
        let mut cx = context();
        let sort = Stage::create(&mut cx, StageName::Sort, &json!({"_id": 1}), StageOptions::default()).unwrap();
        assert!(sort.validate(false).is_ok());
        assert!(sort.validate(true).is_err());
    }
}
