//! Parser orchestrator
//!
//! A `Parser` compiles one query exactly once into a stage pipeline, then
//! executes it as often as the caller likes (see `exec`). Two input forms
//! are accepted: the legacy `where`/`map`/`group`/`sort` options, or a
//! declarative `pipeline` (or `nativePipeline`) of stages.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::observability::Event;
use crate::schema::{AccessContext, AccessLevel, Model};

use super::consts::{is_field_path, MAX_SKIP, MAX_STAGES};
use super::context::CompileContext;
use super::errors::{QueryError, QueryResult};
use super::exec::batch_key;
use super::hooks::{ExecHook, HookRegistry};
use super::operators::StageName;
use super::options::ParserOptions;
use super::pipeline::{optimize, Pipeline, RawStage};
use super::rules::{as_integer, is_primitive};
use super::stage::{Stage, StageOptions};
use super::variables::{VariableContext, VariableInfo};

/// Caller query, as received over the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuerySpec {
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_pipeline: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<Value>,
    /// A positive integer, or `false` for no limit where permitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starting_after: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ending_before: Option<Value>,
    /// Trusted filter, compiled without ACL checks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_match: Option<Value>,
    /// Trusted sort, compiled without ACL checks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_sort: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<bool>,
}

impl QuerySpec {
    fn has_legacy_clauses(&self) -> bool {
        self.where_.is_some() || self.map.is_some() || self.group.is_some() || self.sort.is_some()
    }
}

/// The limit requested through options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitOption {
    /// Not given; the configured default applies
    #[default]
    Default,
    /// `limit: false` with `allow_no_limit`
    Unlimited,
    Count(u64),
}

/// Runs the compiled plan once per value, with `field` pinned to it
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub field: String,
    pub values: Vec<Value>,
}

#[derive(Debug)]
pub struct Parser {
    pub(super) cx: CompileContext,
    pub(super) stages: Pipeline<Stage>,
    pub(super) hooks: HookRegistry,
    pub(super) base_filter: Option<Map<String, Value>>,
    pub(super) skip: u64,
    pub(super) limit: LimitOption,
    pub(super) reverse: bool,
    pub(super) total: bool,
    pub(super) native: bool,
    pub(super) batch: Option<Batch>,
    parsed: bool,
}

impl Parser {
    /// Creates a parser over models sharing one collection
    pub fn new(models: Vec<Arc<Model>>, ac: AccessContext, options: ParserOptions) -> QueryResult<Self> {
        let Some(first) = models.first() else {
            return Err(QueryError::invalid_argument("At least one model is required."));
        };
        if models.iter().any(|m| m.collection() != first.collection()) {
            return Err(QueryError::invalid_argument(
                "Queried models must share the same collection.",
            ));
        }
        let total = options.total;
        Ok(Self {
            cx: CompileContext::new(models, ac, options),
            stages: Pipeline::new(),
            hooks: HookRegistry::new(),
            base_filter: None,
            skip: 0,
            limit: LimitOption::Default,
            reverse: false,
            total,
            native: false,
            batch: None,
            parsed: false,
        })
    }

    pub fn options(&self) -> &ParserOptions {
        self.cx.options()
    }

    pub fn collection(&self) -> &str {
        self.cx.models().first().map(|m| m.collection()).unwrap_or_default()
    }

    /// Access level the caller must hold for the plan to run
    pub fn access_level(&self) -> AccessLevel {
        self.cx.access_level()
    }

    pub fn is_parsed(&self) -> bool {
        self.parsed
    }

    pub fn is_reversed(&self) -> bool {
        self.reverse
    }

    pub fn is_native(&self) -> bool {
        self.native
    }

    pub fn base_filter(&self) -> Option<&Map<String, Value>> {
        self.base_filter.as_ref()
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> + '_ {
        self.stages.iter()
    }

    /// Store form of the compiled stages
    pub fn pipeline_json(&self) -> Vec<Value> {
        self.stages.iter().map(Stage::json).collect()
    }

    /// Property paths touched by the compiled stages, deduplicated
    pub fn property_paths(&self) -> Vec<String> {
        let paths: BTreeSet<&String> = self.stages.iter().flat_map(|s| s.paths()).collect();
        paths.into_iter().cloned().collect()
    }

    /// Placeholders collected for a query section in variable mode
    pub fn get_variables(&self, context: VariableContext) -> Vec<VariableInfo> {
        self.cx.variables.get(context)
    }

    pub fn has_variables(&self) -> bool {
        self.cx.variables.is_enabled()
    }

    /// Registers a lifecycle hook; only `exec` is known
    pub fn hook(&mut self, name: &str, hook: Arc<dyn ExecHook>) -> QueryResult<()> {
        self.hooks.register(name, hook)
    }

    /// Runs subsequent executions once per value. An empty field clears it.
    pub fn set_batch(&mut self, field: &str, values: Vec<Value>) -> QueryResult<()> {
        if field.is_empty() {
            self.batch = None;
            return Ok(());
        }
        if !is_field_path(field) {
            return Err(QueryError::invalid_argument(format!("Invalid batch field ({}).", field)));
        }
        if values.iter().any(|v| !is_primitive(v) || v.is_null()) {
            return Err(QueryError::invalid_argument("Batch values must be primitives."));
        }
        // results are keyed by value, so `1` and `"1"` would share an entry
        let mut keys = BTreeSet::new();
        if !values.iter().all(|v| keys.insert(batch_key(v))) {
            return Err(QueryError::invalid_argument("Batch values must be unique."));
        }
        self.batch = Some(Batch {
            field: field.to_string(),
            values,
        });
        Ok(())
    }

    pub fn is_batch(&self) -> bool {
        self.batch.is_some()
    }

    /// Compiles the query. May only be called once per parser.
    pub fn parse(
        &mut self,
        spec: &QuerySpec,
        projection: Option<Map<String, Value>>,
        base_filter: Option<Map<String, Value>>,
    ) -> QueryResult<()> {
        if self.parsed {
            return Err(QueryError::invalid_argument("Query parser called multiple times."));
        }
        self.parsed = true;
        self.base_filter = base_filter.filter(|f| !f.is_empty());
        if let Some(total) = spec.total {
            self.total = total;
        }

        self.skip = parse_skip_option(spec.skip.as_ref(), self.cx.relax())?;
        self.limit = parse_limit_option(spec.limit.as_ref(), self.cx.options().allow_no_limit)?;

        if spec.pipeline.is_some() || spec.native_pipeline.is_some() {
            self.parse_pipeline(spec)?;
        } else {
            self.parse_legacy(spec)?;
        }

        if let Some(projection) = projection.filter(|p| !p.is_empty()) {
            self.insert_selection(projection);
        }
        self.validate()?;

        let stages = self.stages.len().to_string();
        let level = self.access_level();
        Event::QueryParsed.emit(&[
            ("collection", self.collection()),
            ("mode", if self.can_be_called_as_query() { "query" } else { "aggregate" }),
            ("stages", &stages),
            ("access_level", level.as_str()),
        ]);
        Ok(())
    }

    fn compile_stage(&mut self, name: StageName, value: &Value, options: StageOptions) -> QueryResult<Stage> {
        Stage::create(&mut self.cx, name, value, options)
    }

    /// Pushes a stage, followed by the `_id` removal of a null-keyed group
    fn push_stage(&mut self, stage: Stage) {
        let strip = stage.null_id_projection().cloned();
        self.stages.push_back(stage);
        if let Some(projection) = strip {
            self.stages.push_back(Stage::raw_project(projection));
        }
    }

    fn parse_trusted(&mut self, spec: &QuerySpec) -> QueryResult<()> {
        if let Some(pre_match) = &spec.pre_match {
            let stage = self.compile_stage(StageName::Match, pre_match, StageOptions::trusted())?;
            if !stage.is_empty() {
                self.push_stage(stage);
            }
        }
        if let Some(pre_sort) = &spec.pre_sort {
            let stage = self.compile_stage(StageName::Sort, pre_sort, StageOptions::trusted())?;
            if !stage.is_empty() {
                self.push_stage(stage);
            }
        }
        Ok(())
    }

    fn parse_pipeline(&mut self, spec: &QuerySpec) -> QueryResult<()> {
        if spec.has_legacy_clauses() || spec.starting_after.is_some() || spec.ending_before.is_some() {
            return Err(QueryError::invalid_argument(
                "startingAfter, endingBefore, where, map, group and sort are incompatible with pipeline.",
            ));
        }
        let (source, native) = match (&spec.pipeline, &spec.native_pipeline) {
            (_, Some(native)) => (native, true),
            (Some(pipeline), None) => (pipeline, false),
            (None, None) => return Ok(()),
        };
        self.native = native;

        let entries = match source {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Array(entries)) => entries,
                Ok(_) => return Err(QueryError::invalid_argument("Array expected for pipeline")),
                Err(e) => {
                    return Err(QueryError::invalid_argument(format!("Invalid pipeline JSON format: {}", e)))
                }
            },
            Value::Array(entries) => entries.clone(),
            _ => return Err(QueryError::invalid_argument("Array expected for pipeline")),
        };
        if !self.cx.relax() && entries.len() > MAX_STAGES {
            return Err(QueryError::invalid_argument(format!(
                "Invalid pipeline. Maximum stages ({}) exceeded",
                MAX_STAGES
            )));
        }

        self.parse_trusted(spec)?;

        let mut raw = Pipeline::new();
        for (index, entry) in entries.iter().enumerate() {
            raw.push_back(raw_stage(entry, index, native)?);
        }
        optimize(&mut raw);

        self.cx.variables.enter(VariableContext::Pipeline);
        for (index, pending) in raw.into_vec().into_iter().enumerate() {
            let stage = self.compile_stage(pending.name, &pending.value, StageOptions::default())?;
            if stage.is_empty() {
                return Err(QueryError::invalid_argument(format!(
                    "Empty {} pipeline stage ({})",
                    pending.name, index
                )));
            }
            self.push_stage(stage);
        }
        self.cx.variables.leave();
        Ok(())
    }

    fn parse_legacy(&mut self, spec: &QuerySpec) -> QueryResult<()> {
        let paging = spec.starting_after.is_some() || spec.ending_before.is_some();
        if paging && spec.has_legacy_clauses() {
            return Err(QueryError::invalid_argument(
                "startingAfter/endingBefore is incompatible with where, map, group, sort and streaming cursors.",
            ));
        }

        let mut where_ = spec.where_.clone();
        let mut sort = spec.sort.clone();
        let anchor = spec
            .starting_after
            .as_ref()
            .filter(|v| !v.is_null())
            .map(|v| (v, false))
            .or_else(|| spec.ending_before.as_ref().filter(|v| !v.is_null()).map(|v| (v, true)));
        if let Some((id, reverse)) = anchor {
            self.reverse = reverse;
            let operator = if reverse { "$gt" } else { "$lt" };
            let mut range = Map::new();
            range.insert(operator.to_string(), id.clone());
            let mut filter = Map::new();
            filter.insert("_id".to_string(), Value::Object(range));
            where_ = Some(Value::Object(filter));

            let mut order = Map::new();
            order.insert("_id".to_string(), Value::from(if reverse { 1 } else { -1 }));
            sort = Some(Value::Object(order));
        }

        self.parse_trusted(spec)?;

        if let Some(where_) = &where_ {
            self.cx.variables.enter(VariableContext::Where);
            let stage = self.compile_stage(StageName::Match, where_, StageOptions::default())?;
            self.cx.variables.leave();
            if !stage.is_empty() {
                self.push_stage(stage);
            }
        }

        if let Some(map) = &spec.map {
            self.cx.variables.enter(VariableContext::Map);
            self.parse_map(map)?;
            self.cx.variables.leave();
        }

        let mut grouped = false;
        if let Some(group) = &spec.group {
            self.cx.variables.enter(VariableContext::Group);
            let stage = self.compile_stage(StageName::Group, group, StageOptions::default())?;
            self.cx.variables.leave();
            if !stage.is_empty() {
                grouped = true;
                self.push_stage(stage);
            }
        }

        let default_sort = self.cx.options().default_sort;
        if sort.is_none() && !grouped && default_sort != 0 {
            let mut order = Map::new();
            order.insert("_id".to_string(), Value::from(default_sort.signum()));
            sort = Some(Value::Object(order));
        }
        if let Some(sort) = &sort {
            self.cx.variables.enter(VariableContext::Sort);
            let stage = self.compile_stage(StageName::Sort, sort, StageOptions::default())?;
            self.cx.variables.leave();
            if !stage.is_empty() {
                self.push_stage(stage);
            }
        }
        Ok(())
    }

    /// `map` unwinds one array property and optionally filters its elements
    fn parse_map(&mut self, map: &Value) -> QueryResult<()> {
        let map = match map {
            Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => {
                let mut object = Map::new();
                object.insert(s.clone(), Value::Null);
                object
            }
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(object)) => object,
                Ok(_) => return Err(QueryError::invalid_argument("Object expected for map component")),
                Err(e) => return Err(QueryError::invalid_argument(format!("Invalid map JSON format: {}", e))),
            },
            Value::Object(object) => object.clone(),
            _ => return Err(QueryError::invalid_argument("Object expected for map component")),
        };

        let mut entries = map.into_iter();
        let (Some((path, filter)), None) = (entries.next(), entries.next()) else {
            return Err(QueryError::invalid_argument("Map component requires a single field"));
        };
        if !is_field_path(&path) || path.split('.').any(str::is_empty) {
            return Err(QueryError::invalid_argument(format!("Invalid field name: ({})", path)));
        }

        let unwind = self.compile_stage(StageName::Unwind, &Value::String(path.clone()), StageOptions::default())?;
        self.push_stage(unwind);

        if filter.is_null() {
            return Ok(());
        }
        let Value::Object(filter) = filter else {
            return Err(QueryError::invalid_argument("A mapped document array expression must be an object.").at(path));
        };
        let prefixed: Map<String, Value> = filter
            .into_iter()
            .map(|(key, value)| {
                if key.starts_with('$') {
                    (key, value)
                } else {
                    (format!("{}.{}", path, key), value)
                }
            })
            .collect();
        let stage = self.compile_stage(StageName::Match, &Value::Object(prefixed), StageOptions::default())?;
        if stage.is_empty() {
            return Err(QueryError::invalid_argument(
                "The where expression from a map existed but resolved to nothing.",
            )
            .at(path));
        }
        self.push_stage(stage);
        Ok(())
    }

    /// Inserts the caller's selection after the leading match and sort
    /// stages, unless a stage already shapes the output.
    fn insert_selection(&mut self, projection: Map<String, Value>) {
        let shaped = self
            .stages
            .iter()
            .any(|s| matches!(s.name(), StageName::Group | StageName::Project | StageName::AddFields));
        if shaped {
            return;
        }
        let mut anchor = None;
        let mut cursor = self.stages.first();
        while let Some(id) = cursor {
            match self.stages.get(id).map(Stage::name) {
                Some(StageName::Match | StageName::Sort) => anchor = Some(id),
                _ => break,
            }
            cursor = self.stages.next(id);
        }
        let stage = Stage::raw_project(projection);
        match anchor {
            Some(id) => {
                self.stages.insert_after(id, stage);
            }
            None => {
                self.stages.push_back(stage);
            }
        }
    }

    /// Checks that depend on neighbouring stages
    fn validate(&self) -> QueryResult<()> {
        let mut single = false;
        for stage in self.stages.iter() {
            stage.validate(single)?;
            match stage.name() {
                StageName::Group => single = stage.is_null_id_group(),
                StageName::Unwind => single = false,
                _ => {}
            }
        }
        Ok(())
    }

    /// True when the plan is expressible as a plain find: filters and one
    /// sort up front, then only pagination and raw projections.
    pub fn can_be_called_as_query(&self) -> bool {
        if self.native {
            return false;
        }
        let mut filtering = true;
        let mut sorts = 0;
        for stage in self.stages.iter() {
            match stage.name() {
                StageName::Match | StageName::Sort if filtering => {
                    if stage.name() == StageName::Sort && !stage.is_empty() {
                        sorts += 1;
                    }
                }
                StageName::Skip | StageName::Limit if stage.count().is_some() => filtering = false,
                StageName::Project | StageName::AddFields if stage.is_raw() => filtering = false,
                _ => return false,
            }
        }
        sorts <= 1
    }
}

fn raw_stage(entry: &Value, index: usize, native: bool) -> QueryResult<RawStage> {
    let parsed;
    let entry = match entry {
        Value::String(s) => {
            parsed = serde_json::from_str::<Value>(s).map_err(|e| {
                QueryError::invalid_argument(format!("Invalid pipeline stage ({}) JSON format: {}", index, e))
            })?;
            &parsed
        }
        other => other,
    };
    let Value::Object(object) = entry else {
        return Err(QueryError::invalid_argument(format!(
            "Object expected for pipeline stage ({})",
            index
        )));
    };
    let mut keys = object.iter();
    let (Some((key, value)), None) = (keys.next(), keys.next()) else {
        return Err(QueryError::invalid_argument(format!(
            "Pipeline stage ({}) requires a single key",
            index
        )));
    };
    match StageName::parse(key) {
        Some(name) if native || name.is_core() => Ok(RawStage::new(name, value.clone())),
        _ => Err(QueryError::invalid_argument(format!(
            "\"{}\" is not a valid pipeline stage.",
            key
        ))),
    }
}

pub(super) fn parse_skip_option(value: Option<&Value>, relax: bool) -> QueryResult<u64> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(0);
    };
    let parsed = as_integer(value).or_else(|| value.as_str().and_then(|s| s.trim().parse::<i64>().ok()));
    match parsed.and_then(|n| u64::try_from(n).ok()) {
        Some(n) if relax || n <= MAX_SKIP => Ok(n),
        _ => Err(QueryError::invalid_argument(format!(
            "skip option must be an integer between 0 and {}, inclusive",
            MAX_SKIP
        ))
        .at("skip")),
    }
}

fn parse_limit_option(value: Option<&Value>, allow_no_limit: bool) -> QueryResult<LimitOption> {
    match value {
        None | Some(Value::Null) => Ok(LimitOption::Default),
        Some(Value::Bool(false)) if allow_no_limit => Ok(LimitOption::Unlimited),
        Some(Value::Bool(false)) => Ok(LimitOption::Default),
        Some(value) => {
            let parsed = as_integer(value).or_else(|| value.as_str().and_then(|s| s.trim().parse::<i64>().ok()));
            match parsed {
                Some(n) if n >= 1 => Ok(LimitOption::Count(n as u64)),
                _ => Err(QueryError::invalid_argument("limit option must be a positive integer").at("limit")),
            }
        }
    }
}
