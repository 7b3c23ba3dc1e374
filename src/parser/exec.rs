//! Plan execution
//!
//! Every call builds a fresh reader from the compiled stages: a plain find
//! when the plan allows it, an aggregation otherwise. Whenever a limit
//! applies the store is asked for one row past it so `has_more` needs no
//! second query.

use std::collections::BTreeMap;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::observability::{Event, Timer};
use crate::schema::AccessLevel;
use crate::store::{collect, AggregatePlan, DocumentStore, FindPlan, StoreError, VecCursor};

use super::consts::{BATCH_LIMIT, CULLED_FIELDS, MAX_LIMIT, MAX_SKIP};
use super::cursor::QueryCursor;
use super::errors::{QueryError, QueryResult};
use super::hooks::{BeforeExec, ExecSummary};
use super::operators::StageName;
use super::parser::{parse_skip_option, Batch, LimitOption, Parser};
use super::rules::as_integer;
use super::stage::Stage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Stream results instead of materializing them
    pub cursor: bool,
    pub max_time_ms: Option<u64>,
    /// Describe the plan without running it
    pub explain: bool,
}

impl ExecOptions {
    pub fn cursor() -> Self {
        Self {
            cursor: true,
            ..Self::default()
        }
    }

    pub fn explain() -> Self {
        Self {
            explain: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    Query,
    Aggregate,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Query => "query",
            ExecMode::Aggregate => "aggregate",
        }
    }
}

/// Skip and limit composed in stage order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub skip: u64,
    pub limit: Option<u64>,
}

impl Window {
    /// Skipping after a limit eats into it
    pub fn apply_skip(&mut self, n: u64) {
        self.skip = self.skip.saturating_add(n);
        if let Some(limit) = self.limit.as_mut() {
            *limit = limit.saturating_sub(n);
        }
    }

    pub fn apply_limit(&mut self, n: u64) {
        self.limit = Some(self.limit.map_or(n, |limit| limit.min(n)));
    }
}

/// Totals query run after the primary read
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Totals {
    Count(FindPlan),
    Pipeline(AggregatePlan),
}

/// One execution plan, built fresh for every call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reader {
    pub mode: ExecMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub find: Option<FindPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregatePlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totals: Option<Totals>,
    /// Rows the caller gets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// One extra row is requested to detect further results
    pub peek: bool,
}

impl Reader {
    /// Limit handed to the store
    fn store_limit(limit: Option<u64>, peek: bool) -> Option<u64> {
        limit.map(|l| if peek { l + 1 } else { l })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    object: &'static str,
    pub data: Vec<Value>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl ListResult {
    pub fn new(data: Vec<Value>, has_more: bool, total: Option<u64>) -> Self {
        Self {
            object: "list",
            data,
            has_more,
            total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Explain {
    pub collection: String,
    pub access_level: AccessLevel,
    pub reader: Reader,
}

#[derive(Debug)]
pub enum ExecOutput {
    List(ListResult),
    /// Batched results keyed by value
    Map(BTreeMap<String, ListResult>),
    Cursor(QueryCursor),
    Explain(Explain),
}

impl ExecOutput {
    pub fn into_list(self) -> Option<ListResult> {
        match self {
            ExecOutput::List(list) => Some(list),
            _ => None,
        }
    }

    /// JSON form; a cursor has none
    pub fn to_json(&self) -> Option<Value> {
        match self {
            ExecOutput::List(list) => serde_json::to_value(list).ok(),
            ExecOutput::Map(map) => {
                let mut data = Map::new();
                for (key, list) in map {
                    data.insert(key.clone(), serde_json::to_value(list).ok()?);
                }
                Some(json!({"object": "map", "data": data}))
            }
            ExecOutput::Explain(explain) => serde_json::to_value(explain).ok(),
            ExecOutput::Cursor(_) => None,
        }
    }

    fn summary_count(&self) -> Option<(usize, bool, Option<u64>)> {
        match self {
            ExecOutput::List(list) => Some((list.data.len(), list.has_more, list.total)),
            ExecOutput::Map(map) => Some((
                map.values().map(|l| l.data.len()).sum(),
                map.values().any(|l| l.has_more),
                None,
            )),
            _ => None,
        }
    }
}

/// Key of a batch entry in the result map
pub fn batch_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Combines filters under `$and`, dropping empty ones
fn merge_filters(filters: Vec<Map<String, Value>>) -> Map<String, Value> {
    let mut filters: Vec<Map<String, Value>> = filters.into_iter().filter(|f| !f.is_empty()).collect();
    match filters.len() {
        0 => Map::new(),
        1 => filters.remove(0),
        _ => {
            let mut merged = Map::new();
            merged.insert(
                "$and".to_string(),
                Value::Array(filters.into_iter().map(Value::Object).collect()),
            );
            merged
        }
    }
}

fn pinned(field: &str, value: &Value) -> Map<String, Value> {
    let mut filter = Map::new();
    filter.insert(field.to_string(), value.clone());
    filter
}

fn is_tail_stage(stage: &Stage) -> bool {
    match stage.name() {
        StageName::Skip | StageName::Limit => stage.count().is_some(),
        StageName::Project => stage.is_raw(),
        _ => false,
    }
}

impl Parser {
    /// Runs the plan. Store errors are passed through; totals are best
    /// effort.
    pub async fn exec(&self, store: &dyn DocumentStore, options: ExecOptions) -> QueryResult<ExecOutput> {
        let timer = Timer::start();
        let mode = if self.can_be_called_as_query() {
            ExecMode::Query
        } else {
            ExecMode::Aggregate
        };
        let result = self.run(store, &options, mode).await;

        match &result {
            Ok(output) => {
                if let Some((count, has_more, total)) = output.summary_count() {
                    self.hooks.fire_after(
                        "exec",
                        &ExecSummary {
                            mode: mode.as_str(),
                            count,
                            has_more,
                            total,
                            elapsed_ms: timer.elapsed_ms(),
                        },
                    );
                }
            }
            Err(e) => self.hooks.fire_fail("exec", e),
        }

        let threshold = self.cx.options().slow_query_threshold_ms;
        if timer.exceeded(threshold) {
            let elapsed = timer.elapsed_ms().to_string();
            let timed_out = matches!(
                result.as_ref().err().and_then(QueryError::store_error),
                Some(StoreError::Timeout(_))
            );
            Event::QuerySlow.emit(&[
                ("collection", self.collection()),
                ("elapsed_ms", &elapsed),
                ("mode", mode.as_str()),
                ("timed_out", if timed_out { "true" } else { "false" }),
            ]);
        }
        result
    }

    fn check_executable(&self) -> QueryResult<()> {
        if !self.is_parsed() {
            return Err(QueryError::invalid_argument("Query has not been parsed."));
        }
        if self.cx.options().with_variables {
            return Err(QueryError::unsupported("Cannot execute query containing variables."));
        }
        Ok(())
    }

    async fn run(&self, store: &dyn DocumentStore, options: &ExecOptions, mode: ExecMode) -> QueryResult<ExecOutput> {
        self.check_executable()?;

        let mut before = BeforeExec::new();
        self.hooks.fire_before("exec", &mut before)?;

        if self.native && !(options.cursor || options.explain) {
            return Err(QueryError::unsupported("Native pipelines currently only support cursors."));
        }
        if options.cursor && self.batch.is_some() {
            return Err(QueryError::unsupported("Cannot return a cursor for batched operations"));
        }
        if options.cursor && self.reverse {
            return Err(QueryError::unsupported(
                "startingAfter/endingBefore is incompatible with streaming cursors.",
            ));
        }

        if options.explain {
            let reader = self.reader(options, mode, before.matches(), None)?;
            return Ok(ExecOutput::Explain(Explain {
                collection: self.collection().to_string(),
                access_level: self.access_level(),
                reader,
            }));
        }

        if let Some(batch) = &self.batch {
            return self
                .exec_batch(store, options, mode, before.matches(), batch)
                .await
                .map(ExecOutput::Map);
        }

        let reader = self.reader(options, mode, before.matches(), None)?;
        if options.cursor {
            if reader.limit == Some(0) {
                return Ok(ExecOutput::Cursor(QueryCursor::new(Box::new(VecCursor::default()), Some(0))));
            }
            let inner = match (&reader.find, &reader.aggregate) {
                (Some(find), _) => store.find(find).await?,
                (None, Some(aggregate)) => store.aggregate(aggregate).await?,
                (None, None) => return Err(QueryError::invalid_argument("Empty execution plan.")),
            };
            return Ok(ExecOutput::Cursor(QueryCursor::new(inner, reader.limit.filter(|_| reader.peek))));
        }
        self.read_list(store, &reader).await.map(ExecOutput::List)
    }

    /// Runs the plan once per batch value, at most `BATCH_LIMIT` at a time.
    /// The first failure aborts the whole batch.
    async fn exec_batch(
        &self,
        store: &dyn DocumentStore,
        options: &ExecOptions,
        mode: ExecMode,
        matches: &[Map<String, Value>],
        batch: &Batch,
    ) -> QueryResult<BTreeMap<String, ListResult>> {
        let mut results = BTreeMap::new();
        let mut pending = batch.values.iter();
        let mut running = FuturesUnordered::new();

        for value in pending.by_ref().take(BATCH_LIMIT) {
            running.push(self.read_batch_entry(store, options, mode, matches, &batch.field, value));
        }
        while let Some((key, result)) = running.next().await {
            match result {
                Ok(list) => {
                    results.insert(key, list);
                }
                Err(e) => {
                    Event::QueryBatchFailed.emit(&[
                        ("collection", self.collection()),
                        ("field", &batch.field),
                        ("value", &key),
                        ("error", e.message()),
                    ]);
                    return Err(e);
                }
            }
            if let Some(value) = pending.next() {
                running.push(self.read_batch_entry(store, options, mode, matches, &batch.field, value));
            }
        }
        Ok(results)
    }

    async fn read_batch_entry(
        &self,
        store: &dyn DocumentStore,
        options: &ExecOptions,
        mode: ExecMode,
        matches: &[Map<String, Value>],
        field: &str,
        value: &Value,
    ) -> (String, QueryResult<ListResult>) {
        let key = batch_key(value);
        let result = match self.reader(options, mode, matches, Some((field, value))) {
            Ok(reader) => self.read_list(store, &reader).await,
            Err(e) => Err(e),
        };
        (key, result)
    }

    async fn read_list(&self, store: &dyn DocumentStore, reader: &Reader) -> QueryResult<ListResult> {
        let mut data = if reader.limit == Some(0) {
            Vec::new()
        } else {
            let mut cursor = match (&reader.find, &reader.aggregate) {
                (Some(find), _) => store.find(find).await?,
                (None, Some(aggregate)) => store.aggregate(aggregate).await?,
                (None, None) => return Err(QueryError::invalid_argument("Empty execution plan.")),
            };
            collect(cursor.as_mut()).await?
        };

        let rows = data.len().to_string();
        Event::QueryExec.emit(&[
            ("collection", self.collection()),
            ("mode", reader.mode.as_str()),
            ("rows", &rows),
        ]);

        let mut has_more = false;
        if let Some(limit) = reader.limit.filter(|_| reader.peek) {
            let limit = usize::try_from(limit).unwrap_or(usize::MAX);
            if data.len() > limit {
                data.truncate(limit);
                has_more = true;
            }
        }
        if self.reverse {
            data.reverse();
        }

        let total = match &reader.totals {
            Some(totals) => self.read_total(store, totals).await,
            None => None,
        };
        Ok(ListResult::new(data, has_more, total))
    }

    /// Totals never fail the primary read
    async fn read_total(&self, store: &dyn DocumentStore, totals: &Totals) -> Option<u64> {
        match self.count_total(store, totals).await {
            Ok(total) => Some(total),
            Err(e) => {
                Event::QueryTotalFailed.emit(&[("collection", self.collection()), ("error", e.message())]);
                None
            }
        }
    }

    async fn count_total(&self, store: &dyn DocumentStore, totals: &Totals) -> QueryResult<u64> {
        match totals {
            Totals::Count(plan) => Ok(store.count(plan).await?),
            Totals::Pipeline(plan) => {
                let mut cursor = store.aggregate(plan).await?;
                let rows = collect(cursor.as_mut()).await?;
                Ok(rows
                    .first()
                    .and_then(|row| row.get("total"))
                    .and_then(as_integer)
                    .and_then(|n| u64::try_from(n).ok())
                    .unwrap_or(0))
            }
        }
    }

    /// Applies the skip and limit options on top of the stage window.
    /// Returns whether an extra row should be read: only when the page ends
    /// before the limit the stages themselves impose.
    fn finish_window(&self, window: &mut Window, cursor: bool) -> QueryResult<bool> {
        let options = self.cx.options();
        window.apply_skip(self.skip);
        match self.limit {
            LimitOption::Count(n) => {
                if n > options.max_limit && !cursor {
                    return Err(QueryError::invalid_argument(format!(
                        "limit must be an integer between 1 and {}, inclusive",
                        options.max_limit
                    ))
                    .at("limit"));
                }
                window.apply_limit(n);
            }
            LimitOption::Unlimited => {}
            LimitOption::Default => {
                if window.limit.is_none() {
                    window.apply_limit(options.default_limit);
                }
            }
        }
        if !self.cx.relax() && window.skip > MAX_SKIP {
            return Err(QueryError::invalid_argument(format!(
                "skip must be an integer between 0 and {}, inclusive",
                MAX_SKIP
            ))
            .at("skip"));
        }
        Ok(window.limit.is_some())
    }

    fn leading_filters(&self, matches: &[Map<String, Value>], pin: Option<(&str, &Value)>) -> Vec<Map<String, Value>> {
        let mut filters = Vec::new();
        if let Some(base) = &self.base_filter {
            filters.push(base.clone());
        }
        filters.extend(matches.iter().cloned());
        if let Some((field, value)) = pin {
            filters.push(pinned(field, value));
        }
        filters
    }

    /// Builds the reader for one execution
    pub fn reader(
        &self,
        options: &ExecOptions,
        mode: ExecMode,
        matches: &[Map<String, Value>],
        pin: Option<(&str, &Value)>,
    ) -> QueryResult<Reader> {
        match mode {
            ExecMode::Query => self.query_reader(options, matches, pin),
            ExecMode::Aggregate => self.aggregate_reader(options, matches, pin),
        }
    }

    fn query_reader(
        &self,
        options: &ExecOptions,
        matches: &[Map<String, Value>],
        pin: Option<(&str, &Value)>,
    ) -> QueryResult<Reader> {
        let mut filters = self.leading_filters(matches, pin);
        let mut sort = Map::new();
        let mut projection = None;
        let mut window = Window::default();

        for stage in self.stages.iter() {
            match (stage.name(), stage.body()) {
                (StageName::Match, Value::Object(body)) => filters.push(body.clone()),
                (StageName::Sort, Value::Object(body)) => sort.extend(body.clone()),
                (StageName::Project | StageName::AddFields, Value::Object(body)) => projection = Some(body.clone()),
                (StageName::Skip, _) => window.apply_skip(stage.count().unwrap_or(0)),
                (StageName::Limit, _) => {
                    if let Some(n) = stage.count() {
                        window.apply_limit(n);
                    }
                }
                _ => {}
            }
        }
        let peek = self.finish_window(&mut window, options.cursor)?;

        let filter = merge_filters(filters);
        let totals = (self.total && !options.cursor).then(|| {
            Totals::Count(FindPlan {
                collection: self.collection().to_string(),
                filter: filter.clone(),
                max_time_ms: options.max_time_ms,
                ..FindPlan::default()
            })
        });
        let find = FindPlan {
            collection: self.collection().to_string(),
            filter,
            sort,
            projection,
            skip: (window.skip > 0).then_some(window.skip),
            limit: Reader::store_limit(window.limit, peek),
            max_time_ms: options.max_time_ms,
        };
        Ok(Reader {
            mode: ExecMode::Query,
            find: Some(find),
            aggregate: None,
            totals,
            limit: window.limit,
            peek,
        })
    }

    fn aggregate_reader(
        &self,
        options: &ExecOptions,
        matches: &[Map<String, Value>],
        pin: Option<(&str, &Value)>,
    ) -> QueryResult<Reader> {
        let stages: Vec<&Stage> = self.stages.iter().collect();
        let split = stages
            .iter()
            .rposition(|s| !is_tail_stage(s))
            .map_or(0, |i| i + 1);
        let (prefix, tail) = stages.split_at(split);

        let mut window = Window::default();
        let mut projections = Vec::new();
        for stage in tail {
            match stage.name() {
                StageName::Skip => window.apply_skip(stage.count().unwrap_or(0)),
                StageName::Limit => {
                    if let Some(n) = stage.count() {
                        window.apply_limit(n);
                    }
                }
                _ => projections.push(stage.json()),
            }
        }
        let peek = self.finish_window(&mut window, options.cursor)?;

        let mut head = Vec::new();
        let leading = merge_filters(self.leading_filters(matches, pin));
        if !leading.is_empty() {
            head.push(json!({ "$match": leading }));
        }
        head.extend(prefix.iter().map(|s| s.json()));

        let totals = (self.total && !options.cursor).then(|| {
            let mut pipeline = head.clone();
            pipeline.push(json!({"$group": {"_id": null, "total": {"$sum": 1}}}));
            Totals::Pipeline(AggregatePlan {
                collection: self.collection().to_string(),
                pipeline,
                max_time_ms: options.max_time_ms,
            })
        });

        let mut pipeline = head;
        if window.skip > 0 {
            pipeline.push(json!({ "$skip": window.skip }));
        }
        if let Some(limit) = window.limit {
            pipeline.push(json!({ "$limit": if peek { limit + 1 } else { limit } }));
        }
        pipeline.extend(projections);
        if self.native {
            let cull: Map<String, Value> = CULLED_FIELDS.iter().map(|f| (f.to_string(), Value::from(0))).collect();
            pipeline.push(json!({ "$project": cull }));
        }
        if pipeline.is_empty() {
            pipeline.push(json!({"$match": {}}));
        }

        Ok(Reader {
            mode: ExecMode::Aggregate,
            find: None,
            aggregate: Some(AggregatePlan {
                collection: self.collection().to_string(),
                pipeline,
                max_time_ms: options.max_time_ms,
            }),
            totals,
            limit: window.limit,
            peek,
        })
    }

    /// Counts the documents a query-compatible plan matches
    pub async fn exec_count(
        &self,
        store: &dyn DocumentStore,
        skip: Option<&Value>,
        limit: Option<&Value>,
    ) -> QueryResult<u64> {
        self.check_executable()?;
        if !self.can_be_called_as_query() {
            return Err(QueryError::unsupported("cannot execute a count on a pipeline."));
        }

        let skip = parse_skip_option(skip, self.cx.relax())?;
        let max = if self.cx.relax() { u64::MAX } else { MAX_LIMIT };
        let limit = match limit.filter(|v| !v.is_null()) {
            None => None,
            Some(value) => match as_integer(value).and_then(|n| u64::try_from(n).ok()) {
                Some(n) if (1..=max).contains(&n) => Some(n),
                _ => {
                    return Err(QueryError::invalid_argument(format!(
                        "limit must be an integer between 1 and {}, inclusive",
                        MAX_LIMIT
                    ))
                    .at("limit"))
                }
            },
        };

        let mut before = BeforeExec::new();
        self.hooks.fire_before("exec", &mut before)?;

        let mut filters = self.leading_filters(before.matches(), None);
        let mut window = Window::default();
        for stage in self.stages.iter() {
            match (stage.name(), stage.body()) {
                (StageName::Match, Value::Object(body)) => filters.push(body.clone()),
                (StageName::Skip, _) => window.apply_skip(stage.count().unwrap_or(0)),
                (StageName::Limit, _) => {
                    if let Some(n) = stage.count() {
                        window.apply_limit(n);
                    }
                }
                _ => {}
            }
        }
        window.apply_skip(skip);
        if let Some(limit) = limit {
            window.apply_limit(limit);
        }

        let plan = FindPlan {
            collection: self.collection().to_string(),
            filter: merge_filters(filters),
            skip: (window.skip > 0).then_some(window.skip),
            limit: window.limit,
            ..FindPlan::default()
        };
        Ok(store.count(&plan).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_algebra() {
        let mut window = Window::default();
        window.apply_limit(8);
        window.apply_skip(5);
        assert_eq!(window, Window { skip: 5, limit: Some(3) });

        let mut window = Window::default();
        window.apply_skip(3);
        window.apply_limit(5);
        window.apply_limit(10);
        assert_eq!(window, Window { skip: 3, limit: Some(5) });

        window.apply_skip(9);
        assert_eq!(window.limit, Some(0));
    }

    #[test]
    fn test_merge_filters() {
        let a = pinned("a", &json!(1));
        let b = pinned("b", &json!(2));
        assert!(merge_filters(vec![Map::new()]).is_empty());
        assert_eq!(Value::Object(merge_filters(vec![a.clone(), Map::new()])), json!({"a": 1}));
        assert_eq!(
            Value::Object(merge_filters(vec![a, b])),
            json!({"$and": [{"a": 1}, {"b": 2}]})
        );
    }

    #[test]
    fn test_batch_keys() {
        assert_eq!(batch_key(&json!("open")), "open");
        assert_eq!(batch_key(&json!(3)), "3");
        assert_eq!(batch_key(&json!(true)), "true");
    }

    #[test]
    fn test_list_serialization() {
        let list = ListResult::new(vec![json!({"_id": 1})], true, None);
        assert_eq!(
            serde_json::to_value(&list).unwrap(),
            json!({"object": "list", "data": [{"_id": 1}], "hasMore": true})
        );
    }
}
