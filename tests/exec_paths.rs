//! Execution path tests
//!
//! Covers the runtime side of compiled queries against the memory store:
//! - Query and aggregate readers
//! - Totals, including a store whose count fails
//! - Exec hooks, batches and native cursors
//! - Counting and variable-bearing queries

use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use docql::parser::{
    BeforeExec, ExecHook, ExecMode, ExecOptions, ExecOutput, ExecSummary, Parser, ParserOptions, QueryErrorKind,
    QueryResult, QuerySpec, Totals,
};
use docql::schema::{AccessContext, AccessLevel, IndexSlot, Model, Principal, Property, PropertyType};
use docql::store::memory::MemoryStore;
use docql::store::{AggregatePlan, DocumentCursor, DocumentStore, FindPlan, StoreError, StoreFuture};

fn model() -> Arc<Model> {
    Arc::new(
        Model::new(
            "c_task",
            "contexts",
            vec![
                Property::new("c_title", PropertyType::String).indexed(1),
                Property::new("c_priority", PropertyType::Number).indexed(2),
            ],
            vec![IndexSlot::new(1, "s1"), IndexSlot::new(2, "n1")],
        )
        .unwrap(),
    )
}

fn id(n: usize) -> String {
    format!("{:024x}", n)
}

fn store() -> MemoryStore {
    store_with(12)
}

fn store_with(count: usize) -> MemoryStore {
    let store = MemoryStore::new();
    let model = model();
    for n in 1..=count {
        store
            .insert_indexed(
                &model,
                json!({"_id": id(n), "c_title": format!("t{}", n % 4), "c_priority": n % 6}),
            )
            .unwrap();
    }
    store
}

fn compiled(options: ParserOptions, query: Value) -> Parser {
    let mut p = Parser::new(
        vec![model()],
        AccessContext::new(Principal::anonymous(), AccessLevel::Read),
        options,
    )
    .unwrap();
    let spec: QuerySpec = serde_json::from_value(query).unwrap();
    p.parse(&spec, None, None).unwrap();
    p
}

fn titles(data: &[Value]) -> Vec<&str> {
    data.iter().map(|d| d["c_title"].as_str().unwrap()).collect()
}

/// A store whose count always fails
struct NoCount(MemoryStore);

impl DocumentStore for NoCount {
    fn find<'a>(&'a self, plan: &'a FindPlan) -> StoreFuture<'a, Box<dyn DocumentCursor>> {
        self.0.find(plan)
    }

    fn aggregate<'a>(&'a self, plan: &'a AggregatePlan) -> StoreFuture<'a, Box<dyn DocumentCursor>> {
        self.0.aggregate(plan)
    }

    fn count<'a>(&'a self, _plan: &'a FindPlan) -> StoreFuture<'a, u64> {
        Box::pin(async { Err(StoreError::Internal("count unavailable".into())) })
    }
}

// =============================================================================
// Readers
// =============================================================================

/// Filters, sorts and pagination alone run as a plain find.
#[test]
fn test_simple_queries_use_find() {
    let p = compiled(ParserOptions::default(), json!({"where": {"c_title": "t1"}, "limit": 5}));
    let reader = p.reader(&ExecOptions::default(), ExecMode::Query, &[], None).unwrap();
    let find = reader.find.unwrap();
    assert_eq!(find.limit, Some(6));
    assert_eq!(find.sort, json!({"_id": -1}).as_object().unwrap().clone());
    assert!(reader.aggregate.is_none());
}

/// Grouped results page through the aggregate path.
#[tokio::test]
async fn test_grouped_pipeline_pages() {
    let p = compiled(
        ParserOptions::default().with_total(),
        json!({
            "pipeline": [
                {"$group": {"_id": "c_title", "n": {"$count": "_id"}}},
                {"$sort": {"n": -1}}
            ],
            "limit": 2
        }),
    );
    assert!(!p.can_be_called_as_query());

    let list = p
        .exec(&store(), ExecOptions::default())
        .await
        .unwrap()
        .into_list()
        .unwrap();
    assert_eq!(list.data.len(), 2);
    assert!(list.has_more);
    assert_eq!(list.total, Some(4));
    assert!(list.data.iter().all(|d| d["n"] == 3));
}

// =============================================================================
// Totals
// =============================================================================

/// Totals ignore pagination.
#[tokio::test]
async fn test_total_counts_all_matches() {
    let p = compiled(
        ParserOptions::default(),
        json!({"where": {"c_priority": {"$gte": 1}}, "limit": 2, "total": true}),
    );
    let list = p
        .exec(&store(), ExecOptions::default())
        .await
        .unwrap()
        .into_list()
        .unwrap();
    assert_eq!(list.data.len(), 2);
    assert_eq!(list.total, Some(10));
}

/// A failed count leaves the rows intact and the total absent.
#[tokio::test]
async fn test_total_is_best_effort() {
    let p = compiled(ParserOptions::default().with_total(), json!({"limit": 3}));
    let reader = p.reader(&ExecOptions::default(), ExecMode::Query, &[], None).unwrap();
    assert!(matches!(reader.totals, Some(Totals::Count(_))));

    let list = p
        .exec(&NoCount(store()), ExecOptions::default())
        .await
        .unwrap()
        .into_list()
        .unwrap();
    assert_eq!(list.data.len(), 3);
    assert!(list.has_more);
    assert_eq!(list.total, None);
}

// =============================================================================
// Hooks
// =============================================================================

#[derive(Default)]
struct TitleScope {
    seen: Mutex<Vec<ExecSummary>>,
}

impl ExecHook for TitleScope {
    fn before(&self, exec: &mut BeforeExec) -> QueryResult<()> {
        let mut filter = Map::new();
        filter.insert("c_title".to_string(), json!("t1"));
        exec.add_raw_match(filter);
        Ok(())
    }

    fn after(&self, summary: &ExecSummary) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(summary.clone());
        }
    }
}

/// Raw matches added before execution restrict the results, and the
/// summary reaches the after hook.
#[tokio::test]
async fn test_exec_hook_scopes_results() {
    let mut p = compiled(ParserOptions::default(), json!({}));
    let hook = Arc::new(TitleScope::default());
    p.hook("exec", hook.clone()).unwrap();
    assert!(p.hook("save", hook.clone()).is_err());

    let list = p
        .exec(&store(), ExecOptions::default())
        .await
        .unwrap()
        .into_list()
        .unwrap();
    assert_eq!(titles(&list.data), vec!["t1", "t1", "t1"]);

    let seen = hook.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].mode, "query");
    assert_eq!(seen[0].count, 3);
}

// =============================================================================
// Batches
// =============================================================================

/// Each batch value yields the result of the same query pinned to that
/// value.
#[tokio::test]
async fn test_batch_matches_single_queries() {
    let store = store();
    let mut p = compiled(ParserOptions::default(), json!({"where": {"c_priority": {"$gte": 1}}}));
    p.set_batch("c_title", vec![json!("t1"), json!("t2"), json!("t3")]).unwrap();

    let ExecOutput::Map(results) = p.exec(&store, ExecOptions::default()).await.unwrap() else {
        panic!("batch should produce a map");
    };
    assert_eq!(results.len(), 3);

    for title in ["t1", "t2", "t3"] {
        let single = compiled(
            ParserOptions::default(),
            json!({"where": {"c_priority": {"$gte": 1}, "c_title": title}}),
        );
        let expected = single
            .exec(&store, ExecOptions::default())
            .await
            .unwrap()
            .into_list()
            .unwrap();
        assert_eq!(results[title].data, expected.data, "batch entry {}", title);
    }
}

/// Batches cannot stream.
#[tokio::test]
async fn test_batch_rejects_cursor() {
    let mut p = compiled(ParserOptions::default(), json!({}));
    p.set_batch("c_title", vec![json!("t1")]).unwrap();
    let err = p.exec(&store(), ExecOptions::cursor()).await.unwrap_err();
    assert_eq!(err.kind(), QueryErrorKind::UnsupportedOperation);
}

// =============================================================================
// Native Pipelines
// =============================================================================

/// Native pipelines only stream, and their output loses internal fields.
#[tokio::test]
async fn test_native_pipeline_streams_culled_documents() {
    let p = compiled(
        ParserOptions::default(),
        json!({"nativePipeline": [{"$match": {"c_title": "t2"}}]}),
    );
    let err = p.exec(&store(), ExecOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), QueryErrorKind::UnsupportedOperation);

    let ExecOutput::Cursor(mut cursor) = p.exec(&store(), ExecOptions::cursor()).await.unwrap() else {
        panic!("native pipeline should produce a cursor");
    };
    let documents = cursor.drain().await.unwrap();
    assert_eq!(documents.len(), 3);
    assert!(documents.iter().all(|d| d.get("idx").is_none()));
}

/// Cursors without a limit stream one default page and report the rest.
#[tokio::test]
async fn test_cursor_applies_default_limit() {
    let p = compiled(ParserOptions::default(), json!({"where": {"c_priority": {"$gte": 0}}}));
    let ExecOutput::Cursor(mut cursor) = p.exec(&store_with(150), ExecOptions::cursor()).await.unwrap() else {
        panic!("cursor exec should produce a cursor");
    };
    let documents = cursor.drain().await.unwrap();
    assert_eq!(documents.len(), ParserOptions::default().default_limit as usize);
    assert!(cursor.has_more());
}

/// Cursors may exceed the maximum page size.
#[tokio::test]
async fn test_cursor_exempt_from_max_limit() {
    let limit = ParserOptions::default().max_limit + 10;
    let p = compiled(ParserOptions::default(), json!({ "limit": limit }));
    assert!(p.exec(&store(), ExecOptions::default()).await.is_err());

    let ExecOutput::Cursor(mut cursor) = p.exec(&store(), ExecOptions::cursor()).await.unwrap() else {
        panic!("cursor exec should produce a cursor");
    };
    assert_eq!(cursor.drain().await.unwrap().len(), 12);
    assert!(!cursor.has_more());
}

// =============================================================================
// Counting And Variables
// =============================================================================

/// Counts honor filters and the requested limit.
#[tokio::test]
async fn test_exec_count() {
    let store = store();
    let p = compiled(ParserOptions::default(), json!({"where": {"c_priority": {"$gte": 1}}}));
    assert_eq!(p.exec_count(&store, None, None).await.unwrap(), 10);
    assert_eq!(p.exec_count(&store, None, Some(&json!(2))).await.unwrap(), 2);
    assert!(p.exec_count(&store, None, Some(&json!(0))).await.is_err());

    let grouped = compiled(
        ParserOptions::default(),
        json!({"pipeline": [{"$group": {"_id": "c_title"}}]}),
    );
    let err = grouped.exec_count(&store, None, None).await.unwrap_err();
    assert_eq!(err.kind(), QueryErrorKind::UnsupportedOperation);
}

/// Placeholders compile but never execute.
#[tokio::test]
async fn test_variables_block_execution() {
    let p = compiled(
        ParserOptions::default().with_variables(),
        json!({"where": {"c_title": "{{title}}"}}),
    );
    assert!(p.has_variables());
    let err = p.exec(&store(), ExecOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), QueryErrorKind::UnsupportedOperation);
}
