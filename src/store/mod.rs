//! Document store adapter
//!
//! The compiler hands finished plans to a `DocumentStore`. A store offers a
//! find path and an aggregation path, both answering with a cursor, plus a
//! document count for find plans. Execution, durability and transactions
//! belong to the store.

pub mod memory;

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Store-origin failures, passed through to the caller untouched
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("operation exceeded time limit of {0}ms")]
    Timeout(u64),

    #[error("sequence conflict: {0}")]
    Conflict(String),

    #[error("unsupported by the store: {0}")]
    Unsupported(String),

    #[error("store failure: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed future returned by store operations
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// A plain indexed find
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindPlan {
    pub collection: String,
    pub filter: Map<String, Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub sort: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time_ms: Option<u64>,
}

/// A full aggregation pipeline, stages in store form (`{"$name": body}`)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatePlan {
    pub collection: String,
    pub pipeline: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time_ms: Option<u64>,
}

/// Pull-based result stream
pub trait DocumentCursor: Send {
    /// Next document, or `None` once exhausted
    fn next(&mut self) -> StoreFuture<'_, Option<Value>>;
}

/// The store as seen by the compiler
pub trait DocumentStore: Send + Sync {
    fn find<'a>(&'a self, plan: &'a FindPlan) -> StoreFuture<'a, Box<dyn DocumentCursor>>;

    fn aggregate<'a>(&'a self, plan: &'a AggregatePlan) -> StoreFuture<'a, Box<dyn DocumentCursor>>;

    /// Documents matching the plan's filter, after its skip and limit
    fn count<'a>(&'a self, plan: &'a FindPlan) -> StoreFuture<'a, u64>;
}

/// Drains a cursor into memory
pub async fn collect(cursor: &mut dyn DocumentCursor) -> StoreResult<Vec<Value>> {
    let mut documents = Vec::new();
    while let Some(document) = cursor.next().await? {
        documents.push(document);
    }
    Ok(documents)
}

/// A cursor over documents already in memory
#[derive(Debug, Default)]
pub struct VecCursor {
    documents: std::vec::IntoIter<Value>,
}

impl VecCursor {
    pub fn new(documents: Vec<Value>) -> Self {
        Self {
            documents: documents.into_iter(),
        }
    }
}

impl DocumentCursor for VecCursor {
    fn next(&mut self) -> StoreFuture<'_, Option<Value>> {
        let document = self.documents.next();
        Box::pin(async move { Ok(document) })
    }
}
