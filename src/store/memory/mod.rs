//! In-memory reference store
//!
//! Holds documents per collection and evaluates find plans and the subset
//! of the aggregation pipeline the compiler emits. Documents inserted
//! through `insert_indexed` get their `idx` slot mirrors computed from the
//! model, the way a production store maintains them on write.

mod expr;
mod filter;
mod path;
mod stages;

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::{Map, Value};

use crate::schema::Model;

use super::{AggregatePlan, DocumentCursor, DocumentStore, FindPlan, StoreError, StoreFuture, StoreResult, VecCursor};

pub use filter::matches;

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a document as given
    pub fn insert(&self, collection: &str, document: Value) -> StoreResult<()> {
        if !document.is_object() {
            return Err(StoreError::Internal("documents must be objects".into()));
        }
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::Internal("collection lock poisoned".into()))?;
        collections.entry(collection.to_string()).or_default().push(document);
        Ok(())
    }

    /// Stores a document of `model`, writing the `idx.<slot>` mirror of
    /// every slot-indexed property. Unique slots keep their value under `v`.
    pub fn insert_indexed(&self, model: &Model, document: Value) -> StoreResult<()> {
        let mut document = document;
        let mut index = Map::new();
        model.walk(&mut |property| {
            if !property.indexed || property.native_index {
                return;
            }
            let Some(slot) = model.slot_for(property) else {
                return;
            };
            let found = path::resolve(&document, property.full_path());
            let value = match found.as_slice() {
                [] => return,
                [single] => (*single).clone(),
                many => Value::Array(
                    many.iter()
                        .flat_map(|v| match v {
                            Value::Array(items) => items.clone(),
                            other => vec![(*other).clone()],
                        })
                        .collect(),
                ),
            };
            if property.unique {
                let mut unique = Map::new();
                unique.insert("v".to_string(), value);
                index.insert(slot.to_string(), Value::Object(unique));
            } else {
                index.insert(slot.to_string(), value);
            }
        });
        if let Value::Object(map) = &mut document {
            if !index.is_empty() {
                map.insert("idx".to_string(), Value::Object(index));
            }
        }
        self.insert(model.collection(), document)
    }

    /// Snapshot of a collection
    pub fn documents(&self, collection: &str) -> StoreResult<Vec<Value>> {
        let collections = self
            .collections
            .read()
            .map_err(|_| StoreError::Internal("collection lock poisoned".into()))?;
        Ok(collections.get(collection).cloned().unwrap_or_default())
    }

    fn run_find(&self, plan: &FindPlan) -> StoreResult<Vec<Value>> {
        let mut documents = Vec::new();
        for document in self.documents(&plan.collection)? {
            if filter::matches(&document, &plan.filter)? {
                documents.push(document);
            }
        }
        stages::sort(&mut documents, &plan.sort);
        let skip = plan.skip.unwrap_or(0) as usize;
        let mut documents: Vec<Value> = documents.into_iter().skip(skip).collect();
        if let Some(limit) = plan.limit {
            documents.truncate(limit as usize);
        }
        match &plan.projection {
            Some(spec) if !spec.is_empty() => documents.iter().map(|d| stages::project(d, spec)).collect(),
            _ => Ok(documents),
        }
    }
}

impl DocumentStore for MemoryStore {
    fn find<'a>(&'a self, plan: &'a FindPlan) -> StoreFuture<'a, Box<dyn DocumentCursor>> {
        Box::pin(async move {
            let documents = self.run_find(plan)?;
            Ok(Box::new(VecCursor::new(documents)) as Box<dyn DocumentCursor>)
        })
    }

    fn aggregate<'a>(&'a self, plan: &'a AggregatePlan) -> StoreFuture<'a, Box<dyn DocumentCursor>> {
        Box::pin(async move {
            let documents = stages::run(self.documents(&plan.collection)?, &plan.pipeline)?;
            Ok(Box::new(VecCursor::new(documents)) as Box<dyn DocumentCursor>)
        })
    }

    fn count<'a>(&'a self, plan: &'a FindPlan) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let counted = FindPlan {
                projection: None,
                ..plan.clone()
            };
            Ok(self.run_find(&counted)?.len() as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{IndexSlot, Property, PropertyType};
    use crate::store::collect;
    use serde_json::json;

    fn model() -> Model {
        Model::new(
            "c_post",
            "contexts",
            vec![
                Property::new("c_title", PropertyType::String).indexed(1),
                Property::new("c_rank", PropertyType::Number).indexed(2).unique(),
                Property::new("c_comments", PropertyType::Document)
                    .array()
                    .with_properties(vec![Property::new("c_body", PropertyType::String).indexed(3)]),
            ],
            vec![IndexSlot::new(1, "s1"), IndexSlot::new(2, "u1"), IndexSlot::new(3, "s3")],
        )
        .unwrap()
    }

    #[test]
    fn test_insert_indexed_mirrors_slots() {
        let store = MemoryStore::new();
        store
            .insert_indexed(
                &model(),
                json!({
                    "_id": "a",
                    "c_title": "hello",
                    "c_rank": 4,
                    "c_comments": [{"c_body": "x"}, {"c_body": "y"}]
                }),
            )
            .unwrap();
        let stored = store.documents("contexts").unwrap().remove(0);
        assert_eq!(stored["idx"], json!({"s1": "hello", "u1": {"v": 4}, "s3": ["x", "y"]}));
    }

    #[tokio::test]
    async fn test_find_applies_sort_skip_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert("contexts", json!({"_id": i, "c_n": i % 2})).unwrap();
        }
        let plan = FindPlan {
            collection: "contexts".into(),
            filter: json!({"c_n": 0}).as_object().cloned().unwrap(),
            sort: json!({"_id": -1}).as_object().cloned().unwrap(),
            skip: Some(1),
            limit: Some(5),
            ..FindPlan::default()
        };
        let mut cursor = store.find(&plan).await.unwrap();
        let ids: Vec<Value> = collect(cursor.as_mut()).await.unwrap().into_iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(ids, vec![json!(2), json!(0)]);
        assert_eq!(store.count(&plan).await.unwrap(), 2);
    }
}
