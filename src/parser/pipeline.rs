//! Stage list and optimizer
//!
//! Stages live in an arena-backed doubly linked list so the optimizer and
//! the parser can move, insert and drop stages in place. Node ids stay
//! valid until the node is removed.

use serde_json::{json, Value};

use super::operators::StageName;
use super::rules::as_integer;

pub type NodeId = usize;

#[derive(Debug, Clone)]
struct Node<T> {
    value: T,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Pipeline<T> {
    nodes: Vec<Option<Node<T>>>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: usize,
}

impl<T> Default for Pipeline<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl<T> Pipeline<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(values: Vec<T>) -> Self {
        let mut pipeline = Self::new();
        for value in values {
            pipeline.push_back(value);
        }
        pipeline
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<NodeId> {
        self.head
    }

    pub fn last(&self) -> Option<NodeId> {
        self.tail
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.next)
    }

    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.prev)
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.node(id).map(|n| &n.value)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.nodes.get_mut(id).and_then(Option::as_mut).map(|n| &mut n.value)
    }

    fn node(&self, id: NodeId) -> Option<&Node<T>> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    fn alloc(&mut self, value: T, prev: Option<NodeId>, next: Option<NodeId>) -> NodeId {
        self.nodes.push(Some(Node { value, prev, next }));
        self.len += 1;
        self.nodes.len() - 1
    }

    fn set_next(&mut self, id: Option<NodeId>, next: Option<NodeId>) {
        match id.and_then(|id| self.nodes.get_mut(id)).and_then(Option::as_mut) {
            Some(node) => node.next = next,
            None => self.head = next,
        }
    }

    fn set_prev(&mut self, id: Option<NodeId>, prev: Option<NodeId>) {
        match id.and_then(|id| self.nodes.get_mut(id)).and_then(Option::as_mut) {
            Some(node) => node.prev = prev,
            None => self.tail = prev,
        }
    }

    pub fn push_back(&mut self, value: T) -> NodeId {
        let tail = self.tail;
        let id = self.alloc(value, tail, None);
        self.set_next(tail, Some(id));
        self.tail = Some(id);
        id
    }

    pub fn push_front(&mut self, value: T) -> NodeId {
        let head = self.head;
        let id = self.alloc(value, None, head);
        self.set_prev(head, Some(id));
        self.head = Some(id);
        id
    }

    /// Inserts after `anchor`, or at the back if `anchor` is gone
    pub fn insert_after(&mut self, anchor: NodeId, value: T) -> NodeId {
        let Some(next) = self.node(anchor).map(|n| n.next) else {
            return self.push_back(value);
        };
        let id = self.alloc(value, Some(anchor), next);
        self.set_next(Some(anchor), Some(id));
        self.set_prev(next, Some(id));
        id
    }

    /// Inserts before `anchor`, or at the front if `anchor` is gone
    pub fn insert_before(&mut self, anchor: NodeId, value: T) -> NodeId {
        let Some(prev) = self.node(anchor).map(|n| n.prev) else {
            return self.push_front(value);
        };
        let id = self.alloc(value, prev, Some(anchor));
        self.set_prev(Some(anchor), Some(id));
        self.set_next(prev, Some(id));
        id
    }

    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        let node = self.nodes.get_mut(id)?.take()?;
        self.set_next(node.prev, node.next);
        self.set_prev(node.next, node.prev);
        self.len -= 1;
        Some(node.value)
    }

    /// Swaps `id` with the node that follows it
    pub fn move_after_next(&mut self, id: NodeId) -> bool {
        let Some(next) = self.next(id) else {
            return false;
        };
        match self.remove(id) {
            Some(value) => {
                self.insert_after(next, value);
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.next(id);
        }
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.ids().into_iter().filter_map(move |id| self.get(id))
    }

    pub fn into_vec(mut self) -> Vec<T> {
        self.ids().into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

/// A client stage before compilation
#[derive(Debug, Clone, PartialEq)]
pub struct RawStage {
    pub name: StageName,
    pub value: Value,
}

impl RawStage {
    pub fn new(name: StageName, value: Value) -> Self {
        Self { name, value }
    }

    fn count(&self) -> Option<i64> {
        as_integer(&self.value)
    }
}

/// Applies local rewrites to adjacent stage pairs until none applies.
/// Returns the number of rewrites performed.
///
/// - `$sort,$match` swap
/// - `$skip s,$limit l` become `$limit s+l,$skip s`
/// - `$project|$addFields` swap with a following `$skip|$limit`
/// - `$limit,$limit` keep the smaller
/// - `$skip,$skip` add up
/// - `$match,$match` combine under `$and`
pub fn optimize(pipeline: &mut Pipeline<RawStage>) -> usize {
    let mut rewrites = 0;
    while rewrite_once(pipeline) {
        rewrites += 1;
    }
    rewrites
}

fn rewrite_once(pipeline: &mut Pipeline<RawStage>) -> bool {
    let mut cursor = pipeline.first();
    while let Some(curr) = cursor {
        let Some(next) = pipeline.next(curr) else {
            return false;
        };
        let (Some(a), Some(b)) = (pipeline.get(curr).cloned(), pipeline.get(next).cloned()) else {
            return false;
        };

        match (a.name, b.name) {
            (StageName::Sort, StageName::Match) => return pipeline.move_after_next(curr),
            (StageName::Skip, StageName::Limit) => {
                // an overflowing sum is left for stage compilation to reject
                if let Some(total) = a.count().zip(b.count()).and_then(|(s, l)| s.checked_add(l)) {
                    if let Some(stage) = pipeline.get_mut(next) {
                        stage.value = Value::from(total);
                    }
                    return pipeline.move_after_next(curr);
                }
            }
            (StageName::Project | StageName::AddFields, StageName::Skip | StageName::Limit) => {
                return pipeline.move_after_next(curr)
            }
            (StageName::Limit, StageName::Limit) => {
                if let (Some(x), Some(y)) = (a.count(), b.count()) {
                    if let Some(stage) = pipeline.get_mut(curr) {
                        stage.value = Value::from(x.min(y));
                    }
                    pipeline.remove(next);
                    return true;
                }
            }
            (StageName::Skip, StageName::Skip) => {
                if let Some(total) = a.count().zip(b.count()).and_then(|(x, y)| x.checked_add(y)) {
                    if let Some(stage) = pipeline.get_mut(curr) {
                        stage.value = Value::from(total);
                    }
                    pipeline.remove(next);
                    return true;
                }
            }
            (StageName::Match, StageName::Match) => {
                if let Some(stage) = pipeline.get_mut(curr) {
                    stage.value = conjoin(a.value, b.value);
                }
                pipeline.remove(next);
                return true;
            }
            _ => {}
        }
        cursor = Some(next);
    }
    false
}

/// `a AND b`, extending `a` in place when it is already a lone `$and` so
/// repeated merges stay one level deep
fn conjoin(a: Value, b: Value) -> Value {
    match a {
        Value::Object(mut map) if map.len() == 1 && map.get("$and").is_some_and(Value::is_array) => {
            if let Some(Value::Array(branches)) = map.get_mut("$and") {
                branches.push(b);
            }
            Value::Object(map)
        }
        other => json!({ "$and": [other, b] }),
    }
}
