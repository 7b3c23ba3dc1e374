//! Streaming results
//!
//! The store is asked for one row past the requested limit. The wrapper
//! hands out rows up to the limit and keeps the extra one back: once it is
//! reached, iteration ends and `has_more` turns true.

use std::fmt;

use serde_json::Value;

use crate::store::DocumentCursor;

use super::errors::QueryResult;

pub struct QueryCursor {
    inner: Box<dyn DocumentCursor>,
    limit: Option<u64>,
    yielded: u64,
    peeked: Option<Value>,
    exhausted: bool,
    has_more: bool,
}

impl fmt::Debug for QueryCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCursor")
            .field("limit", &self.limit)
            .field("yielded", &self.yielded)
            .field("exhausted", &self.exhausted)
            .field("has_more", &self.has_more)
            .finish()
    }
}

impl QueryCursor {
    /// Wraps a store cursor opened with `limit + 1`
    pub fn new(inner: Box<dyn DocumentCursor>, limit: Option<u64>) -> Self {
        Self {
            inner,
            limit,
            yielded: 0,
            peeked: None,
            exhausted: limit == Some(0),
            has_more: false,
        }
    }

    async fn fill(&mut self) -> QueryResult<()> {
        if self.peeked.is_some() || self.exhausted {
            return Ok(());
        }
        match self.inner.next().await? {
            Some(_) if self.limit.is_some_and(|limit| self.yielded >= limit) => {
                self.has_more = true;
                self.exhausted = true;
            }
            Some(document) => self.peeked = Some(document),
            None => self.exhausted = true,
        }
        Ok(())
    }

    pub async fn has_next(&mut self) -> QueryResult<bool> {
        self.fill().await?;
        Ok(self.peeked.is_some())
    }

    pub async fn next(&mut self) -> QueryResult<Option<Value>> {
        self.fill().await?;
        let document = self.peeked.take();
        if document.is_some() {
            self.yielded += 1;
        }
        Ok(document)
    }

    /// Known once iteration has reached the limit
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn yielded(&self) -> u64 {
        self.yielded
    }

    /// Reads the remaining rows
    pub async fn drain(&mut self) -> QueryResult<Vec<Value>> {
        let mut documents = Vec::new();
        while let Some(document) = self.next().await? {
            documents.push(document);
        }
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::store::VecCursor;

    fn rows(n: usize) -> Box<dyn DocumentCursor> {
        Box::new(VecCursor::new((0..n).map(|i| json!({"_id": i})).collect()))
    }

    #[tokio::test]
    async fn test_extra_row_is_withheld() {
        let mut cursor = QueryCursor::new(rows(4), Some(3));
        assert!(cursor.has_next().await.unwrap());
        let documents = cursor.drain().await.unwrap();
        assert_eq!(documents.len(), 3);
        assert!(cursor.has_more());
        assert!(!cursor.has_next().await.unwrap());
    }

    #[tokio::test]
    async fn test_short_result_has_no_more() {
        let mut cursor = QueryCursor::new(rows(3), Some(3));
        assert_eq!(cursor.drain().await.unwrap().len(), 3);
        assert!(!cursor.has_more());
    }

    #[tokio::test]
    async fn test_unlimited_cursor() {
        let mut cursor = QueryCursor::new(rows(5), None);
        assert_eq!(cursor.next().await.unwrap(), Some(json!({"_id": 0})));
        assert_eq!(cursor.drain().await.unwrap().len(), 4);
        assert_eq!(cursor.yielded(), 5);
        assert!(!cursor.has_more());
    }
}
