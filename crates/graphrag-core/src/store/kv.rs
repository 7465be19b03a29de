//! Key-value storage contract (spec.md §4.1.1).
//!
//! Namespaces partition keys (`full_docs`, `text_chunks`,
//! `community_reports`, `llm_response_cache`, `jobs`). All operations are
//! safe under single-writer, multi-reader concurrency within a process.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, ns: &str, id: &str) -> Result<Option<Value>>;

    /// Preserves input order; missing keys are `None` at their index.
    async fn get_many(&self, ns: &str, ids: &[String]) -> Result<Vec<Option<Value>>>;

    /// Batch upsert, last-write-wins on key collision.
    async fn upsert(&self, ns: &str, values: HashMap<String, Value>) -> Result<()>;

    /// Returns `true` iff the key existed.
    async fn delete(&self, ns: &str, id: &str) -> Result<bool>;

    async fn all_keys(&self, ns: &str) -> Result<HashSet<String>>;

    async fn drop_namespace(&self, ns: &str) -> Result<()>;

    /// Persistence checkpoint. A no-op for pure in-memory backends.
    async fn index_done(&self) -> Result<()>;
}

/// Reference in-memory KV store. The `graphrag` app crate wraps this (or
/// an equivalent) with file-backed persistence for the default `json`
/// backend token, and with Redis for the `redis` token.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    data: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, ns: &str, id: &str) -> Result<Option<Value>> {
        let data = self.data.read().expect("kv store lock poisoned");
        Ok(data.get(ns).and_then(|m| m.get(id)).cloned())
    }

    async fn get_many(&self, ns: &str, ids: &[String]) -> Result<Vec<Option<Value>>> {
        let data = self.data.read().expect("kv store lock poisoned");
        let ns_map = data.get(ns);
        Ok(ids.iter().map(|id| ns_map.and_then(|m| m.get(id)).cloned()).collect())
    }

    async fn upsert(&self, ns: &str, values: HashMap<String, Value>) -> Result<()> {
        let mut data = self.data.write().expect("kv store lock poisoned");
        let ns_map = data.entry(ns.to_string()).or_default();
        for (id, value) in values {
            ns_map.insert(id, value);
        }
        Ok(())
    }

    async fn delete(&self, ns: &str, id: &str) -> Result<bool> {
        let mut data = self.data.write().expect("kv store lock poisoned");
        Ok(data.get_mut(ns).map(|m| m.remove(id).is_some()).unwrap_or(false))
    }

    async fn all_keys(&self, ns: &str) -> Result<HashSet<String>> {
        let data = self.data.read().expect("kv store lock poisoned");
        Ok(data.get(ns).map(|m| m.keys().cloned().collect()).unwrap_or_default())
    }

    async fn drop_namespace(&self, ns: &str) -> Result<()> {
        let mut data = self.data.write().expect("kv store lock poisoned");
        data.remove(ns);
        Ok(())
    }

    async fn index_done(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = InMemoryKvStore::new();
        store.upsert("full_docs", HashMap::from([("doc-1".to_string(), json!({"content": "hi"}))])).await.unwrap();
        assert_eq!(store.get("full_docs", "doc-1").await.unwrap(), Some(json!({"content": "hi"})));
        assert_eq!(store.get("full_docs", "doc-2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_many_preserves_order_with_missing_as_none() {
        let store = InMemoryKvStore::new();
        store
            .upsert("jobs", HashMap::from([("a".to_string(), json!(1)), ("b".to_string(), json!(2))]))
            .await
            .unwrap();
        let result = store.get_many("jobs", &["b".to_string(), "missing".to_string(), "a".to_string()]).await.unwrap();
        assert_eq!(result, vec![Some(json!(2)), None, Some(json!(1))]);
    }

    #[tokio::test]
    async fn delete_reports_whether_key_existed() {
        let store = InMemoryKvStore::new();
        store.upsert("jobs", HashMap::from([("a".to_string(), json!(1))])).await.unwrap();
        assert!(store.delete("jobs", "a").await.unwrap());
        assert!(!store.delete("jobs", "a").await.unwrap());
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store = InMemoryKvStore::new();
        store.upsert("full_docs", HashMap::from([("x".to_string(), json!(1))])).await.unwrap();
        assert_eq!(store.get("text_chunks", "x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn drop_namespace_clears_only_that_namespace() {
        let store = InMemoryKvStore::new();
        store.upsert("a", HashMap::from([("x".to_string(), json!(1))])).await.unwrap();
        store.upsert("b", HashMap::from([("y".to_string(), json!(1))])).await.unwrap();
        store.drop_namespace("a").await.unwrap();
        assert!(store.all_keys("a").await.unwrap().is_empty());
        assert_eq!(store.all_keys("b").await.unwrap().len(), 1);
    }
}
