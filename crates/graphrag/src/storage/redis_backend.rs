//! Redis KV backend (`storage.kv_backend = "redis"`, spec.md §4.1.1).
//!
//! Keys are namespaced as `{ns}:{id}`; listing uses `SCAN` (never
//! `KEYS`), matching Testable Property 10. TTL is applied per namespace —
//! the response cache expires after `cache_ttl_secs`, everything else is
//! kept indefinitely by this backend (the `jobs` namespace's own TTL is
//! enforced at the application layer by `jobs::JobStore::gc_expired`,
//! since the TTL there is a data-lifecycle policy, not a cache eviction).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use graphrag_core::error::{GraphRagError, Result};
use graphrag_core::store::KvStore;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;

use crate::config::RedisBackendConfig;


pub struct RedisKvStore {
    manager: ConnectionManager,
    cache_ttl_secs: u64,
}

impl RedisKvStore {
    pub async fn connect(config: &RedisBackendConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager, cache_ttl_secs: config.cache_ttl_secs })
    }

    fn key(ns: &str, id: &str) -> String {
        format!("{ns}:{id}")
    }

    fn to_transient(err: redis::RedisError) -> GraphRagError {
        if err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
            GraphRagError::transient_from("redis connection failure", err.into())
        } else {
            GraphRagError::permanent(format!("redis error: {err}"))
        }
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, ns: &str, id: &str) -> Result<Option<Value>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(Self::key(ns, id)).await.map_err(Self::to_transient)?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn get_many(&self, ns: &str, ids: &[String]) -> Result<Vec<Option<Value>>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get(ns, id).await?);
        }
        Ok(out)
    }

    async fn upsert(&self, ns: &str, values: HashMap<String, Value>) -> Result<()> {
        let mut conn = self.manager.clone();
        let ttl = if ns == "llm_response_cache" { Some(self.cache_ttl_secs) } else { None };
        for (id, value) in values {
            let raw = serde_json::to_string(&value).unwrap_or_default();
            let key = Self::key(ns, &id);
            match ttl {
                Some(secs) if secs > 0 => {
                    let _: () = conn.set_ex(key, raw, secs).await.map_err(Self::to_transient)?;
                }
                _ => {
                    let _: () = conn.set(key, raw).await.map_err(Self::to_transient)?;
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, ns: &str, id: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let deleted: i64 = conn.del(Self::key(ns, id)).await.map_err(Self::to_transient)?;
        Ok(deleted > 0)
    }

    async fn all_keys(&self, ns: &str) -> Result<HashSet<String>> {
        let mut conn = self.manager.clone();
        let prefix = format!("{ns}:");
        let pattern = format!("{prefix}*");
        let mut ids = HashSet::new();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await.map_err(Self::to_transient)?;
        use futures::StreamExt;
        while let Some(key) = iter.next().await {
            if let Some(id) = key.strip_prefix(&prefix) {
                ids.insert(id.to_string());
            }
        }
        Ok(ids)
    }

    async fn drop_namespace(&self, ns: &str) -> Result<()> {
        let ids = self.all_keys(ns).await?;
        for id in ids {
            self.delete(ns, &id).await?;
        }
        Ok(())
    }

    async fn index_done(&self) -> Result<()> {
        Ok(())
    }
}
