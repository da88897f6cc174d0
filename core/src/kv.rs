//! KVStore (C2) — the minimal key-value interface every higher layer is
//! built on. `InMemoryKvStore` is the only implementation shipped here;
//! a production binding (edge KV, Redis, whatever a given deployment
//! uses) is an external collaborator that implements the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct PutOptions {
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Default for PutOptions {
    fn default() -> Self {
        PutOptions {
            ttl_seconds: None,
            expires_at: None,
        }
    }
}

impl PutOptions {
    pub fn ttl(seconds: u64) -> Self {
        PutOptions {
            ttl_seconds: Some(seconds),
            expires_at: None,
        }
    }

    fn resolve_expiry(&self) -> Option<DateTime<Utc>> {
        self.expires_at
            .or_else(|| self.ttl_seconds.map(|s| Utc::now() + chrono::Duration::seconds(s as i64)))
    }
}

#[derive(Debug, Clone)]
pub struct ListResult {
    pub keys: Vec<String>,
    pub next_cursor: Option<String>,
    pub complete: bool,
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|e| Utc::now() >= e).unwrap_or(false)
    }
}

/// Strongly-consistent-enough KV store: read-your-writes within a single
/// caller, TTL honoured best-effort, global cross-region ordering not
/// required.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_bytes(&self, key: &str) -> Option<Vec<u8>>;
    async fn put_bytes(&self, key: &str, value: Vec<u8>, opts: PutOptions);
    async fn delete(&self, key: &str);
    async fn list(&self, prefix: &str, cursor: Option<String>, limit: usize) -> ListResult;

    async fn get_text(&self, key: &str) -> Option<String> {
        self.get_bytes(key)
            .await
            .and_then(|b| String::from_utf8(b).ok())
    }

    async fn put_text(&self, key: &str, value: &str, opts: PutOptions) {
        self.put_bytes(key, value.as_bytes().to_vec(), opts).await;
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get_bytes(key).await?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn put_json<T: Serialize + Sync>(&self, key: &str, value: &T, opts: PutOptions) {
        if let Ok(bytes) = serde_json::to_vec(value) {
            self.put_bytes(key, bytes, opts).await;
        }
    }
}

/// `dashmap`-backed implementation used for tests, local development, and
/// as the default when no external KV binding is configured.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        InMemoryKvStore {
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Some(entry.value.clone()),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    async fn put_bytes(&self, key: &str, value: Vec<u8>, opts: PutOptions) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: opts.resolve_expiry(),
            },
        );
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn list(&self, prefix: &str, cursor: Option<String>, limit: usize) -> ListResult {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();

        let start = match cursor {
            Some(c) => keys.partition_point(|k| k.as_str() <= c.as_str()),
            None => 0,
        };
        let window = &keys[start.min(keys.len())..];
        let page: Vec<String> = window.iter().take(limit).cloned().collect();
        let complete = page.len() == window.len();
        let next_cursor = if complete { None } else { page.last().cloned() };

        ListResult {
            keys: page,
            next_cursor,
            complete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let kv = InMemoryKvStore::new();
        kv.put_text("a:b:c", "hello", PutOptions::default()).await;
        assert_eq!(kv.get_text("a:b:c").await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_on_read() {
        let kv = InMemoryKvStore::new();
        kv.put_bytes(
            "k",
            b"v".to_vec(),
            PutOptions {
                ttl_seconds: None,
                expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            },
        )
        .await;
        assert!(kv.get_bytes("k").await.is_none());
    }

    #[tokio::test]
    async fn list_respects_prefix_and_limit() {
        let kv = InMemoryKvStore::new();
        for i in 0..5 {
            kv.put_text(&format!("svc:e:{i}"), "x", PutOptions::default())
                .await;
        }
        kv.put_text("other:e:0", "x", PutOptions::default()).await;
        let page = kv.list("svc:e:", None, 3).await;
        assert_eq!(page.keys.len(), 3);
        assert!(!page.complete);
        let rest = kv.list("svc:e:", page.next_cursor, 10).await;
        assert_eq!(rest.keys.len(), 2);
        assert!(rest.complete);
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let kv = InMemoryKvStore::new();
        kv.put_text("k", "v", PutOptions::default()).await;
        kv.delete("k").await;
        assert!(kv.get_text("k").await.is_none());
    }
}
