//! Durable KV store contract backing the routing map and operation registry
//!
//! The store itself is an external collaborator; SPQR only relies on the
//! logical contract below. Key layout:
//! - `shards/<id>`
//! - `ranges/<lower-hex>`
//! - `rules/<column-set-hash>`
//! - `ops/<opid>`

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Key prefix for shard records
pub const SHARDS_PREFIX: &str = "shards/";
/// Key prefix for key-range records
pub const RANGES_PREFIX: &str = "ranges/";
/// Key prefix for sharding-rule records
pub const RULES_PREFIX: &str = "rules/";
/// Key prefix for operation records
pub const OPS_PREFIX: &str = "ops/";

/// Logical contract of the durable KV store
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All (key, value) pairs whose key starts with `prefix`, key-ordered
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Compare-and-swap: store `value` iff the current value equals
    /// `expected` (`None` meaning absent). Returns whether the swap took.
    async fn cas(&self, key: &str, expected: Option<&[u8]>, value: Vec<u8>) -> Result<bool>;
}

/// In-memory KV store for standalone deployments and tests
#[derive(Default)]
pub struct MemKv {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn cas(&self, key: &str, expected: Option<&[u8]>, value: Vec<u8>) -> Result<bool> {
        let mut data = self.data.write();
        let current = data.get(key).map(|v| v.as_slice());
        if current == expected {
            data.insert(key.to_string(), value);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let kv = MemKv::new();
        kv.put("shards/sh1", b"a".to_vec()).await.unwrap();
        assert_eq!(kv.get("shards/sh1").await.unwrap(), Some(b"a".to_vec()));

        kv.delete("shards/sh1").await.unwrap();
        assert_eq!(kv.get("shards/sh1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_prefix_is_ordered_and_bounded() {
        let kv = MemKv::new();
        kv.put("ranges/00", b"r0".to_vec()).await.unwrap();
        kv.put("ranges/80", b"r1".to_vec()).await.unwrap();
        kv.put("rules/x", b"rule".to_vec()).await.unwrap();

        let ranges = kv.scan_prefix("ranges/").await.unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].0, "ranges/00");
        assert_eq!(ranges[1].0, "ranges/80");
    }

    #[tokio::test]
    async fn test_cas() {
        let kv = MemKv::new();
        assert!(kv.cas("ops/1", None, b"pending".to_vec()).await.unwrap());
        assert!(!kv.cas("ops/1", None, b"clobber".to_vec()).await.unwrap());
        assert!(kv
            .cas("ops/1", Some(b"pending"), b"done".to_vec())
            .await
            .unwrap());
        assert_eq!(kv.get("ops/1").await.unwrap(), Some(b"done".to_vec()));
    }
}
