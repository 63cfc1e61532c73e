//! Key-value persistence for pool, guards, swarms and pending messages

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use onion_core::PubKey;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ClientError, Result};

pub const SNODE_POOL_KEY: &str = "snode_pool";
pub const GUARD_NODES_KEY: &str = "guard_nodes";

pub fn swarm_key(pubkey: &PubKey) -> String {
    format!("swarm:{}", pubkey)
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, id: &str) -> Result<Option<Value>>;

    async fn create_or_update_item(&self, id: &str, value: Value) -> Result<()>;
}

/// Read and decode a stored item
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    id: &str,
) -> Result<Option<T>> {
    match store.get_item(id).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Encode and store an item
pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    id: &str,
    value: &T,
) -> Result<()> {
    store
        .create_or_update_item(id, serde_json::to_value(value)?)
        .await
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_item(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.items.lock().get(id).cloned())
    }

    async fn create_or_update_item(&self, id: &str, value: Value) -> Result<()> {
        self.items.lock().insert(id.to_string(), value);
        Ok(())
    }
}

/// One JSON file per key under a data directory
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| ClientError::Storage(format!("{}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        let name: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get_item(&self, id: &str) -> Result<Option<Value>> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ClientError::Storage(format!("{}: {}", path.display(), e))),
        }
    }

    async fn create_or_update_item(&self, id: &str, value: Value) -> Result<()> {
        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(&value)?;
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| ClientError::Storage(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ClientError::Storage(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.get_item("k").await.unwrap().is_none());
        save_json(&store, "k", &vec![1, 2, 3]).await.unwrap();
        let back: Option<Vec<u32>> = load_json(&store, "k").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_json_file_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let pubkey = PubKey::new(format!("05{}", "ab".repeat(32))).unwrap();
        let key = swarm_key(&pubkey);
        {
            let store = JsonFileStore::open(dir.path()).unwrap();
            store
                .create_or_update_item(&key, serde_json::json!({"a": 1}))
                .await
                .unwrap();
        }
        let store = JsonFileStore::open(dir.path()).unwrap();
        let value = store.get_item(&key).await.unwrap().unwrap();
        assert_eq!(value["a"], 1);
        assert!(store.get_item("missing").await.unwrap().is_none());
    }
}
