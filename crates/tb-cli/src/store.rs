//! State store backed by a JSON file
//!
//! The file holds one JSON object with the same keys the extension keeps in
//! its storage, so a file exported from the browser can be used directly.

use std::future::Future;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tb_core::{Error, Result, StateStore, StoreMap};
use tokio::sync::Mutex;

pub struct JsonFileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<StoreMap> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreMap::new()),
            Err(e) => return Err(unavailable(&self.path, e)),
        };
        if text.trim().is_empty() {
            return Ok(StoreMap::new());
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(Error::StorageUnavailable(format!(
                "'{}' does not hold a JSON object",
                self.path.display()
            ))),
            Err(e) => Err(unavailable(&self.path, e)),
        }
    }

    async fn write_all(&self, map: &StoreMap) -> Result<()> {
        let text = serde_json::to_string_pretty(map).map_err(|e| unavailable(&self.path, e))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| unavailable(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| unavailable(&self.path, e))
    }
}

impl StateStore for JsonFileStore {
    fn get(&self, keys: &[&str]) -> impl Future<Output = Result<StoreMap>> + Send {
        let keys: Vec<String> = keys.iter().map(|key| key.to_string()).collect();
        async move {
            let _guard = self.lock.lock().await;
            let mut all = self.read_all().await?;
            Ok(keys
                .into_iter()
                .filter_map(|key| all.remove(&key).map(|value| (key, value)))
                .collect())
        }
    }

    fn set(&self, items: StoreMap) -> impl Future<Output = Result<()>> + Send {
        async move {
            let _guard = self.lock.lock().await;
            let mut all = self.read_all().await?;
            all.extend(items);
            self.write_all(&all).await
        }
    }
}

fn unavailable(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::StorageUnavailable(format!("'{}': {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tb-cli-{}-{}.json", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let store = JsonFileStore::new(temp_path("missing"));
        assert!(store.get(&["websites"]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_merges_keys() {
        let path = temp_path("merge");
        let store = JsonFileStore::new(&path);

        let mut first = StoreMap::new();
        first.insert("blockedSites".into(), json!(["example.com"]));
        store.set(first).await.unwrap();
        let mut second = StoreMap::new();
        second.insert("extensionEnabled".into(), json!(false));
        store.set(second).await.unwrap();

        let got = store
            .get(&["blockedSites", "extensionEnabled", "websites"])
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got["blockedSites"], json!(["example.com"]));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_non_object_file_is_unavailable() {
        let path = temp_path("array");
        std::fs::write(&path, "[1, 2]").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(
            store.get(&["websites"]).await,
            Err(Error::StorageUnavailable(_))
        ));
        let _ = std::fs::remove_file(path);
    }
}
