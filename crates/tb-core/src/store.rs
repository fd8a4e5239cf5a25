//! Persistence gateway
//!
//! The extension's key-value storage is asynchronous and may fail or be
//! slow. Implementations map every failure to
//! [`Error::StorageUnavailable`]; callers keep their in-memory snapshot
//! when that happens.

use std::future::Future;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::{Error, Result};

/// Subset of the key space, keyed by storage key name.
pub type StoreMap = serde_json::Map<String, Value>;

/// Async key-value store holding the persisted state.
pub trait StateStore: Send + Sync {
    /// Read `keys`. Keys that are not stored are absent from the result.
    fn get(&self, keys: &[&str]) -> impl Future<Output = Result<StoreMap>> + Send;

    /// Write every entry of `items`, leaving other keys untouched.
    fn set(&self, items: StoreMap) -> impl Future<Output = Result<()>> + Send;
}

impl<T: StateStore> StateStore for std::sync::Arc<T> {
    fn get(&self, keys: &[&str]) -> impl Future<Output = Result<StoreMap>> + Send {
        (**self).get(keys)
    }

    fn set(&self, items: StoreMap) -> impl Future<Output = Result<()>> + Send {
        (**self).set(items)
    }
}

// =============================================================================
// In-memory Store
// =============================================================================

/// Store backed by a map in memory. Can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    items: StoreMap,
    failing: bool,
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: StoreMap) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                items,
                ..MemoryInner::default()
            }),
        }
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing = failing;
        }
    }

    /// Copy of everything stored.
    pub fn snapshot(&self) -> StoreMap {
        self.inner
            .lock()
            .map(|inner| inner.items.clone())
            .unwrap_or_default()
    }

    /// Number of successful `set` calls.
    pub fn write_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.writes).unwrap_or(0)
    }

    fn get_now(&self, keys: &[&str]) -> Result<StoreMap> {
        let inner = self.lock()?;
        if inner.failing {
            return Err(Error::StorageUnavailable("store is failing".into()));
        }
        Ok(keys
            .iter()
            .filter_map(|key| {
                inner
                    .items
                    .get(*key)
                    .map(|value| (key.to_string(), value.clone()))
            })
            .collect())
    }

    fn set_now(&self, items: StoreMap) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.failing {
            return Err(Error::StorageUnavailable("store is failing".into()));
        }
        inner.items.extend(items);
        inner.writes += 1;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::StorageUnavailable("store lock poisoned".into()))
    }
}

impl StateStore for MemoryStore {
    fn get(&self, keys: &[&str]) -> impl Future<Output = Result<StoreMap>> + Send {
        let result = self.get_now(keys);
        async move { result }
    }

    fn set(&self, items: StoreMap) -> impl Future<Output = Result<()>> + Send {
        let result = self.set_now(items);
        async move { result }
    }
}
