//! A process-local cache store.
//!
//! [`Memory`] keeps entries in a hash map guarded by an async mutex. Expiry is
//! resolved to an absolute point in time on write and checked on every read;
//! an expired entry is dropped the first time it is looked at. Nothing runs in
//! the background, so entries nobody reads again stay in memory until they are
//! overwritten or deleted.
//!
//! Records do not survive a restart of the process, which makes this store a
//! fit for tests, development, and single-process deployments.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use cache_session::cache::store::CacheStore;
//! use cache_session::cache::store::memory::Memory;
//! use cache_session::config::Timeout;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> cache_session::cache::store::CacheStoreResult<()> {
//! let store = Memory::new();
//! store
//!     .set("ns:abc".to_string(), json!({"user": "alice"}), Timeout::After(Duration::from_secs(60)))
//!     .await?;
//!
//! assert!(store.exists("ns:abc").await?);
//! assert_eq!(store.get("ns:abc").await?, Some(json!({"user": "alice"})));
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::cache::store::{CacheStore, CacheStoreResult};
use crate::config::Timeout;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires: Timeout,
}

impl Entry {
    fn is_live(&self) -> bool {
        !self.expires.is_expired(None)
    }
}

/// A cache store living in the memory of the current process.
///
/// Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Memory {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns when the entry under `key` expires, or `None` if there is no
    /// live entry.
    ///
    /// Relative timeouts are resolved on write, so a live entry always
    /// reports either [`Timeout::Never`] or [`Timeout::AtDateTime`].
    pub async fn expiry(&self, key: &str) -> Option<Timeout> {
        self.with_live(key, |entry| entry.expires).await
    }

    /// Returns the number of entries held, counting expired entries that have
    /// not been looked at since they expired.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Returns `true` if the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn with_live<T>(&self, key: &str, f: impl FnOnce(&Entry) -> T) -> Option<T> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live() => Some(f(entry)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

impl CacheStore for Memory {
    async fn get(&self, key: &str) -> CacheStoreResult<Option<Value>> {
        Ok(self.with_live(key, |entry| entry.value.clone()).await)
    }

    async fn set(&self, key: String, value: Value, ttl: Timeout) -> CacheStoreResult<()> {
        let entry = Entry {
            value,
            expires: ttl.canonicalize(),
        };
        self.entries.lock().await.insert(key, entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheStoreResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> CacheStoreResult<bool> {
        Ok(self.with_live(key, |_| ()).await.is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    const HOUR: Timeout = Timeout::After(Duration::from_secs(3600));

    #[tokio::test]
    async fn set_then_get() {
        let store = Memory::new();

        store
            .set("ns:a".to_string(), json!({"user": "bob"}), HOUR)
            .await
            .unwrap();

        assert_eq!(store.get("ns:a").await.unwrap(), Some(json!({"user": "bob"})));
        assert_eq!(store.get("ns:b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_overwrites() {
        let store = Memory::new();
        store.set("ns:a".to_string(), json!(1), HOUR).await.unwrap();
        store.set("ns:a".to_string(), json!(2), HOUR).await.unwrap();

        assert_eq!(store.get("ns:a").await.unwrap(), Some(json!(2)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn expired_entry_is_absent_and_dropped() {
        let store = Memory::new();
        store
            .set(
                "ns:a".to_string(),
                json!(1),
                Timeout::After(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        assert!(store.exists("ns:a").await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!store.exists("ns:a").await.unwrap());
        assert!(store.is_empty().await);
        assert_eq!(store.get("ns:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = Memory::new();
        store.set("ns:a".to_string(), json!(1), HOUR).await.unwrap();

        store.delete("ns:a").await.unwrap();
        store.delete("ns:a").await.unwrap();

        assert!(!store.exists("ns:a").await.unwrap());
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let store = Memory::new();
        let other = store.clone();

        store.set("ns:a".to_string(), json!(1), HOUR).await.unwrap();

        assert!(other.exists("ns:a").await.unwrap());
    }

    #[tokio::test]
    async fn never_expiring_entry() {
        let store = Memory::new();
        store
            .set("ns:a".to_string(), json!(1), Timeout::Never)
            .await
            .unwrap();

        assert_eq!(store.expiry("ns:a").await, Some(Timeout::Never));
    }

    #[tokio::test]
    async fn relative_ttl_is_resolved_on_write() {
        let store = Memory::new();
        store.set("ns:a".to_string(), json!(1), HOUR).await.unwrap();

        let Some(Timeout::AtDateTime(at)) = store.expiry("ns:a").await else {
            panic!("expected an absolute expiry");
        };
        let remaining = at.signed_duration_since(chrono::Utc::now()).num_seconds();
        assert!((3590..=3600).contains(&remaining));
    }
}
