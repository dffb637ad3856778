//! Namespaced access to the cache holding session records.
//!
//! [`Cache`] wraps any [`CacheStore`] and qualifies every session id with the
//! configured namespace before it reaches the store. A session record is
//! stored as a single JSON object mapping field names to field values.
//!
//! # Examples
//!
//! ```
//! # use std::time::Duration;
//! #
//! # use cache_session::cache::Cache;
//! # use cache_session::cache::store::memory::Memory;
//! # use cache_session::config::Timeout;
//! # use serde_json::{Map, json};
//! #
//! # #[tokio::main]
//! # async fn main() -> cache_session::Result<()> {
//! let cache = Cache::new(Memory::new(), "ns:");
//! assert_eq!(cache.key("abc"), "ns:abc");
//!
//! let mut fields = Map::new();
//! fields.insert("user".to_string(), json!("bob"));
//! cache
//!     .store_fields("abc", &fields, Timeout::After(Duration::from_secs(60)))
//!     .await?;
//!
//! assert!(cache.contains("abc").await?);
//! assert_eq!(cache.load_fields("abc").await?, Some(fields));
//! # Ok(())
//! # }
//! ```

pub mod store;

use std::sync::Arc;

use derive_more::with_trait::Debug;
use serde_json::{Map, Value};
use tracing::trace;

use crate::cache::store::memory::Memory;
#[cfg(feature = "redis")]
use crate::cache::store::redis::Redis;
use crate::cache::store::{CacheStore, CacheStoreError, CacheStoreResult, DynCacheStore};
use crate::config::{CacheStoreConfig, Timeout};

/// The serialized form of a session record: field name to field value.
pub type FieldMap = Map<String, Value>;

/// A handle to the cache session records live in.
///
/// Cloning a `Cache` is cheap and yields a handle to the same store.
#[derive(Debug, Clone)]
pub struct Cache {
    inner: Arc<CacheImpl>,
}

#[derive(Debug)]
struct CacheImpl {
    #[debug("..")]
    store: Box<dyn DynCacheStore>,
    namespace: String,
}

impl Cache {
    /// Creates a new cache handle over `store`, qualifying every key with
    /// `namespace`.
    pub fn new(store: impl CacheStore, namespace: impl Into<String>) -> Self {
        let store: Box<dyn DynCacheStore> = Box::new(store);
        Self {
            inner: Arc::new(CacheImpl {
                store,
                namespace: namespace.into(),
            }),
        }
    }

    /// Creates a cache handle from the store section of the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured store could not be initialized.
    pub fn from_config(
        config: &CacheStoreConfig,
        namespace: impl Into<String>,
    ) -> CacheStoreResult<Self> {
        let cache = match config {
            CacheStoreConfig::Memory => Self::new(Memory::new(), namespace),
            #[cfg(feature = "redis")]
            CacheStoreConfig::Redis { url, pool_size } => {
                Self::new(Redis::new(url, *pool_size)?, namespace)
            }
        };
        Ok(cache)
    }

    /// Returns the namespace prepended to every session id.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Returns the fully qualified cache key for a session id.
    #[must_use]
    pub fn key(&self, id: &str) -> String {
        format!("{}{id}", self.inner.namespace)
    }

    /// Returns `true` if a live record exists for the session id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be queried.
    pub async fn contains(&self, id: &str) -> CacheStoreResult<bool> {
        let key = self.key(id);
        let exists = self.inner.store.exists_dyn(&key).await?;
        trace!(key = %key, exists, "Checked session record existence");
        Ok(exists)
    }

    /// Fetches the record stored for the session id.
    ///
    /// Returns `None` if there is no live record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be queried, or if the stored
    /// value is not a JSON object.
    pub async fn load_fields(&self, id: &str) -> CacheStoreResult<Option<FieldMap>> {
        let key = self.key(id);
        let value = self.inner.store.get_dyn(&key).await?;
        trace!(key = %key, found = value.is_some(), "Fetched session record");
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(fields)) => Ok(Some(fields)),
            Some(other) => Err(CacheStoreError::Deserialize(format!(
                "session record under `{key}` is not an object: {other}"
            ))),
        }
    }

    /// Stores the record for the session id, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejected the write.
    pub async fn store_fields(
        &self,
        id: &str,
        fields: &FieldMap,
        expiry: Timeout,
    ) -> CacheStoreResult<()> {
        let key = self.key(id);
        trace!(key = %key, fields = fields.len(), ?expiry, "Storing session record");
        self.inner
            .store
            .set_dyn(key, Value::Object(fields.clone()), expiry)
            .await
    }

    /// Removes the record stored for the session id. Removing an absent
    /// record is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be reached.
    pub async fn remove(&self, id: &str) -> CacheStoreResult<()> {
        let key = self.key(id);
        trace!(key = %key, "Removing session record");
        self.inner.store.delete_dyn(&key).await
    }
}
