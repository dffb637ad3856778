//! The key-value cache collaborator.
//!
//! Session records reach the cache through the [`CacheStore`] trait: an
//! existence check, a read, a write with a time-to-live, and a delete. That is
//! the whole contract the session layer relies on. Keys handed to a store are
//! already namespaced by [`Cache`](crate::cache::Cache).

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use thiserror::Error;

use crate::config::Timeout;

const ERROR_PREFIX: &str = "cache store error:";

/// An error reported by a cache store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheStoreError {
    /// The backend could not be reached or rejected the command.
    #[error("{ERROR_PREFIX} backend error: {0}")]
    Backend(String),
    /// A value could not be encoded for the backend.
    #[error("{ERROR_PREFIX} serialization error: {0}")]
    Serialize(String),
    /// A value held by the backend could not be decoded.
    #[error("{ERROR_PREFIX} deserialization error: {0}")]
    Deserialize(String),
}

/// Result type of every [`CacheStore`] operation.
pub type CacheStoreResult<T> = Result<T, CacheStoreError>;

/// A key-value cache with per-entry expiry.
///
/// Implementations must treat expired entries as absent. The session layer
/// never retries a failed call and applies no timeouts of its own.
pub trait CacheStore: Send + Sync + 'static {
    /// Returns the value stored under `key`, if it is live.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be queried or the stored
    /// value could not be decoded.
    fn get(&self, key: &str) -> impl Future<Output = CacheStoreResult<Option<Value>>> + Send;

    /// Stores `value` under `key` until `ttl` runs out, replacing whatever was
    /// there before.
    ///
    /// # Errors
    ///
    /// Returns an error if the value could not be encoded or the backend
    /// rejected the write.
    fn set(
        &self,
        key: String,
        value: Value,
        ttl: Timeout,
    ) -> impl Future<Output = CacheStoreResult<()>> + Send;

    /// Deletes the entry under `key`. Deleting a missing entry succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be reached.
    fn delete(&self, key: &str) -> impl Future<Output = CacheStoreResult<()>> + Send;

    /// Returns `true` if a live entry exists under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be queried.
    fn exists(&self, key: &str) -> impl Future<Output = CacheStoreResult<bool>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = CacheStoreResult<T>> + Send + 'a>>;

/// Object-safe mirror of [`CacheStore`], so a [`Cache`](crate::cache::Cache)
/// can hold any store behind a single pointer type.
pub(crate) trait DynCacheStore: Send + Sync + 'static {
    fn get_dyn<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Value>>;
    fn set_dyn(&self, key: String, value: Value, ttl: Timeout) -> BoxFuture<'_, ()>;
    fn delete_dyn<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()>;
    fn exists_dyn<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool>;
}

impl<S: CacheStore> DynCacheStore for S {
    fn get_dyn<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Value>> {
        Box::pin(CacheStore::get(self, key))
    }

    fn set_dyn(&self, key: String, value: Value, ttl: Timeout) -> BoxFuture<'_, ()> {
        Box::pin(CacheStore::set(self, key, value, ttl))
    }

    fn delete_dyn<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(CacheStore::delete(self, key))
    }

    fn exists_dyn<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(CacheStore::exists(self, key))
    }
}
