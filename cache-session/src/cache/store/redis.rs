//! A Redis-backed cache store.
//!
//! Every value is stored as a JSON string. Timeouts map onto the expiry
//! options of `SET`: a relative timeout becomes `PX`, an absolute one `EXAT`,
//! and [`Timeout::Never`] sets no expiry at all. Connections are pooled with
//! `deadpool-redis`.
//!
//! # Examples
//!
//! ```no_run
//! use cache_session::cache::store::CacheStore;
//! use cache_session::cache::store::redis::Redis;
//! use cache_session::config::{CacheUrl, Timeout};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> cache_session::cache::store::CacheStoreResult<()> {
//! let url = CacheUrl::parse("redis://127.0.0.1:6379/0").expect("valid url");
//! let store = Redis::new(&url, 16)?;
//!
//! store
//!     .set("session:abc".to_string(), json!({"user": "alice"}), Timeout::Never)
//!     .await?;
//! assert!(store.exists("session:abc").await?);
//! # Ok(())
//! # }
//! ```

use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::{AsyncCommands, SetExpiry, SetOptions};
use serde_json::Value;
use thiserror::Error;

use crate::cache::store::{CacheStore, CacheStoreError, CacheStoreResult};
use crate::config::{CacheUrl, Timeout};

const ERROR_PREFIX: &str = "redis error:";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error raised by the Redis cache store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RedisCacheStoreError {
    /// The URL does not use the `redis` scheme.
    #[error("{ERROR_PREFIX} unsupported url `{0}`")]
    UnsupportedUrl(String),
    /// The connection pool could not be set up.
    #[error("{ERROR_PREFIX} could not create connection pool: {0}")]
    Pool(BoxError),
    /// No connection could be checked out of the pool.
    #[error("{ERROR_PREFIX} could not connect: {0}")]
    Connection(BoxError),
    /// The server rejected a command.
    #[error("{ERROR_PREFIX} command failed: {0}")]
    Command(BoxError),
    /// A value could not be encoded as JSON.
    #[error("{ERROR_PREFIX} could not encode value: {0}")]
    Encode(serde_json::Error),
    /// A stored string is not valid JSON.
    #[error("{ERROR_PREFIX} could not decode value: {0}")]
    Decode(serde_json::Error),
}

impl From<RedisCacheStoreError> for CacheStoreError {
    fn from(error: RedisCacheStoreError) -> Self {
        let message = error.to_string();
        match error {
            RedisCacheStoreError::Encode(_) => CacheStoreError::Serialize(message),
            RedisCacheStoreError::Decode(_) => CacheStoreError::Deserialize(message),
            _ => CacheStoreError::Backend(message),
        }
    }
}

fn command_error(error: redis::RedisError) -> RedisCacheStoreError {
    RedisCacheStoreError::Command(Box::new(error))
}

/// A cache store backed by a Redis server.
#[derive(Debug, Clone)]
pub struct Redis {
    pool: Pool,
}

impl Redis {
    /// Creates a store connecting to `url` with at most `pool_size` pooled
    /// connections. Connections are opened lazily, on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is not a `redis://` URL or the pool could not
    /// be created.
    pub fn new(url: &CacheUrl, pool_size: usize) -> CacheStoreResult<Self> {
        if url.scheme() != "redis" {
            return Err(RedisCacheStoreError::UnsupportedUrl(url.as_str().to_string()).into());
        }

        let pool = Config::from_url(url.as_str())
            .builder()
            .map_err(|e| RedisCacheStoreError::Pool(Box::new(e)))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| RedisCacheStoreError::Pool(Box::new(e)))?;
        Ok(Self { pool })
    }

    /// Checks a connection out of the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the server could not be reached.
    pub async fn connection(&self) -> Result<Connection, RedisCacheStoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| RedisCacheStoreError::Connection(Box::new(e)))
    }
}

fn set_options(ttl: Timeout) -> SetOptions {
    let options = SetOptions::default();
    match ttl {
        Timeout::Never => options,
        Timeout::After(duration) => {
            // redis rejects a zero expiry
            let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1);
            options.with_expiration(SetExpiry::PX(millis))
        }
        Timeout::AtDateTime(at) => {
            options.with_expiration(SetExpiry::EXAT(at.timestamp().unsigned_abs()))
        }
    }
}

impl CacheStore for Redis {
    async fn get(&self, key: &str) -> CacheStoreResult<Option<Value>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(key).await.map_err(command_error)?;
        let value = raw
            .map(|raw| serde_json::from_str(&raw).map_err(RedisCacheStoreError::Decode))
            .transpose()?;
        Ok(value)
    }

    async fn set(&self, key: String, value: Value, ttl: Timeout) -> CacheStoreResult<()> {
        let raw = serde_json::to_string(&value).map_err(RedisCacheStoreError::Encode)?;
        let mut conn = self.connection().await?;
        let () = conn
            .set_options(key, raw, set_options(ttl))
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheStoreResult<()> {
        let mut conn = self.connection().await?;
        let _removed: usize = conn.del(key).await.map_err(command_error)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> CacheStoreResult<bool> {
        let mut conn = self.connection().await?;
        let exists: bool = conn.exists(key).await.map_err(command_error)?;
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    async fn connect() -> Redis {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/1".into());
        let store = Redis::new(&CacheUrl::parse(&url).expect("REDIS_URL is not a url"), 4)
            .expect("could not create redis store");
        store.connection().await.expect("redis is not reachable");
        store
    }

    #[test]
    fn rejects_non_redis_url() {
        let url = CacheUrl::parse("memcached://127.0.0.1:11211").unwrap();

        let error = Redis::new(&url, 4).unwrap_err();
        assert_eq!(
            error.to_string(),
            "cache store error: backend error: redis error: unsupported url `memcached://127.0.0.1:11211`"
        );
    }

    #[test]
    fn relative_expiry_is_never_zero() {
        let options = redis::cmd("SET")
            .arg("key")
            .arg("value")
            .arg(set_options(Timeout::After(Duration::ZERO)))
            .get_packed_command();
        let packed = String::from_utf8_lossy(&options);

        assert!(packed.contains("PX"), "{packed}");
        assert!(packed.ends_with("$1\r\n1\r\n"), "{packed}");
    }

    #[test]
    fn error_conversion_keeps_category() {
        let decode = serde_json::from_str::<Value>("{").unwrap_err();
        assert!(matches!(
            CacheStoreError::from(RedisCacheStoreError::Decode(decode)),
            CacheStoreError::Deserialize(_)
        ));

        let error =
            CacheStoreError::from(RedisCacheStoreError::Connection(Box::new(std::io::Error::other(
                "refused",
            ))));
        assert_eq!(
            error.to_string(),
            "cache store error: backend error: redis error: could not connect: refused"
        );
    }

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn set_get_exists_delete() {
        let store = connect().await;
        let key = "cache_session:test:roundtrip".to_string();

        store
            .set(key.clone(), json!({"user": "alice"}), Timeout::After(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Some(json!({"user": "alice"})));

        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn entries_expire() {
        let store = connect().await;
        let key = "cache_session:test:expiry".to_string();

        store
            .set(key.clone(), json!(1), Timeout::After(Duration::from_secs(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn absolute_expiry() {
        let store = connect().await;
        let key = "cache_session:test:exat".to_string();
        let ttl = Timeout::After(Duration::from_secs(60)).canonicalize();

        store.set(key.clone(), json!(1), ttl).await.unwrap();

        assert!(store.exists(&key).await.unwrap());
        store.delete(&key).await.unwrap();
    }
}
