//! Session identifiers and their generation.
//!
//! Generated ids have the shape `xxxx:xx:xxxxxxxxxxxxxxx`: 13 hex digits of
//! the current time in microseconds followed by 8 hex digits of entropy,
//! split into groups of 4, 2 and 15 characters. Ids generated close together
//! share their leading groups, which keeps them readable and roughly sortable
//! in cache listings.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use derive_more::with_trait::{Debug, Display};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::config::DEFAULT_MAX_ID_ATTEMPTS;
use crate::{Error, Result};

/// The identifier of a session record.
///
/// # Examples
///
/// ```
/// use cache_session::session::id::SessionId;
///
/// let id = SessionId::from("5f3a:9c:41e2b7d0c8a9f10");
/// assert_eq!(id.as_str(), "5f3a:9c:41e2b7d0c8a9f10");
/// assert_eq!(id.to_string(), "5f3a:9c:41e2b7d0c8a9f10");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id and returns the underlying string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

type CandidateSource = dyn Fn() -> SessionId + Send + Sync;

/// Produces session ids that are not in use in the cache.
///
/// Each candidate is checked against the cache before it is handed out, and a
/// new candidate is drawn until an unused one is found or the attempt limit is
/// reached. The check and the first write under the new id are separate cache
/// operations, so two processes may in theory still pick the same id between
/// them.
///
/// # Examples
///
/// ```
/// use cache_session::cache::Cache;
/// use cache_session::cache::store::memory::Memory;
/// use cache_session::session::id::SessionIdGenerator;
///
/// # #[tokio::main]
/// # async fn main() -> cache_session::Result<()> {
/// let cache = Cache::new(Memory::new(), "ns:");
/// let id = SessionIdGenerator::new().generate(&cache).await?;
/// assert_eq!(id.as_str().len(), 23);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SessionIdGenerator {
    #[debug("..")]
    source: Arc<CandidateSource>,
    max_attempts: u32,
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionIdGenerator {
    /// Creates a generator drawing candidates from the time-based source.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(|| SessionId(unique_candidate()))
    }

    /// Creates a generator drawing candidates from a custom source.
    ///
    /// Useful to make collisions reproducible.
    ///
    /// # Examples
    ///
    /// ```
    /// use cache_session::session::id::{SessionId, SessionIdGenerator};
    ///
    /// let generator = SessionIdGenerator::with_source(|| SessionId::from("fixed"));
    /// ```
    pub fn with_source<F>(source: F) -> Self
    where
        F: Fn() -> SessionId + Send + Sync + 'static,
    {
        Self {
            source: Arc::new(source),
            max_attempts: DEFAULT_MAX_ID_ATTEMPTS,
        }
    }

    /// Sets how many candidates are checked before giving up. At least one
    /// candidate is always checked.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Generates an id with no live record in `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the cache could not be queried,
    /// and [`Error::IdGenerationExhausted`] if every candidate was taken.
    pub async fn generate(&self, cache: &Cache) -> Result<SessionId> {
        for attempt in 1..=self.max_attempts {
            let candidate = (self.source)();
            if !cache.contains(candidate.as_str()).await? {
                debug!(session_id = %candidate, attempt, "Generated session id");
                return Ok(candidate);
            }
            warn!(session_id = %candidate, attempt, "Session id collision, drawing another");
        }

        Err(Error::IdGenerationExhausted {
            attempts: self.max_attempts,
        })
    }
}

static CANDIDATE_COUNTER: AtomicU32 = AtomicU32::new(0);

const TIMESTAMP_MASK: u64 = 0xF_FFFF_FFFF_FFFF;

fn unique_candidate() -> String {
    let micros = Utc::now().timestamp_micros().unsigned_abs() & TIMESTAMP_MASK;
    let counter = CANDIDATE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let entropy = rand::random::<u32>() ^ counter.rotate_left(16);
    format_candidate(micros, entropy)
}

fn format_candidate(micros: u64, entropy: u32) -> String {
    let raw = format!("{micros:013x}{entropy:08x}");
    let mut id = String::with_capacity(raw.len() + 2);
    id.push_str(&raw[..4]);
    id.push(':');
    id.push_str(&raw[4..6]);
    id.push(':');
    id.push_str(&raw[6..]);
    id
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use serde_json::Map;

    use super::*;
    use crate::cache::store::memory::Memory;
    use crate::config::Timeout;
    use crate::test::UnavailableStore;

    #[test]
    fn candidate_format() {
        let id = format_candidate(0x0123_4567_89ab_c, 0xdead_beef);
        assert_eq!(id, "0123:45:6789abcdeadbeef");
    }

    #[test]
    fn candidate_groups() {
        let id = unique_candidate();
        let groups: Vec<&str> = id.split(':').collect();

        assert_eq!(id.len(), 23);
        assert_eq!(
            groups.iter().map(|group| group.len()).collect::<Vec<_>>(),
            vec![4, 2, 15]
        );
        assert!(
            groups
                .iter()
                .all(|group| group.chars().all(|c| c.is_ascii_hexdigit()))
        );
    }

    #[tokio::test]
    async fn generated_ids_are_distinct() {
        let cache = Cache::new(Memory::new(), "ns:");
        let generator = SessionIdGenerator::new();
        let mut seen = HashSet::new();

        for _ in 0..1000 {
            let id = generator.generate(&cache).await.unwrap();
            assert!(seen.insert(id), "generated a duplicate session id");
        }
    }

    #[tokio::test]
    async fn skips_ids_already_in_use() {
        let cache = Cache::new(Memory::new(), "ns:");
        cache
            .store_fields("taken", &Map::new(), Timeout::Never)
            .await
            .unwrap();

        let candidates = Mutex::new(vec!["free", "taken", "taken"]);
        let generator = SessionIdGenerator::with_source(move || {
            SessionId::from(candidates.lock().unwrap().pop().unwrap())
        });

        let id = generator.generate(&cache).await.unwrap();
        assert_eq!(id.as_str(), "free");
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let cache = Cache::new(Memory::new(), "ns:");
        cache
            .store_fields("taken", &Map::new(), Timeout::Never)
            .await
            .unwrap();

        let generator =
            SessionIdGenerator::with_source(|| SessionId::from("taken")).max_attempts(5);

        let result = generator.generate(&cache).await;
        assert!(matches!(
            result,
            Err(Error::IdGenerationExhausted { attempts: 5 })
        ));
    }

    #[tokio::test]
    async fn zero_max_attempts_still_checks_one_candidate() {
        let cache = Cache::new(Memory::new(), "ns:");
        let generator =
            SessionIdGenerator::with_source(|| SessionId::from("free")).max_attempts(0);

        let id = generator.generate(&cache).await.unwrap();
        assert_eq!(id.as_str(), "free");
    }

    #[tokio::test]
    async fn unreachable_store_fails_generation() {
        let cache = Cache::new(UnavailableStore, "ns:");

        let result = SessionIdGenerator::new().generate(&cache).await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    }
}
