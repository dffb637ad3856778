//! The shared entry point for resolving sessions.
//!
//! A [`SessionStore`] is created once, typically at application startup, and
//! cloned into every request handler. For each request it turns the session
//! id the client presented (if any) into a [`Session`]: a known id is adopted,
//! anything else gets a freshly generated id and an empty record.

use std::sync::Arc;

use derive_more::with_trait::Debug;
use tracing::debug;

use crate::Result;
use crate::cache::Cache;
use crate::cache::store::CacheStore;
use crate::config::SessionConfig;
use crate::session::Session;
use crate::session::id::{SessionId, SessionIdGenerator};
use crate::session::tracker::ChangeTracker;
use crate::token::{Signer, TokenIssuer};

/// How a session id presented by the client was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// The presented id has a live record in the cache and was kept.
    Adopted(SessionId),
    /// No id was presented, or the presented one has no live record, so a new
    /// id was generated.
    Created(SessionId),
}

impl Resolution {
    /// Returns the id the session was resolved to.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        match self {
            Resolution::Adopted(id) | Resolution::Created(id) => id,
        }
    }

    /// Returns `true` if the presented id was kept.
    #[must_use]
    pub fn is_adopted(&self) -> bool {
        matches!(self, Resolution::Adopted(_))
    }
}

/// Resolves session ids into [`Session`]s.
///
/// Cloning a `SessionStore` is cheap; every clone shares the same cache,
/// signer and configuration.
///
/// # Examples
///
/// ```
/// use cache_session::cache::store::memory::Memory;
/// use cache_session::config::{SecretKey, SessionConfig};
/// use cache_session::session::store::{Resolution, SessionStore};
///
/// # #[tokio::main]
/// # async fn main() -> cache_session::Result<()> {
/// let config = SessionConfig::builder()
///     .secret(SecretKey::from("123abc"))
///     .build();
/// let store = SessionStore::new(config, Memory::new());
///
/// let mut session = store.resolve(None).await?;
/// session.set("user", &"alice")?;
/// session.write().await?;
/// let id = session.id().expect("written sessions have an id").clone();
///
/// let session = store.resolve(Some(id.as_str())).await?;
/// assert_eq!(session.resolution(), Some(&Resolution::Adopted(id)));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<SessionStoreImpl>,
}

#[derive(Debug, Clone)]
struct SessionStoreImpl {
    config: SessionConfig,
    cache: Cache,
    generator: SessionIdGenerator,
    issuer: TokenIssuer,
}

impl SessionStore {
    /// Creates a session store keeping its records in `store`, under the
    /// configured namespace.
    pub fn new(config: SessionConfig, store: impl CacheStore) -> Self {
        let cache = Cache::new(store, config.session_key_namespace.clone());
        Self::with_cache(config, cache)
    }

    /// Creates a session store using the cache backend named in the
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) if
    /// the cache backend could not be initialized.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let cache = Cache::from_config(&config.store, config.session_key_namespace.clone())?;
        Ok(Self::with_cache(config.clone(), cache))
    }

    fn with_cache(config: SessionConfig, cache: Cache) -> Self {
        let generator = SessionIdGenerator::new().max_attempts(config.max_id_attempts);
        let issuer = TokenIssuer::from_config(&config);
        Self {
            inner: Arc::new(SessionStoreImpl {
                config,
                cache,
                generator,
                issuer,
            }),
        }
    }

    /// Returns a store that signs tokens with `signer` instead of the
    /// configured JWT signer.
    #[must_use]
    pub fn with_signer(self, signer: Arc<dyn Signer>) -> Self {
        let mut inner = Arc::unwrap_or_clone(self.inner);
        inner.issuer = inner.issuer.with_signer(signer);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Returns a store that draws new session ids from `generator`.
    #[must_use]
    pub fn with_id_generator(self, generator: SessionIdGenerator) -> Self {
        let mut inner = Arc::unwrap_or_clone(self.inner);
        inner.generator = generator;
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Returns the configuration the store was created with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Returns the cache session records are kept in.
    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.inner.cache
    }

    /// Returns the issuer minting session tokens.
    #[must_use]
    pub fn issuer(&self) -> &TokenIssuer {
        &self.inner.issuer
    }

    pub(crate) fn generator(&self) -> &SessionIdGenerator {
        &self.inner.generator
    }

    /// Returns `true` if a live record exists for the session id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) if
    /// the cache could not be queried.
    pub async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.cache().contains(id).await?)
    }

    /// Resolves the session id presented by a client.
    ///
    /// A non-empty id with a live record is adopted. In eager mode its record
    /// is loaded right away; in lazy mode loading is deferred to the first
    /// read. Anything else starts a new, empty session under a freshly
    /// generated id; the old record (if any) is not touched.
    ///
    /// Checking for the record and later writing it are separate cache
    /// operations: a record that expires in between is written anew under
    /// the same id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) if
    /// the cache could not be reached, and
    /// [`Error::IdGenerationExhausted`](crate::Error::IdGenerationExhausted) if
    /// no unused id could be generated.
    pub async fn resolve(&self, incoming: Option<&str>) -> Result<Session> {
        if let Some(incoming) = incoming.filter(|id| !id.is_empty()) {
            if self.exists(incoming).await? {
                let id = SessionId::from(incoming);
                let mut session = Session::new(
                    self.clone(),
                    Some(id.clone()),
                    Some(Resolution::Adopted(id.clone())),
                    ChangeTracker::new(),
                );
                if !self.config().lazy {
                    session.load().await?;
                }
                debug!(session_id = %id, lazy = self.config().lazy, "Adopted session");
                return Ok(session);
            }
            debug!(session_id = incoming, "Unknown session id, starting a new session");
        }

        let id = self.generator().generate(self.cache()).await?;
        debug!(session_id = %id, "Created session");
        Ok(Session::new(
            self.clone(),
            Some(id.clone()),
            Some(Resolution::Created(id)),
            ChangeTracker::fresh(),
        ))
    }

    /// Starts a new session without resolving any id. An id is generated when
    /// the session is first written.
    #[must_use]
    pub fn start(&self) -> Session {
        Session::new(self.clone(), None, None, ChangeTracker::fresh())
    }
}
