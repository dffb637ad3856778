//! Per-request session handles.
//!
//! A [`Session`] is obtained from a
//! [`SessionStore`](store::SessionStore) at the start of a request and
//! finalized with [`Session::write`] at the end of it. In between, fields can
//! be read and changed freely; reads fetch the stored record the first time
//! they need it, and changes made before that are never overwritten by it.

pub mod id;
pub mod store;
pub mod tracker;

use std::net::IpAddr;

use chrono::Utc;
use derive_more::with_trait::Debug;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace};

use crate::Result;
use crate::cache::FieldMap;
use crate::session::id::SessionId;
use crate::session::store::{Resolution, SessionStore};
use crate::session::tracker::{Binding, ChangeTracker, LoadState};

/// The field stamped with the time of the last write, as a Unix timestamp.
pub const LAST_ACTIVE_FIELD: &str = "last_active";

/// A session scoped to a single request.
///
/// # Examples
///
/// ```
/// use cache_session::cache::store::memory::Memory;
/// use cache_session::config::{SecretKey, SessionConfig};
/// use cache_session::session::store::SessionStore;
///
/// # #[tokio::main]
/// # async fn main() -> cache_session::Result<()> {
/// let config = SessionConfig::builder()
///     .secret(SecretKey::from("123abc"))
///     .build();
/// let store = SessionStore::new(config, Memory::new());
///
/// let mut session = store.resolve(None).await?;
/// session.set("flash", &"Profile saved")?;
///
/// let flash: Option<String> = session.get_once("flash").await?;
/// assert_eq!(flash.as_deref(), Some("Profile saved"));
/// assert_eq!(session.get::<String>("flash").await?, None);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Session {
    store: SessionStore,
    id: Option<SessionId>,
    resolution: Option<Resolution>,
    tracker: ChangeTracker,
    client_ip: Option<IpAddr>,
    #[debug(skip)]
    token: Option<String>,
    needs_signing: bool,
    destroyed: bool,
}

impl Session {
    pub(crate) fn new(
        store: SessionStore,
        id: Option<SessionId>,
        resolution: Option<Resolution>,
        tracker: ChangeTracker,
    ) -> Self {
        Self {
            store,
            id,
            resolution,
            tracker,
            client_ip: None,
            token: None,
            needs_signing: true,
            destroyed: false,
        }
    }

    /// Returns the current session id, or `None` for a session created with
    /// [`SessionStore::start`] that has not been written yet.
    #[must_use]
    pub fn id(&self) -> Option<&SessionId> {
        self.id.as_ref()
    }

    /// Returns how the session id was resolved, or `None` if the session was
    /// not resolved from a client-presented id.
    #[must_use]
    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    /// Returns whether the stored record has been fetched.
    #[must_use]
    pub fn load_state(&self) -> LoadState {
        self.tracker.state()
    }

    /// Returns `true` if the session was destroyed and not restarted since.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Returns the client address tokens are bound to.
    #[must_use]
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    /// Sets the client address tokens are bound to.
    pub fn set_client_ip(&mut self, client_ip: Option<IpAddr>) {
        if self.client_ip != client_ip {
            self.client_ip = client_ip;
            self.needs_signing = true;
        }
    }

    /// Returns the session with its tokens bound to `client_ip`.
    #[must_use]
    pub fn with_client_ip(mut self, client_ip: IpAddr) -> Self {
        self.set_client_ip(Some(client_ip));
        self
    }

    /// Fetches the stored record and merges it with the fields changed so
    /// far. Does nothing if the record was already fetched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) if
    /// the record could not be fetched, and
    /// [`Error::InvalidRecord`](crate::Error::InvalidRecord) if the cache holds
    /// something other than a session record under its key.
    pub async fn load(&mut self) -> Result<()> {
        if self.tracker.is_loaded() {
            return Ok(());
        }

        let stored = match &self.id {
            Some(id) => self.store.cache().load_fields(id.as_str()).await?,
            None => None,
        };
        trace!(
            session_id = ?self.id,
            found = stored.is_some(),
            "Loaded session record"
        );
        self.tracker.hydrate(stored.unwrap_or_default());
        Ok(())
    }

    /// Returns the raw value of a field, or `None` if it is absent or null.
    ///
    /// # Errors
    ///
    /// Returns an error if the record had to be fetched and could not be.
    pub async fn get_value(&mut self, key: &str) -> Result<Option<Value>> {
        self.load().await?;
        Ok(self.tracker.get(key))
    }

    /// Returns the value of a field, or `None` if it is absent or null.
    ///
    /// # Errors
    ///
    /// Returns an error if the record had to be fetched and could not be, or
    /// if the value cannot be deserialized as `T`.
    pub async fn get<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        let value = self.get_value(key).await?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    /// Returns the value of a field, or `default` if it is absent or null.
    ///
    /// # Errors
    ///
    /// Returns an error if the record had to be fetched and could not be, or
    /// if the value cannot be deserialized as `T`.
    pub async fn get_or<T: DeserializeOwned>(&mut self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Returns the value of a field like [`get`](Self::get), then nulls it.
    ///
    /// # Errors
    ///
    /// Returns an error if the record had to be fetched and could not be, or
    /// if the value cannot be deserialized as `T`.
    pub async fn get_once<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        self.load().await?;
        let value = self.tracker.get_once(key);
        if value.is_some() {
            self.needs_signing = true;
        }
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    /// Sets a field.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn set<T: Serialize + ?Sized>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        if self.tracker.set(key, value) {
            self.needs_signing = true;
        }
        Ok(())
    }

    /// Binds a field to `binding`. The session reads the field from the
    /// binding and copies its value into the record on every write.
    pub fn bind<T>(&mut self, key: impl Into<String>, binding: &Binding<T>) {
        self.tracker.bind(key, binding);
        self.needs_signing = true;
    }

    /// Nulls every given field.
    pub fn delete<I, K>(&mut self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        if self.tracker.delete(keys) {
            self.needs_signing = true;
        }
    }

    /// Returns the full record, fetching it first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the record had to be fetched and could not be.
    pub async fn fields(&mut self) -> Result<FieldMap> {
        self.load().await?;
        Ok(self.tracker.snapshot())
    }

    /// Persists the session and mints a token for it.
    ///
    /// The record is stamped with the current time under
    /// [`LAST_ACTIVE_FIELD`], a token is signed over it, and the whole record
    /// is stored with the configured lifetime. The token is then available
    /// through [`issued_token`](Self::issued_token). Writing again without
    /// changing the session in between does nothing.
    ///
    /// Returns `false` without touching the cache if the session was
    /// destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenSigning`](crate::Error::TokenSigning) if the
    /// token could not be signed, in which case nothing is stored, and
    /// [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) if the
    /// cache could not be reached. After an error the session must be treated
    /// as not committed.
    pub async fn write(&mut self) -> Result<bool> {
        if self.destroyed {
            debug!(session_id = ?self.id, "Skipping write of destroyed session");
            return Ok(false);
        }
        if self.tracker.flush_bindings() {
            self.needs_signing = true;
        }
        if !self.needs_signing {
            return Ok(true);
        }

        let id = match &self.id {
            Some(id) => id.clone(),
            None => {
                let id = self.store.generator().generate(self.store.cache()).await?;
                self.id = Some(id.clone());
                id
            }
        };
        self.load().await?;

        let now = Utc::now();
        self.tracker.set(LAST_ACTIVE_FIELD, Value::from(now.timestamp()));
        let fields = self.tracker.snapshot();

        let token = self
            .store
            .issuer()
            .issue(&fields, &id, now, self.client_ip)?;
        self.store
            .cache()
            .store_fields(id.as_str(), &fields, self.store.config().timeout())
            .await?;
        self.token = Some(token);
        self.needs_signing = false;

        debug!(session_id = %id, fields = fields.len(), "Wrote session");
        Ok(true)
    }

    /// Returns the token minted by the last successful
    /// [`write`](Self::write), or `None` if no write has succeeded yet.
    ///
    /// The token is kept after the session changes; it then reflects the
    /// session as of that write until the next one mints a new token.
    #[must_use]
    pub fn issued_token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Deletes the stored record and clears the session. Destroying a session
    /// that was never written, or destroying it twice, is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) if
    /// the cache could not be reached.
    pub async fn destroy(&mut self) -> Result<()> {
        if let Some(id) = &self.id {
            self.store.cache().remove(id.as_str()).await?;
        }
        self.tracker = ChangeTracker::fresh();
        self.needs_signing = true;
        self.destroyed = true;
        debug!(session_id = ?self.id, "Destroyed session");
        Ok(())
    }

    /// Moves to a new id with an empty record. The record stored under the
    /// old id is left as is.
    ///
    /// # Errors
    ///
    /// Returns an error if no new id could be generated.
    pub async fn restart(&mut self) -> Result<()> {
        let id = self.store.generator().generate(self.store.cache()).await?;
        debug!(old_session_id = ?self.id, session_id = %id, "Restarted session");
        self.id = Some(id);
        self.tracker = ChangeTracker::fresh();
        self.needs_signing = true;
        self.destroyed = false;
        Ok(())
    }

    /// Moves to a new id, keeping the session data. The record stored under
    /// the old id is left as is; call [`destroy`](Self::destroy) first to
    /// remove it.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be fetched or no new id could
    /// be generated.
    pub async fn regenerate(&mut self) -> Result<()> {
        self.load().await?;
        let id = self.store.generator().generate(self.store.cache()).await?;
        debug!(old_session_id = ?self.id, session_id = %id, "Regenerated session id");
        self.id = Some(id);
        self.tracker.mark_all_dirty();
        self.needs_signing = true;
        self.destroyed = false;
        Ok(())
    }
}
