use thiserror::Error;

use crate::cache::store::CacheStoreError;
use crate::token::TokenError;

/// An error that can occur while working with sessions.
///
/// Every variant is fatal to the operation that produced it. A session whose
/// record could not be loaded or persisted, or for which no token could be
/// minted, must not be treated as committed by the caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The backing cache could not be reached or returned an error.
    #[error("session store unavailable: {0}")]
    StoreUnavailable(CacheStoreError),
    /// A session record could not be encoded for the cache, or what the cache
    /// holds under a session key is not a valid record.
    #[error("invalid session record: {0}")]
    InvalidRecord(CacheStoreError),
    /// No unused session id could be found within the configured number of
    /// attempts.
    #[error("could not generate an unused session id after {attempts} attempts")]
    IdGenerationExhausted {
        /// Number of candidates that were checked against the store.
        attempts: u32,
    },
    /// The session token could not be signed.
    #[error("failed to sign session token: {0}")]
    TokenSigning(#[from] TokenError),
    /// A session value could not be converted to or from its stored form.
    #[error("session value serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The session configuration could not be parsed.
    #[error("could not parse session configuration: {0}")]
    LoadConfig(#[from] toml::de::Error),
}

impl From<CacheStoreError> for Error {
    fn from(error: CacheStoreError) -> Self {
        match error {
            CacheStoreError::Backend(_) => Error::StoreUnavailable(error),
            CacheStoreError::Serialize(_) | CacheStoreError::Deserialize(_) => {
                Error::InvalidRecord(error)
            }
        }
    }
}

/// A type alias for a result that can return a [`cache_session::Error`].
pub type Result<T> = std::result::Result<T, Error>;
