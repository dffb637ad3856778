//! Signed session tokens.
//!
//! A token is a derived, never stored, view of a session: a small set of
//! claims signed with the configured secret. Besides the timestamps and the
//! session id, it carries a projection of three session fields (the identity,
//! the associated entity and the impersonation marker). All three are always
//! present in the projection, as `null` when the session does not hold them,
//! so consumers can rely on a stable schema.
//!
//! Signing is delegated to a [`Signer`]. The default one,
//! [`JwtSigner`](jwt::JwtSigner), produces compact HMAC-signed JWTs using
//! the `jsonwebtoken` crate.

pub mod jwt;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_more::with_trait::Debug;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use crate::cache::FieldMap;
use crate::config::{SecretKey, SessionConfig, TokenConfig};
use crate::session::id::SessionId;
use crate::token::jwt::JwtSigner;

const ERROR_PREFIX: &str = "token error:";

/// An error that can occur while signing or verifying a session token.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenError {
    /// No secret is configured.
    #[error("{ERROR_PREFIX} the signing secret is empty")]
    EmptySecret,
    /// The JWT library could not encode or decode the token.
    #[error("{ERROR_PREFIX} jwt error: {0}")]
    Jwt(jsonwebtoken::errors::Error),
    /// The token is not a well-formed compact token.
    #[error("{ERROR_PREFIX} malformed token: {0}")]
    Malformed(String),
    /// The token was signed with a different algorithm than expected.
    #[error("{ERROR_PREFIX} unexpected algorithm: expected {expected}, found {found}")]
    AlgorithmMismatch {
        /// The algorithm the verifier is configured with.
        expected: String,
        /// The algorithm named in the token header.
        found: String,
    },
    /// The signature does not match the token contents.
    #[error("{ERROR_PREFIX} invalid signature")]
    InvalidSignature,
    /// The token is past its expiry.
    #[error("{ERROR_PREFIX} token expired at {0}")]
    Expired(i64),
    /// A custom signer failed.
    #[error("{ERROR_PREFIX} signer error: {0}")]
    Signer(Box<dyn std::error::Error + Send + Sync>),
}

impl TokenError {
    /// Wraps an error raised by a custom [`Signer`].
    pub fn signer<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Signer(error.into())
    }
}

/// The claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// When the token was issued, as a Unix timestamp. Equal to the session's
    /// `last_active` stamp.
    pub iat: i64,
    /// When the token expires, as a Unix timestamp.
    pub exp: i64,
    /// The client address the session is bound to, if known.
    pub ip: Option<IpAddr>,
    /// The id of the session the token was minted for.
    pub jti: SessionId,
    /// The projection of session fields carried by the token.
    pub data: FieldMap,
}

impl Claims {
    /// Returns the projected value of a field, treating `null` as absent.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name).filter(|value| !value.is_null())
    }
}

/// Encodes and decodes signed tokens.
#[cfg_attr(test, automock)]
pub trait Signer: Send + Sync {
    /// Signs the claims with the secret and returns the encoded token.
    ///
    /// # Errors
    ///
    /// Returns an error if the claims could not be serialized or signed.
    fn encode(&self, claims: &Claims, secret: &SecretKey) -> Result<String, TokenError>;

    /// Checks the signature of an encoded token and returns its claims.
    ///
    /// Expiry is not checked here; see [`TokenIssuer::verify`].
    ///
    /// # Errors
    ///
    /// Returns an error if the token is malformed or its signature does not
    /// match.
    fn decode(&self, token: &str, secret: &SecretKey) -> Result<Claims, TokenError>;
}

/// Mints the tokens handed out for sessions.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use cache_session::config::{SecretKey, SessionConfig};
/// use cache_session::session::id::SessionId;
/// use cache_session::token::TokenIssuer;
/// use serde_json::{Map, json};
///
/// let config = SessionConfig::builder()
///     .lifetime(Duration::from_secs(3600))
///     .secret(SecretKey::from("123abc"))
///     .build();
/// let issuer = TokenIssuer::from_config(&config);
///
/// let mut fields = Map::new();
/// fields.insert("user".to_string(), json!("alice"));
/// let token = issuer.issue(&fields, &SessionId::from("abc"), chrono::Utc::now(), None)?;
///
/// let claims = issuer.verify(&token)?;
/// assert_eq!(claims.exp - claims.iat, 3600);
/// assert_eq!(claims.field("user"), Some(&json!("alice")));
/// assert_eq!(claims.field("impersonation"), None);
/// # Ok::<(), cache_session::token::TokenError>(())
/// ```
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    #[debug("..")]
    signer: Arc<dyn Signer>,
    secret: SecretKey,
    lifetime: Duration,
    fields: TokenConfig,
}

impl TokenIssuer {
    /// Creates an issuer using the given signer.
    pub fn new(
        signer: Arc<dyn Signer>,
        secret: SecretKey,
        lifetime: Duration,
        fields: TokenConfig,
    ) -> Self {
        Self {
            signer,
            secret,
            lifetime,
            fields,
        }
    }

    /// Creates an issuer signing JWTs with the configured secret and algorithm.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            Arc::new(JwtSigner::new(config.algorithm)),
            config.secret.clone(),
            config.lifetime,
            config.token.clone(),
        )
    }

    /// Returns a copy of this issuer that signs with `signer`.
    #[must_use]
    pub fn with_signer(&self, signer: Arc<dyn Signer>) -> Self {
        Self {
            signer,
            ..self.clone()
        }
    }

    /// Builds the claims for a session.
    #[must_use]
    pub fn claims(
        &self,
        fields: &FieldMap,
        session_id: &SessionId,
        last_active: DateTime<Utc>,
        client_ip: Option<IpAddr>,
    ) -> Claims {
        let iat = last_active.timestamp();
        let lifetime = i64::try_from(self.lifetime.as_secs()).unwrap_or(i64::MAX);

        let data = [
            &self.fields.identity_field,
            &self.fields.associate_field,
            &self.fields.impersonation_field,
        ]
        .into_iter()
        .map(|name| {
            let value = fields.get(name).cloned().unwrap_or(Value::Null);
            (name.clone(), value)
        })
        .collect();

        Claims {
            iat,
            exp: iat.saturating_add(lifetime),
            ip: client_ip,
            jti: session_id.clone(),
            data,
        }
    }

    /// Builds and signs the claims for a session.
    ///
    /// # Errors
    ///
    /// Returns an error if no secret is configured or the signer fails.
    pub fn issue(
        &self,
        fields: &FieldMap,
        session_id: &SessionId,
        last_active: DateTime<Utc>,
        client_ip: Option<IpAddr>,
    ) -> Result<String, TokenError> {
        if self.secret.is_empty() {
            return Err(TokenError::EmptySecret);
        }

        let claims = self.claims(fields, session_id, last_active, client_ip);
        let token = self.signer.encode(&claims, &self.secret)?;
        trace!(session_id = %session_id, exp = claims.exp, "Issued session token");
        Ok(token)
    }

    /// Checks a token's signature and expiry and returns its claims.
    ///
    /// With a zero lifetime, tokens carry `exp == iat` and live as long as
    /// the session does, so their expiry is not checked.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is malformed, its signature does not
    /// match, or it has expired.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.signer.decode(token, &self.secret)?;
        if !self.lifetime.is_zero() && claims.exp <= Utc::now().timestamp() {
            return Err(TokenError::Expired(claims.exp));
        }
        Ok(claims)
    }
}
