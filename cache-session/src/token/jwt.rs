//! Compact HMAC-signed JSON Web Tokens.
//!
//! Encoding and verification are delegated to the `jsonwebtoken` crate. Only
//! the HMAC family of algorithms is supported, and the algorithm named in a
//! token header must match the configured one.

use jsonwebtoken::errors::{Error as JwtError, ErrorKind};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};

use crate::config::{Algorithm, SecretKey};
use crate::token::{Claims, Signer, TokenError};

/// A [`Signer`] producing HMAC-signed JWTs.
///
/// # Examples
///
/// ```
/// use cache_session::config::{Algorithm, SecretKey};
/// use cache_session::session::id::SessionId;
/// use cache_session::token::jwt::JwtSigner;
/// use cache_session::token::{Claims, Signer};
/// use serde_json::Map;
///
/// let signer = JwtSigner::new(Algorithm::Hs512);
/// let secret = SecretKey::from("123abc");
/// let claims = Claims {
///     iat: 0,
///     exp: 60,
///     ip: None,
///     jti: SessionId::from("abc"),
///     data: Map::new(),
/// };
///
/// let token = signer.encode(&claims, &secret)?;
/// assert_eq!(signer.decode(&token, &secret)?, claims);
/// # Ok::<(), cache_session::token::TokenError>(())
/// ```
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct JwtSigner {
    algorithm: Algorithm,
}

impl JwtSigner {
    /// Creates a signer using `algorithm`.
    #[must_use]
    pub fn new(algorithm: Algorithm) -> Self {
        Self { algorithm }
    }

    /// Returns the algorithm tokens are signed with.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn jwt_algorithm(&self) -> jsonwebtoken::Algorithm {
        match self.algorithm {
            Algorithm::Hs256 => jsonwebtoken::Algorithm::HS256,
            Algorithm::Hs384 => jsonwebtoken::Algorithm::HS384,
            Algorithm::Hs512 => jsonwebtoken::Algorithm::HS512,
        }
    }

    fn validation(&self) -> Validation {
        // expiry is checked by `TokenIssuer::verify`
        let mut validation = Validation::new(self.jwt_algorithm());
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation
    }
}

fn token_error(error: JwtError) -> TokenError {
    match error.kind() {
        ErrorKind::InvalidSignature => TokenError::InvalidSignature,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            TokenError::Malformed(error.to_string())
        }
        _ => TokenError::Jwt(error),
    }
}

impl Signer for JwtSigner {
    fn encode(&self, claims: &Claims, secret: &SecretKey) -> Result<String, TokenError> {
        let header = Header::new(self.jwt_algorithm());
        jsonwebtoken::encode(&header, claims, &EncodingKey::from_secret(secret.as_bytes()))
            .map_err(token_error)
    }

    fn decode(&self, token: &str, secret: &SecretKey) -> Result<Claims, TokenError> {
        let header = jsonwebtoken::decode_header(token).map_err(token_error)?;
        let expected = self.jwt_algorithm();
        if header.alg != expected {
            return Err(TokenError::AlgorithmMismatch {
                expected: self.algorithm.to_string(),
                found: format!("{:?}", header.alg),
            });
        }

        jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &self.validation(),
        )
        .map(|data| data.claims)
        .map_err(token_error)
    }
}
