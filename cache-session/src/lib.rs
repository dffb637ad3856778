//! Server-side sessions kept in a key-value cache, exposed to clients as a
//! signed, stateless token.
//!
//! A [`SessionStore`](session::store::SessionStore) is built once from a
//! [`SessionConfig`](config::SessionConfig) and shared between requests. Each
//! request resolves the session id it received (if any) into a
//! [`Session`](session::Session), reads and mutates fields on it, and finally
//! calls [`Session::write`](session::Session::write). Writing persists the
//! whole record under a namespaced key with the configured lifetime and mints
//! a signed token carrying a projection of the record.
//!
//! ## Features
//!
//! * **Lazy or eager loading**: in lazy mode the record is fetched from the
//!   cache on first read; in eager mode it is fetched while resolving.
//!   Fields written before the load always win over the loaded values.
//! * **Collision-free ids**: every generated id is checked against the cache
//!   before it is handed out.
//! * **Stable token schema**: the token always carries the identity,
//!   associated-entity and impersonation fields, even when they are null.
//!
//! ## Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use cache_session::config::{SecretKey, SessionConfig};
//! use cache_session::session::store::SessionStore;
//!
//! # #[tokio::main]
//! # async fn main() -> cache_session::Result<()> {
//! let config = SessionConfig::builder()
//!     .lifetime(Duration::from_secs(3600))
//!     .session_key_namespace("sessions:")
//!     .secret(SecretKey::from("change me"))
//!     .build();
//! let store = SessionStore::from_config(&config)?;
//!
//! let mut session = store.resolve(None).await?;
//! session.set("user", &"alice")?;
//! session.write().await?;
//!
//! let token = session.issued_token().expect("token minted by write");
//! assert_eq!(token.split('.').count(), 3);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod cache;
pub mod config;
mod error;
mod serializers;
pub mod session;
pub mod token;

pub use crate::error::{Error, Result};
