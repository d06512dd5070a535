//! # beacon-auth
//!
//! Bearer token verification for the Beacon transport boundary.
//!
//! - **JwksCache** - Process-wide key set, refreshed wholesale on expiry
//! - **Authorizer** - Verifies a token and produces an allow/deny decision
//! - **claims** - Typed claims and lenient principal extraction
//!
//! ```rust,ignore
//! use beacon_auth::{Authorizer, HttpKeySource, JwksCache};
//! use std::sync::Arc;
//!
//! let issuer = beacon_auth::user_pool_issuer("eu-central-1", "eu-central-1_abc");
//! let cache = JwksCache::with_default_ttl(Arc::new(HttpKeySource::for_issuer(&issuer)));
//! let authorizer = Authorizer::new(Arc::new(cache)).with_issuer(issuer);
//!
//! if authorizer.authorize(Some(token)).await.is_allowed() {
//!     // upgrade the connection
//! }
//! ```

pub mod authorizer;
pub mod claims;
pub mod jwks;

pub use authorizer::{AuthError, Authorizer, Decision};
pub use claims::{display_identity, peek_claims, Claims, TokenClaims, TokenUse, ANONYMOUS};
pub use jwks::{
    jwks_url, user_pool_issuer, HttpKeySource, Jwk, JwkSet, JwksCache, KeySet, KeySource,
    KeySourceError, DEFAULT_JWKS_TIMEOUT, DEFAULT_JWKS_TTL,
};
