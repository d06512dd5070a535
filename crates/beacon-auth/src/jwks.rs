//! JSON Web Key Set fetching and caching.
//!
//! The cache holds one key set for the whole process with a single fetch
//! time. It is refreshed wholesale when empty or past its TTL and is never
//! invalidated any other way. Readers see either the old set or the new
//! one, never a mix.

use async_trait::async_trait;
use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Default key set cache lifetime.
pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(3600);

/// Default bound on a single key set fetch.
pub const DEFAULT_JWKS_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from a key source.
#[derive(Debug, Error)]
pub enum KeySourceError {
    /// HTTP request or body decoding failed.
    #[error("JWKS request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The source could not produce a key set.
    #[error("JWKS unavailable: {0}")]
    Unavailable(String),
}

/// A single JSON Web Key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key id.
    pub kid: String,
    /// Key type (`RSA` is the only one used for verification).
    pub kty: String,
    /// Declared algorithm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Declared use.
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    /// RSA modulus, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA exponent, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

impl Jwk {
    /// Build a verification key from the RSA components.
    ///
    /// Returns `None` for non-RSA keys or malformed components.
    #[must_use]
    pub fn decoding_key(&self) -> Option<DecodingKey> {
        if self.kty != "RSA" {
            return None;
        }
        let (n, e) = (self.n.as_deref()?, self.e.as_deref()?);
        DecodingKey::from_rsa_components(n, e).ok()
    }
}

/// The document served at a JWKS endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    /// Published keys.
    pub keys: Vec<Jwk>,
}

/// A fetched key set indexed by key id.
#[derive(Debug)]
pub struct KeySet {
    keys: HashMap<String, Jwk>,
    fetched_at: Instant,
}

impl KeySet {
    /// Index a fetched key set.
    #[must_use]
    pub fn new(set: JwkSet, fetched_at: Instant) -> Self {
        let keys = set
            .keys
            .into_iter()
            .map(|key| (key.kid.clone(), key))
            .collect();
        Self { keys, fetched_at }
    }

    /// Look up a key by id.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&Jwk> {
        self.keys.get(kid)
    }

    /// Number of keys in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// When the set was fetched.
    #[must_use]
    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    /// Whether the set is still usable at `now` given a cache lifetime.
    #[must_use]
    pub fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.fetched_at) < ttl
    }
}

/// Somewhere a key set can be fetched from.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the current key set.
    async fn fetch(&self) -> Result<JwkSet, KeySourceError>;
}

/// Fetches a key set over HTTPS.
///
/// Each fetch is bounded by a timeout. Fetches run under the cache's
/// refresh lock.
#[derive(Debug, Clone)]
pub struct HttpKeySource {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpKeySource {
    /// Fetch from an explicit JWKS URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout: DEFAULT_JWKS_TIMEOUT,
        }
    }

    /// Bound each fetch by `timeout` instead of the default.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch from the well-known location under an issuer.
    #[must_use]
    pub fn for_issuer(issuer: &str) -> Self {
        Self::new(jwks_url(issuer))
    }

    /// The URL this source fetches from.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Per-fetch timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<JwkSet, KeySourceError> {
        debug!(url = %self.url, "Fetching JWKS");
        let set = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(set)
    }
}

/// Issuer URL of a user pool in a region.
#[must_use]
pub fn user_pool_issuer(region: &str, user_pool_id: &str) -> String {
    format!("https://cognito-idp.{region}.amazonaws.com/{user_pool_id}")
}

/// Well-known JWKS URL under an issuer.
#[must_use]
pub fn jwks_url(issuer: &str) -> String {
    format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/'))
}

/// Process-wide key set cache with get-or-refresh semantics.
pub struct JwksCache {
    source: Arc<dyn KeySource>,
    ttl: Duration,
    current: RwLock<Option<Arc<KeySet>>>,
    /// Serializes refreshes so concurrent misses trigger one fetch.
    refresh: Mutex<()>,
    refreshes: AtomicU64,
}

impl JwksCache {
    /// Create an empty cache over a key source.
    #[must_use]
    pub fn new(source: Arc<dyn KeySource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            current: RwLock::new(None),
            refresh: Mutex::new(()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Create an empty cache with the default one hour lifetime.
    #[must_use]
    pub fn with_default_ttl(source: Arc<dyn KeySource>) -> Self {
        Self::new(source, DEFAULT_JWKS_TTL)
    }

    /// Cache lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of successful fetches so far.
    #[must_use]
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Return the cached set if fresh at `now`, otherwise fetch and swap in
    /// a new one.
    ///
    /// # Errors
    ///
    /// Returns an error if a fetch was needed and failed. The previous set,
    /// if any, stays in place.
    pub async fn get_or_refresh(&self, now: Instant) -> Result<Arc<KeySet>, KeySourceError> {
        if let Some(keys) = self.fresh(now) {
            return Ok(keys);
        }

        let _guard = self.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(keys) = self.fresh(now) {
            return Ok(keys);
        }

        let set = self.source.fetch().await?;
        let keys = Arc::new(KeySet::new(set, now));
        *self.current.write() = Some(Arc::clone(&keys));
        self.refreshes.fetch_add(1, Ordering::Relaxed);

        info!(keys = keys.len(), "JWKS cache refreshed");
        Ok(keys)
    }

    fn fresh(&self, now: Instant) -> Option<Arc<KeySet>> {
        self.current
            .read()
            .as_ref()
            .filter(|keys| keys.is_fresh(now, self.ttl))
            .cloned()
    }
}
