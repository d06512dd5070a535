//! Bearer token authorizer.
//!
//! Verifies RSA-signed JWTs against the cached key set and turns the
//! outcome into an allow/deny decision for the transport boundary.

use jsonwebtoken::{decode, decode_header, errors::ErrorKind, Algorithm, Validation};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::claims::{Claims, TokenClaims, TokenUse};
use crate::jwks::JwksCache;

/// Reasons a token is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Not a three-segment JWT, or the header is unreadable.
    #[error("Invalid token format")]
    InvalidFormat,

    /// No key in the key set matches the token's `kid`.
    #[error("Signing key not found")]
    KeyNotFound,

    /// Signature or issuer check failed.
    #[error("Token verification failed")]
    VerificationFailed,

    /// The token is past its expiry.
    #[error("Token expired")]
    Expired,

    /// `token_use` is neither `id` nor `access`.
    #[error("Invalid token use")]
    InvalidUse,

    /// The key set could not be fetched.
    #[error("Key set unavailable: {0}")]
    KeySetUnavailable(String),
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Connection may proceed as this principal.
    Allow(Claims),
    /// Connection must be refused.
    Deny(AuthError),
}

impl Decision {
    /// Whether the connection may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    /// The allowed principal, if any.
    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        match self {
            Decision::Allow(claims) => Some(&claims.principal),
            Decision::Deny(_) => None,
        }
    }
}

/// Verifies bearer tokens.
pub struct Authorizer {
    cache: Arc<JwksCache>,
    issuer: Option<String>,
}

impl Authorizer {
    /// Create an authorizer over a key set cache.
    #[must_use]
    pub fn new(cache: Arc<JwksCache>) -> Self {
        Self {
            cache,
            issuer: None,
        }
    }

    /// Require the `iss` claim to equal `issuer`.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Verify a token now.
    ///
    /// # Errors
    ///
    /// Returns the first check that failed.
    pub async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.verify_at(token, Instant::now()).await
    }

    /// Verify a token, using `now` for key set cache freshness.
    ///
    /// Expiry is always checked against the wall clock.
    ///
    /// # Errors
    ///
    /// Returns the first check that failed.
    pub async fn verify_at(&self, token: &str, now: Instant) -> Result<Claims, AuthError> {
        if token.split('.').count() != 3 {
            return Err(AuthError::InvalidFormat);
        }

        let header = decode_header(token).map_err(|_| AuthError::InvalidFormat)?;
        let kid = header.kid.ok_or(AuthError::KeyNotFound)?;

        let keys = self
            .cache
            .get_or_refresh(now)
            .await
            .map_err(|e| AuthError::KeySetUnavailable(e.to_string()))?;
        let jwk = keys.get(&kid).ok_or(AuthError::KeyNotFound)?;

        if !is_rsa(header.alg) {
            debug!(alg = ?header.alg, "Rejecting non-RSA token");
            return Err(AuthError::VerificationFailed);
        }
        let key = jwk.decoding_key().ok_or(AuthError::VerificationFailed)?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = 0;
        validation.validate_aud = false;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }

        let data = decode::<TokenClaims>(token, &key, &validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::VerificationFailed,
        })?;

        let token_use = data
            .claims
            .token_use
            .as_deref()
            .and_then(TokenUse::parse)
            .ok_or(AuthError::InvalidUse)?;

        Ok(Claims::from_verified(data.claims, token_use, kid))
    }

    /// Make an allow/deny decision for an optional token.
    ///
    /// A missing token is denied as malformed. Never errors.
    pub async fn authorize(&self, token: Option<&str>) -> Decision {
        let Some(token) = token else {
            return Decision::Deny(AuthError::InvalidFormat);
        };

        match self.verify(token).await {
            Ok(claims) => {
                debug!(principal = %claims.principal, "Token allowed");
                Decision::Allow(claims)
            }
            Err(e) => {
                warn!(reason = %e, "Token denied");
                Decision::Deny(e)
            }
        }
    }
}

fn is_rsa(alg: Algorithm) -> bool {
    matches!(
        alg,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwks::{Jwk, JwkSet, KeySource, KeySourceError};
    use async_trait::async_trait;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    const SIGNING_KEY: &str = include_str!("../testdata/signing_key.pem");
    const ROGUE_KEY: &str = include_str!("../testdata/rogue_key.pem");
    const SIGNING_KEY_N: &str = include_str!("../testdata/signing_key.n");
    const KID: &str = "test-key-1";
    const ISSUER: &str = "https://cognito-idp.eu-central-1.amazonaws.com/eu-central-1_test";

    fn signing_jwk(kid: &str) -> Jwk {
        Jwk {
            kid: kid.to_string(),
            kty: "RSA".to_string(),
            alg: Some("RS256".to_string()),
            key_use: Some("sig".to_string()),
            n: Some(SIGNING_KEY_N.trim().to_string()),
            e: Some("AQAB".to_string()),
        }
    }

    struct StaticSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl KeySource for StaticSource {
        async fn fetch(&self) -> Result<JwkSet, KeySourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(JwkSet {
                keys: vec![signing_jwk(KID)],
            })
        }
    }

    /// Publishes `KID` on the first fetch and only `rotated` afterwards.
    struct RotatingSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl KeySource for RotatingSource {
        async fn fetch(&self) -> Result<JwkSet, KeySourceError> {
            let kid = match self.fetches.fetch_add(1, Ordering::SeqCst) {
                0 => KID,
                _ => "rotated",
            };
            Ok(JwkSet {
                keys: vec![signing_jwk(kid)],
            })
        }
    }

    fn authorizer() -> (Authorizer, Arc<StaticSource>) {
        let source = Arc::new(StaticSource {
            fetches: AtomicUsize::new(0),
        });
        let cache = Arc::new(JwksCache::new(source.clone(), Duration::from_secs(3600)));
        (Authorizer::new(cache), source)
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn claims(extra: Value) -> Value {
        let mut base = json!({
            "sub": "5f1c",
            "iss": ISSUER,
            "token_use": "id",
            "exp": now_secs() + 600,
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        base
    }

    fn sign_with(pem: &str, kid: Option<&str>, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = kid.map(str::to_string);
        encode(
            &header,
            claims,
            &EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap(),
        )
        .unwrap()
    }

    fn sign(claims: &Value) -> String {
        sign_with(SIGNING_KEY, Some(KID), claims)
    }

    #[tokio::test]
    async fn test_valid_token() {
        let (auth, _) = authorizer();
        let token = sign(&claims(json!({"cognito:username": "alice", "email": "a@x.io"})));

        let verified = auth.verify(&token).await.unwrap();
        assert_eq!(verified.principal, "alice");
        assert_eq!(verified.email.as_deref(), Some("a@x.io"));
        assert_eq!(verified.token_use, TokenUse::Id);
        assert_eq!(verified.key_id, KID);
    }

    #[tokio::test]
    async fn test_principal_falls_back_to_email() {
        let (auth, _) = authorizer();
        let token = sign(&claims(json!({"email": "bob@x.io", "token_use": "access"})));

        let verified = auth.verify(&token).await.unwrap();
        assert_eq!(verified.principal, "bob@x.io");
        assert_eq!(verified.token_use, TokenUse::Access);
    }

    #[tokio::test]
    async fn test_second_verify_does_not_fetch() {
        let (auth, source) = authorizer();
        let token = sign(&claims(json!({"username": "carol"})));

        let first = auth.verify(&token).await.unwrap();
        let second = auth.verify(&token).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_segment_count() {
        let (auth, source) = authorizer();
        for token in ["", "abc", "a.b", "a.b.c.d", "a..b.c"] {
            assert_eq!(auth.verify(token).await, Err(AuthError::InvalidFormat));
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_garbage_header() {
        let (auth, _) = authorizer();
        assert_eq!(
            auth.verify("###.e30.sig").await,
            Err(AuthError::InvalidFormat)
        );
    }

    #[tokio::test]
    async fn test_unknown_kid() {
        let (auth, _) = authorizer();
        let token = sign_with(SIGNING_KEY, Some("rotated-away"), &claims(json!({})));
        assert_eq!(auth.verify(&token).await, Err(AuthError::KeyNotFound));

        let token = sign_with(SIGNING_KEY, None, &claims(json!({})));
        assert_eq!(auth.verify(&token).await, Err(AuthError::KeyNotFound));
    }

    #[tokio::test]
    async fn test_bad_signature() {
        let (auth, _) = authorizer();
        let token = sign_with(ROGUE_KEY, Some(KID), &claims(json!({})));
        assert_eq!(auth.verify(&token).await, Err(AuthError::VerificationFailed));
    }

    #[tokio::test]
    async fn test_expired() {
        let (auth, _) = authorizer();
        let token = sign(&claims(json!({"exp": now_secs() - 5})));
        assert_eq!(auth.verify(&token).await, Err(AuthError::Expired));
    }

    #[tokio::test]
    async fn test_invalid_use() {
        let (auth, _) = authorizer();
        let token = sign(&claims(json!({"token_use": "refresh"})));
        assert_eq!(auth.verify(&token).await, Err(AuthError::InvalidUse));

        let mut no_use = claims(json!({}));
        no_use.as_object_mut().unwrap().remove("token_use");
        assert_eq!(auth.verify(&sign(&no_use)).await, Err(AuthError::InvalidUse));
    }

    #[tokio::test]
    async fn test_issuer_pinning() {
        let (auth, _) = authorizer();
        let auth = auth.with_issuer(ISSUER);
        assert!(auth.verify(&sign(&claims(json!({})))).await.is_ok());

        let token = sign(&claims(json!({"iss": "https://evil.example"})));
        assert_eq!(auth.verify(&token).await, Err(AuthError::VerificationFailed));
    }

    #[tokio::test]
    async fn test_authorize_decisions() {
        let (auth, _) = authorizer();

        let decision = auth.authorize(None).await;
        assert_eq!(decision, Decision::Deny(AuthError::InvalidFormat));
        assert!(!decision.is_allowed());

        let token = sign(&claims(json!({"username": "dave"})));
        let decision = auth.authorize(Some(&token)).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.principal(), Some("dave"));
    }

    #[tokio::test]
    async fn test_rotation_drops_old_keys() {
        let source = Arc::new(RotatingSource {
            fetches: AtomicUsize::new(0),
        });
        let cache = Arc::new(JwksCache::new(source, Duration::from_secs(60)));
        let auth = Authorizer::new(Arc::clone(&cache));
        let token = sign(&claims(json!({"username": "erin"})));
        let t0 = Instant::now();

        assert!(auth.verify_at(&token, t0).await.is_ok());

        let later = t0 + Duration::from_secs(61);
        assert_eq!(auth.verify_at(&token, later).await, Err(AuthError::KeyNotFound));

        let keys = cache.get_or_refresh(later).await.unwrap();
        assert!(keys.get(KID).is_none());
        assert_eq!(keys.len(), 1);

        let rotated = sign_with(SIGNING_KEY, Some("rotated"), &claims(json!({})));
        assert!(auth.verify_at(&rotated, later).await.is_ok());
    }
}
