//! HTTP key source tests against a mock JWKS endpoint.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use beacon_auth::{AuthError, Authorizer, HttpKeySource, JwksCache, KeySourceError};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const JWKS_PATH: &str = "/eu-central-1_test/.well-known/jwks.json";

fn single_key(kid: &str) -> serde_json::Value {
    json!({
        "keys": [{"kid": kid, "kty": "RSA", "alg": "RS256", "use": "sig", "n": "sXch", "e": "AQAB"}]
    })
}

/// A token whose header names `kid`. Only the header is read before the
/// key lookup.
fn token_for(kid: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(json!({"alg": "RS256", "kid": kid}).to_string());
    let body = URL_SAFE_NO_PAD.encode(br#"{"token_use":"id"}"#);
    format!("{header}.{body}.c2ln")
}

fn jwks_body() -> serde_json::Value {
    json!({
        "keys": [
            {"kid": "k1", "kty": "RSA", "alg": "RS256", "use": "sig", "n": "sXch", "e": "AQAB"},
            {"kid": "k2", "kty": "RSA", "alg": "RS256", "use": "sig", "n": "uXch", "e": "AQAB"}
        ]
    })
}

#[tokio::test]
async fn test_fetches_once_within_ttl_and_again_after_expiry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body()))
        .expect(2)
        .mount(&server)
        .await;

    let issuer = format!("{}/eu-central-1_test", server.uri());
    let source = HttpKeySource::for_issuer(&issuer);
    assert!(source.url().ends_with(JWKS_PATH));

    let cache = JwksCache::new(Arc::new(source), Duration::from_secs(3600));
    let t0 = Instant::now();

    let keys = cache.get_or_refresh(t0).await.expect("first fetch");
    assert_eq!(keys.len(), 2);
    assert!(keys.get("k1").is_some());

    cache
        .get_or_refresh(t0 + Duration::from_secs(1800))
        .await
        .expect("cached");
    cache
        .get_or_refresh(t0 + Duration::from_secs(3601))
        .await
        .expect("refreshed");

    // `expect(2)` is verified when the server drops.
}

#[tokio::test]
async fn test_server_error_is_reported_and_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body()))
        .mount(&server)
        .await;

    let source = HttpKeySource::new(format!("{}{}", server.uri(), JWKS_PATH));
    let cache = JwksCache::with_default_ttl(Arc::new(source));
    let now = Instant::now();

    match cache.get_or_refresh(now).await {
        Err(KeySourceError::Http(_)) => {}
        other => panic!("Expected Http error, got {:?}", other.map(|k| k.len())),
    }

    let keys = cache.get_or_refresh(now).await.expect("retry succeeds");
    assert_eq!(keys.len(), 2);
}

#[tokio::test]
async fn test_hung_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(jwks_body())
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let source = HttpKeySource::new(format!("{}{}", server.uri(), JWKS_PATH))
        .with_timeout(Duration::from_millis(200));
    let cache = Arc::new(JwksCache::with_default_ttl(Arc::new(source)));

    let started = Instant::now();
    match cache.get_or_refresh(Instant::now()).await {
        Err(KeySourceError::Http(e)) => assert!(e.is_timeout()),
        other => panic!("Expected timeout, got {:?}", other.map(|k| k.len())),
    }

    let authorizer = Authorizer::new(cache);
    assert!(matches!(
        authorizer.verify(&token_for("k1")).await,
        Err(AuthError::KeySetUnavailable(_))
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_refresh_replaces_rotated_keys() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(single_key("k1")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(single_key("k2")))
        .mount(&server)
        .await;

    let source = HttpKeySource::new(format!("{}{}", server.uri(), JWKS_PATH));
    let cache = Arc::new(JwksCache::new(Arc::new(source), Duration::from_secs(60)));
    let authorizer = Authorizer::new(Arc::clone(&cache));
    let t0 = Instant::now();

    let before = cache.get_or_refresh(t0).await.expect("first fetch");
    assert!(before.get("k1").is_some());

    let later = t0 + Duration::from_secs(61);
    let after = cache.get_or_refresh(later).await.expect("refreshed");
    assert!(after.get("k1").is_none());
    assert!(after.get("k2").is_some());
    assert_eq!(after.len(), 1);

    assert_eq!(
        authorizer.verify_at(&token_for("k1"), later).await,
        Err(AuthError::KeyNotFound)
    );
}
