//! Server configuration.
//!
//! Configuration is loaded from the first TOML file found (or the path in
//! `BEACON_CONFIG`), then overridden by `BEACON__*` environment variables.
//! Nested keys use a double underscore: `BEACON__AUTH__REQUIRED=false`.

use ::config::{Environment, File, FileFormat};
use anyhow::{bail, Context, Result};
use beacon_core::RequiredSettings;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// The only supported registry location.
const MEMORY_REGISTRY: &str = "memory";

/// Files searched, in order, when `BEACON_CONFIG` is unset.
const CONFIG_PATHS: [&str; 3] = [
    "beacon.toml",
    "/etc/beacon/beacon.toml",
    "~/.config/beacon/beacon.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket endpoint.
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Token verification at connect time.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Connection registry.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Push delivery.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Batch source.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// WebSocket endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Authorizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Verify tokens before upgrading. When false, connections are accepted
    /// without a token and identified leniently.
    #[serde(default = "default_true")]
    pub required: bool,

    /// Region of the user pool.
    #[serde(default)]
    pub region: Option<String>,

    /// User pool id. Combined with `region` to derive the issuer.
    #[serde(default)]
    pub user_pool_id: Option<String>,

    /// Issuer URL. Takes precedence over `region` + `user_pool_id`.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Key set URL. Defaults to `{issuer}/.well-known/jwks.json`.
    #[serde(default)]
    pub jwks_url: Option<String>,

    /// Key set cache lifetime in seconds.
    #[serde(default = "default_jwks_ttl")]
    pub jwks_ttl_secs: u64,

    /// Key set fetch timeout in milliseconds.
    #[serde(default = "default_jwks_timeout")]
    pub jwks_timeout_ms: u64,
}

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Where registrations are kept. Only `memory` is supported.
    #[serde(default = "default_registry_location")]
    pub location: String,

    /// Registration lifetime in seconds.
    #[serde(default = "default_registry_ttl")]
    pub ttl_secs: u64,

    /// How often expired registrations are swept, in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// How pushes reach clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Sockets held by this process.
    Local,
    /// A remote connection-management endpoint.
    Http,
}

/// Delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Delivery mode.
    #[serde(default = "default_delivery_mode")]
    pub mode: DeliveryMode,

    /// Connection-management endpoint, required in `http` mode.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Per-push timeout in milliseconds (`http` mode).
    #[serde(default = "default_push_timeout")]
    pub push_timeout_ms: u64,

    /// Outbound queue depth per local session.
    #[serde(default = "default_session_capacity")]
    pub session_capacity: usize,
}

/// Where batches come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// In-process channel fed by `POST /ingest`.
    Channel,
    /// Kafka topic (requires the `kafka` feature).
    Kafka,
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Batch source.
    #[serde(default = "default_source")]
    pub source: SourceKind,

    /// Bootstrap servers.
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Topic to consume.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Consumer group.
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Maximum records per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long to wait for a batch to fill, in milliseconds.
    #[serde(default = "default_linger")]
    pub linger_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_jwks_ttl() -> u64 {
    3600 // 1 hour
}

fn default_jwks_timeout() -> u64 {
    5_000
}

fn default_registry_location() -> String {
    MEMORY_REGISTRY.to_string()
}

fn default_registry_ttl() -> u64 {
    2 * 60 * 60 // 2 hours
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_delivery_mode() -> DeliveryMode {
    DeliveryMode::Local
}

fn default_push_timeout() -> u64 {
    5_000
}

fn default_session_capacity() -> usize {
    256
}

fn default_source() -> SourceKind {
    SourceKind::Channel
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_topic() -> String {
    "telemetry".to_string()
}

fn default_group_id() -> String {
    "beacon".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_linger() -> u64 {
    500
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket: WebSocketConfig::default(),
            auth: AuthConfig::default(),
            registry: RegistryConfig::default(),
            delivery: DeliveryConfig::default(),
            broker: BrokerConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required: true,
            region: None,
            user_pool_id: None,
            issuer: None,
            jwks_url: None,
            jwks_ttl_secs: default_jwks_ttl(),
            jwks_timeout_ms: default_jwks_timeout(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            location: default_registry_location(),
            ttl_secs: default_registry_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            mode: default_delivery_mode(),
            endpoint: None,
            push_timeout_ms: default_push_timeout(),
            session_capacity: default_session_capacity(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            brokers: default_brokers(),
            topic: default_topic(),
            group_id: default_group_id(),
            batch_size: default_batch_size(),
            linger_ms: default_linger(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl AuthConfig {
    /// Resolve the token issuer.
    #[must_use]
    pub fn issuer(&self) -> Option<String> {
        if let Some(issuer) = &self.issuer {
            return Some(issuer.trim_end_matches('/').to_string());
        }
        match (&self.region, &self.user_pool_id) {
            (Some(region), Some(pool)) => Some(beacon_auth::user_pool_issuer(region, pool)),
            _ => None,
        }
    }

    /// Resolve the key set URL.
    #[must_use]
    pub fn jwks_url(&self) -> Option<String> {
        self.jwks_url
            .clone()
            .or_else(|| self.issuer().map(|issuer| beacon_auth::jwks_url(&issuer)))
    }

    /// Key set cache lifetime.
    #[must_use]
    pub fn jwks_ttl(&self) -> Duration {
        Duration::from_secs(self.jwks_ttl_secs)
    }

    /// Key set fetch timeout.
    #[must_use]
    pub fn jwks_timeout(&self) -> Duration {
        Duration::from_millis(self.jwks_timeout_ms)
    }
}

impl RegistryConfig {
    /// Registration lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep period.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl DeliveryConfig {
    /// Per-push timeout.
    #[must_use]
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    /// The endpoint pushes go to, if one is configured for this mode.
    #[must_use]
    pub fn push_endpoint(&self) -> Option<String> {
        match self.mode {
            DeliveryMode::Local => Some("local".to_string()),
            DeliveryMode::Http => self.endpoint.clone(),
        }
    }
}

impl BrokerConfig {
    /// Batch fill window.
    #[must_use]
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

impl Config {
    /// Load configuration from the first config file found, layered with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let path = std::env::var("BEACON_CONFIG").ok().or_else(|| {
            CONFIG_PATHS
                .iter()
                .map(|path| shellexpand::tilde(path).into_owned())
                .find(|path| Path::new(path).exists())
        });

        Self::layered(path.as_deref(), Environment::with_prefix("BEACON"))
    }

    fn layered(path: Option<&str>, env: Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder
            .add_source(env.separator("__").try_parsing(true))
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Settings every consume cycle checks before running.
    #[must_use]
    pub fn required_settings(&self) -> RequiredSettings {
        RequiredSettings {
            push_endpoint: self.delivery.push_endpoint(),
            registry_location: Some(self.registry.location.clone()),
        }
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Check settings that only make sense together.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<()> {
        if self.auth.required && self.auth.jwks_url().is_none() {
            bail!(
                "auth.required is set but no issuer is configured; \
                 set auth.issuer or auth.region and auth.user_pool_id"
            );
        }
        if self.delivery.mode == DeliveryMode::Http && self.delivery.endpoint.is_none() {
            bail!("delivery.mode = \"http\" needs delivery.endpoint");
        }
        match self.registry.location.trim() {
            "" => bail!("registry.location must be set"),
            MEMORY_REGISTRY => {}
            other => bail!("Unsupported registry.location {other:?}, expected \"memory\""),
        }
        if self.broker.batch_size == 0 {
            bail!("broker.batch_size must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix("BEACON").source(Some(map))
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.websocket.path, "/ws");
        assert!(config.auth.required);
        assert_eq!(config.delivery.mode, DeliveryMode::Local);
        assert_eq!(config.broker.source, SourceKind::Channel);
        assert_eq!(config.registry.ttl(), Duration::from_secs(7200));
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [auth]
            region = "eu-central-1"
            user_pool_id = "eu-central-1_abc"

            [delivery]
            mode = "http"
            endpoint = "https://push.example.com/prod"

            [broker]
            source = "kafka"
            topic = "stb-telemetry"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(
            config.auth.jwks_url().unwrap(),
            "https://cognito-idp.eu-central-1.amazonaws.com/eu-central-1_abc/.well-known/jwks.json"
        );
        assert_eq!(config.delivery.mode, DeliveryMode::Http);
        assert_eq!(config.broker.source, SourceKind::Kafka);
        assert_eq!(config.broker.topic, "stb-telemetry");
        assert_eq!(config.broker.batch_size, 100);
        assert_eq!(config.auth.jwks_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::layered(
            None,
            env(&[
                ("BEACON__PORT", "9100"),
                ("BEACON__AUTH__REQUIRED", "false"),
                ("BEACON__BROKER__BATCH_SIZE", "25"),
                ("BEACON__AUTH__JWKS_TIMEOUT_MS", "750"),
            ]),
        )
        .unwrap();

        assert_eq!(config.port, 9100);
        assert!(!config.auth.required);
        assert_eq!(config.broker.batch_size, 25);
        assert_eq!(config.auth.jwks_timeout(), Duration::from_millis(750));
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_validate() {
        // Auth on by default, with nowhere to fetch keys from
        assert!(Config::default().validate().is_err());

        let mut config = Config::default();
        config.auth.required = false;
        assert!(config.validate().is_ok());

        config.delivery.mode = DeliveryMode::Http;
        assert!(config.validate().is_err());
        config.delivery.mode = DeliveryMode::Local;

        config.registry.location = "  ".to_string();
        assert!(config.validate().is_err());

        config.registry.location = "dynamodb://connections".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dynamodb://connections"));

        config.registry.location = "memory".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_required_settings() {
        let mut config = Config::default();
        assert!(config.required_settings().validate().is_ok());

        config.registry.location = String::new();
        assert!(config.required_settings().validate().is_err());
    }
}
