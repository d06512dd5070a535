//! # beacon-server
//!
//! Wiring for the `beacon` binary: configuration, the WebSocket front
//! door, the broker consumer loop and the registry sweeper.

pub mod broker;
pub mod config;
pub mod handlers;
pub mod metrics;

use anyhow::{bail, Context, Result};
use beacon_auth::{Authorizer, HttpKeySource, JwksCache};
use beacon_core::{BroadcastDispatcher, BrokerConsumer, MemoryRegistry};
use beacon_transport::{HttpPushSender, LocalPushHub, PushSender};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::ChannelSource;
use crate::config::{AuthConfig, Config, DeliveryMode, SourceKind};
use crate::handlers::AppState;

/// Build the authorizer and its key set cache.
///
/// Returns `None` when `auth.required` is false.
///
/// # Errors
///
/// Returns an error if auth is required but no key set URL can be derived.
pub fn build_authorizer(auth: &AuthConfig) -> Result<Option<(Authorizer, Arc<JwksCache>)>> {
    if !auth.required {
        warn!("Token verification disabled, connections are identified leniently");
        return Ok(None);
    }

    let Some(url) = auth.jwks_url() else {
        bail!("auth.required is set but no issuer is configured");
    };
    info!(jwks = %url, ttl_secs = auth.jwks_ttl_secs, "Token verification enabled");

    let source = HttpKeySource::new(url).with_timeout(auth.jwks_timeout());
    let cache = Arc::new(JwksCache::new(Arc::new(source), auth.jwks_ttl()));
    let mut authorizer = Authorizer::new(Arc::clone(&cache));
    if let Some(issuer) = auth.issuer() {
        authorizer = authorizer.with_issuer(issuer);
    }
    Ok(Some((authorizer, cache)))
}

/// Run the gateway until ctrl-c.
///
/// # Errors
///
/// Returns an error if the configuration is inconsistent or the server
/// fails to start.
pub async fn run(config: Config) -> Result<()> {
    config.validate()?;

    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let registry = Arc::new(MemoryRegistry::with_ttl(config.registry.ttl()));
    let hub = Arc::new(LocalPushHub::with_capacity(config.delivery.session_capacity));

    let sender: Arc<dyn PushSender> = match config.delivery.mode {
        DeliveryMode::Local => hub.clone(),
        DeliveryMode::Http => {
            let endpoint = config
                .delivery
                .endpoint
                .clone()
                .context("delivery.endpoint is required in http mode")?;
            Arc::new(
                HttpPushSender::with_timeout(endpoint, config.delivery.push_timeout())
                    .context("Failed to build push client")?,
            )
        }
    };
    info!(transport = sender.name(), "Push delivery configured");

    let dispatcher = BroadcastDispatcher::new(registry.clone(), sender);
    let consumer = Arc::new(BrokerConsumer::new(
        config.required_settings(),
        registry.clone(),
        dispatcher,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown = move || {
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    };

    let mut state = AppState::new(config.clone(), registry.clone(), hub);
    let authorizer = build_authorizer(&config.auth)?;
    let jwks = authorizer.as_ref().map(|(_, cache)| Arc::clone(cache));
    if let Some((authorizer, _)) = authorizer {
        state = state.with_authorizer(authorizer);
    }

    let consumer_task = match config.broker.source {
        SourceKind::Channel => {
            let (source, ingest) = ChannelSource::new(
                config.broker.topic.clone(),
                config.broker.batch_size,
                config.broker.linger(),
            );
            state = state.with_ingest(ingest);
            tokio::spawn(broker::run_consumer(source, consumer, shutdown()))
        }
        #[cfg(feature = "kafka")]
        SourceKind::Kafka => {
            let source = broker::KafkaSource::connect(&config.broker)?;
            tokio::spawn(broker::run_consumer(source, consumer, shutdown()))
        }
        #[cfg(not(feature = "kafka"))]
        SourceKind::Kafka => bail!("broker.source = \"kafka\" needs the `kafka` feature"),
    };

    tokio::spawn(broker::run_sweeper(
        registry,
        jwks,
        config.registry.sweep_interval(),
        shutdown(),
    ));

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for ctrl-c"),
        }
        let _ = shutdown_tx.send(true);
    });

    let listener = TcpListener::bind(config.bind_addr()?).await?;
    handlers::serve(listener, Arc::new(state), shutdown()).await?;

    match consumer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Consumer loop failed"),
        Err(e) => error!(error = %e, "Consumer task panicked"),
    }

    info!("Beacon stopped");
    Ok(())
}
