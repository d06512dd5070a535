//! HTTP and WebSocket handlers for the Beacon server.
//!
//! The token is checked before the upgrade. Once upgraded, the socket loop
//! drains the connection's hub queue and answers control messages until
//! either side closes.

use crate::broker::IngestHandle;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use beacon_auth::{Authorizer, Decision};
use beacon_core::{ConnectionLifecycleHandler, MemoryRegistry, Session};
use beacon_protocol::{codec, ServerMessage};
use beacon_transport::{ConnectionId, LocalPushHub};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Token verifier. `None` accepts every connection.
    pub authorizer: Option<Authorizer>,
    /// Connection registry.
    pub registry: Arc<MemoryRegistry>,
    /// Sessions held by this process.
    pub hub: Arc<LocalPushHub>,
    /// Connect, disconnect and control handling.
    pub lifecycle: ConnectionLifecycleHandler,
    /// Producer for the in-process batch source, if enabled.
    pub ingest: Option<IngestHandle>,
}

impl AppState {
    /// Create state with no authorizer and no ingest endpoint.
    #[must_use]
    pub fn new(config: Config, registry: Arc<MemoryRegistry>, hub: Arc<LocalPushHub>) -> Self {
        Self {
            config,
            authorizer: None,
            lifecycle: ConnectionLifecycleHandler::new(registry.clone()),
            registry,
            hub,
            ingest: None,
        }
    }

    /// Verify tokens before upgrading.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Authorizer) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Accept records on `POST /ingest`.
    #[must_use]
    pub fn with_ingest(mut self, ingest: IngestHandle) -> Self {
        self.ingest = Some(ingest);
        self
    }
}

/// Connect query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Bearer token.
    pub token: Option<String>,
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.websocket.path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/ingest", post(ingest_handler))
        .with_state(state)
}

/// Serve until `shutdown` completes.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("Beacon server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, state.config.websocket.path);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "registered": state.registry.len(),
        "sessions": state.hub.len(),
    }))
}

/// Ingest handler. The body is one broker record.
async fn ingest_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Some(ingest) = &state.ingest else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match ingest.publish(body).await {
        Ok(offset) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "offset": offset })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Ingest failed");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(authorizer) = &state.authorizer {
        match authorizer.authorize(params.token.as_deref()).await {
            Decision::Allow(claims) => {
                debug!(principal = %claims.principal, "Connection authorized");
            }
            Decision::Deny(e) => {
                warn!(error = %e, "Connection refused");
                metrics::record_auth_denied(&e);
                return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
            }
        }
    }

    ws.max_message_size(state.config.websocket.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, params.token))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    let mut session = Session::new(connection_id.as_str());

    // Attach before registering so no broadcast finds the id without a queue.
    let mut queue = state.hub.attach(connection_id.as_str());
    if let Err(e) = state.lifecycle.open(&mut session, token.as_deref()).await {
        error!(connection = %connection_id, error = %e, "Registration failed, closing");
        metrics::record_error("register");
        state.hub.detach(connection_id.as_str());
        return;
    }

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            biased;

            Some(payload) = queue.recv() => {
                metrics::record_message(payload.len(), "outbound");
                // Frames are encoded JSON, so the lossy path never substitutes.
                let text = String::from_utf8_lossy(&payload).into_owned();
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if reply(&state, &connection_id, text.as_bytes(), &mut sender).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if reply(&state, &connection_id, &data, &mut sender).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.hub.detach(connection_id.as_str());
    if let Some(ack) = state.lifecycle.close(&mut session).await {
        if ack.internal_error.is_some() {
            metrics::record_error("deregister");
        }
    }
}

/// Answer one control message.
async fn reply(
    state: &AppState,
    connection_id: &ConnectionId,
    body: &[u8],
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<()> {
    metrics::record_message(body.len(), "inbound");
    let response = state
        .lifecycle
        .on_control_message(connection_id.as_str(), body);
    send_message(sender, &response).await
}

/// Send a frame to the WebSocket.
async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<()> {
    let data = codec::encode(message)?;
    metrics::record_message(data.len(), "outbound");
    sender
        .send(Message::Text(String::from_utf8(data.to_vec())?))
        .await?;
    Ok(())
}
