//! Connection lifecycle.
//!
//! A push connection moves `Unconnected -> Connected -> Disconnected`.
//! `Disconnected` is terminal; a client that reconnects gets a new
//! connection id. Control messages are answered in place and never touch
//! registry membership.

use beacon_auth::display_identity;
use beacon_protocol::{codec, ControlAction, ServerMessage};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::registry::ConnectionRegistry;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted by the transport but not registered yet.
    Unconnected,
    /// Registered and eligible for broadcasts.
    Connected,
    /// Closed. Terminal.
    Disconnected,
}

/// Per-connection state tracked by the socket owner.
#[derive(Debug, Clone)]
pub struct Session {
    connection_id: String,
    user_id: Option<String>,
    state: ConnectionState,
}

impl Session {
    /// Create a session for a freshly accepted connection.
    #[must_use]
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: None,
            state: ConnectionState::Unconnected,
        }
    }

    /// Connection ID.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Identity registered for this connection, once connected.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

/// Acknowledgment returned for every disconnect.
///
/// Disconnects always succeed from the client's point of view. A registry
/// failure is kept here for logging and metrics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectAck {
    /// Connection that disconnected.
    pub connection_id: String,
    /// Registry error swallowed during the disconnect, if any.
    pub internal_error: Option<RegistryError>,
}

/// Drives the registry from connect, disconnect and control events.
pub struct ConnectionLifecycleHandler {
    registry: Arc<dyn ConnectionRegistry>,
}

impl ConnectionLifecycleHandler {
    /// Create a handler.
    #[must_use]
    pub fn new(registry: Arc<dyn ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Register a new connection.
    ///
    /// The identity is read leniently from the token payload; the signature
    /// is checked at the transport boundary, not here. Returns the identity
    /// that was registered.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the registry write fails. The connection
    /// should be refused in that case.
    pub async fn on_connect(
        &self,
        connection_id: &str,
        token: Option<&str>,
    ) -> Result<String, RegistryError> {
        let user_id = display_identity(token);
        self.registry.register(connection_id, &user_id).await?;
        info!(connection = %connection_id, user = %user_id, "Client connected");
        Ok(user_id)
    }

    /// Deregister a connection.
    pub async fn on_disconnect(&self, connection_id: &str) -> DisconnectAck {
        let internal_error = match self.registry.deregister(connection_id).await {
            Ok(()) => {
                info!(connection = %connection_id, "Client disconnected");
                None
            }
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Deregister failed on disconnect");
                Some(e)
            }
        };

        DisconnectAck {
            connection_id: connection_id.to_string(),
            internal_error,
        }
    }

    /// Answer a control message.
    #[must_use]
    pub fn on_control_message(&self, connection_id: &str, body: &[u8]) -> ServerMessage {
        let action = match codec::decode_control(body) {
            Ok(request) => request.kind(),
            Err(e) => {
                debug!(connection = %connection_id, error = %e, "Unparseable control message");
                ControlAction::Other
            }
        };

        debug!(connection = %connection_id, action = ?action, "Control message");

        match action {
            ControlAction::Ping => ServerMessage::pong(),
            ControlAction::Subscribe => ServerMessage::subscribed(),
            ControlAction::Other => ServerMessage::ack(),
        }
    }

    /// Move a session from `Unconnected` to `Connected`.
    ///
    /// A session that is already connected or closed is left as is.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if registration fails. The session is
    /// closed in that case.
    pub async fn open(&self, session: &mut Session, token: Option<&str>) -> Result<(), RegistryError> {
        if session.state != ConnectionState::Unconnected {
            warn!(
                connection = %session.connection_id,
                state = ?session.state,
                "Ignoring connect for session that is not new"
            );
            return Ok(());
        }

        match self.on_connect(&session.connection_id, token).await {
            Ok(user_id) => {
                session.user_id = Some(user_id);
                session.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                session.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Close a session.
    ///
    /// Only a connected session touches the registry. Closing twice is a
    /// no-op.
    pub async fn close(&self, session: &mut Session) -> Option<DisconnectAck> {
        let previous = std::mem::replace(&mut session.state, ConnectionState::Disconnected);
        match previous {
            ConnectionState::Connected => Some(self.on_disconnect(&session.connection_id).await),
            ConnectionState::Unconnected | ConnectionState::Disconnected => None,
        }
    }
}
