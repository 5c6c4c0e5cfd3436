//! Main relay client with builder pattern.
//!
//! Provides the public handle for joining rooms, identifying, broadcasting,
//! and observing connection state. All the actual work happens in two
//! background tasks spawned by [`RelayClientBuilder::build`]: the token
//! bridge (identity changes → credentials) and the connection manager
//! (credentials → live session → readiness).

use crate::{
    connection::{connection_manager_task, Cmd, ConnectionState},
    error::{RelayLinkError, Result},
    event_handlers::EventHandlers,
    identity::{token_bridge_task, IdentityProvider},
    protocol::{AckResponse, BroadcastScope},
    timeouts::RelayTimeouts,
    transport::{resolve_endpoint, ConnectionOptions, Transport, WsTransport},
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

const CMD_CHANNEL_CAPACITY: usize = 64;
const CREDENTIAL_CHANNEL_CAPACITY: usize = 8;
const SYSTEM_EVENT_CAPACITY: usize = 64;

/// Main relay client.
///
/// Use [`RelayClientBuilder`] to construct instances with custom configuration.
/// The client is cheap to clone; all clones share the same underlying session.
/// When the last clone is dropped, the background tasks shut down and any
/// parked operations resolve to a failure response.
///
/// # Examples
///
/// ```rust,no_run
/// use relay_link::{Principal, RelayClient, StaticIdentity};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = RelayClient::builder()
///     .relay_url("https://relay.example.com")
///     .identity(Arc::new(StaticIdentity::new(Principal::new("user-1"), "token-abc")))
///     .build()?;
///
/// let response = client.join_room("court-5").await;
/// println!("joined: {}", response.success);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RelayClient {
    cmd_tx: mpsc::Sender<Cmd>,
    state_rx: watch::Receiver<ConnectionState>,
    ready_rx: watch::Receiver<bool>,
    session_rx: watch::Receiver<bool>,
    system_tx: broadcast::Sender<Value>,
}

impl RelayClient {
    /// Create a new builder for configuring the client
    pub fn builder() -> RelayClientBuilder {
        RelayClientBuilder::new()
    }

    /// Join a room, waiting for the connection to become ready first.
    ///
    /// With no session even in flight the call fails immediately. Otherwise it
    /// parks until the session is ready (no timeout; readiness can arrive
    /// after an arbitrary reconnect or re-auth delay), then sends `unirse` and
    /// waits for the server acknowledgment. Every call resolves exactly once;
    /// a session lost while parked or mid-flight resolves to a failure
    /// response rather than an error.
    pub async fn join_room(&self, room: impl Into<String>) -> AckResponse {
        let room = room.into();
        self.gated(move |result_tx| Cmd::JoinRoom { room, result_tx })
            .await
    }

    /// Announce the caller's identity to the relay (`identificar`).
    ///
    /// Gated and acknowledged the same way as [`join_room`](Self::join_room).
    pub async fn identify(&self, user_id: impl Into<String>) -> AckResponse {
        let user_id = user_id.into();
        self.gated(move |result_tx| Cmd::Identify { user_id, result_tx })
            .await
    }

    /// Broadcast a notification (`notificar`) to the given scope.
    ///
    /// Fire-and-forget: silently a no-op when not connected.
    pub async fn notify(&self, data: Value, scope: BroadcastScope) {
        let _ = self.cmd_tx.send(Cmd::Notify { data, scope }).await;
    }

    /// Relay an arbitrary payload (`relay`) to the given scope.
    ///
    /// Fire-and-forget: silently a no-op when not connected.
    pub async fn send(&self, data: Value, scope: BroadcastScope) {
        let _ = self.cmd_tx.send(Cmd::Relay { data, scope }).await;
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection state changes. The receiver observes the current
    /// state immediately and every transition after it.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Watch the readiness gate: `true` exactly while the session is
    /// server-acknowledged. New receivers see the current value immediately;
    /// rapid flips may coalesce to the latest value.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    /// Subscribe to server `system` events.
    ///
    /// Events published before the subscription are not replayed, and a slow
    /// subscriber can lag (dropping the oldest events) without affecting the
    /// connection or other subscribers.
    pub fn system_events(&self) -> broadcast::Receiver<Value> {
        self.system_tx.subscribe()
    }

    /// Tear down the session and stop the background tasks.
    ///
    /// Parked [`join_room`](Self::join_room)/[`identify`](Self::identify)
    /// calls resolve to a failure response. Dropping the last client clone
    /// has the same effect.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Cmd::Shutdown).await;
    }

    /// Park until ready, then dispatch an acknowledged command.
    async fn gated(&self, make_cmd: impl FnOnce(tokio::sync::oneshot::Sender<AckResponse>) -> Cmd) -> AckResponse {
        // Disconnected alone is not terminal: the session handle survives the
        // transport's reconnect windows, and a parked call executes after the
        // next re-promotion to Ready. Only "no session exists at all" has
        // nothing to wait on.
        if self.state() == ConnectionState::Disconnected && !*self.session_rx.borrow() {
            return AckResponse::failure("Relay session not initialized");
        }

        let mut ready = self.ready_rx.clone();
        if ready.wait_for(|r| *r).await.is_err() {
            return AckResponse::failure("Relay client shut down");
        }

        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        if self.cmd_tx.send(make_cmd(result_tx)).await.is_err() {
            return AckResponse::failure("Relay client shut down");
        }
        result_rx
            .await
            .unwrap_or_else(|_| AckResponse::failure("Relay client shut down"))
    }
}

/// Builder for configuring [`RelayClient`] instances.
pub struct RelayClientBuilder {
    relay_url: Option<String>,
    identity: Option<Arc<dyn IdentityProvider>>,
    timeouts: RelayTimeouts,
    connection_options: ConnectionOptions,
    handlers: EventHandlers,
    transport: Option<Arc<dyn Transport>>,
}

impl RelayClientBuilder {
    fn new() -> Self {
        Self {
            relay_url: None,
            identity: None,
            timeouts: RelayTimeouts::default(),
            connection_options: ConnectionOptions::default(),
            handlers: EventHandlers::new(),
            transport: None,
        }
    }

    /// Set the base URL of the relay server.
    ///
    /// `http(s)` schemes are mapped to `ws(s)` and the realtime path suffix
    /// is appended automatically.
    pub fn relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = Some(url.into());
        self
    }

    /// Set the identity provider driving authentication.
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set timeout configuration for all operations
    pub fn timeouts(mut self, timeouts: RelayTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set reconnection options for the default WebSocket transport
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection_options = options;
        self
    }

    /// Set lifecycle and frame callbacks
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Replace the default WebSocket transport.
    ///
    /// Mostly useful in tests; production code should rarely need this.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the client and spawn its background tasks.
    ///
    /// Must be called within a Tokio runtime. Fails with
    /// [`RelayLinkError::ConfigurationError`] when `relay_url` or `identity`
    /// is missing, or when the URL cannot be parsed.
    pub fn build(self) -> Result<RelayClient> {
        let relay_url = self
            .relay_url
            .ok_or_else(|| RelayLinkError::ConfigurationError("relay_url is required".into()))?;
        let identity = self
            .identity
            .ok_or_else(|| RelayLinkError::ConfigurationError("identity is required".into()))?;
        let endpoint = resolve_endpoint(&relay_url)?;

        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(WsTransport::new(
                self.connection_options,
                self.timeouts.clone(),
                self.handlers.clone(),
            )),
        };

        let (cred_tx, cred_rx) = mpsc::channel(CREDENTIAL_CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (session_tx, session_rx) = watch::channel(false);
        let (system_tx, _) = broadcast::channel(SYSTEM_EVENT_CAPACITY);

        log::debug!("[relay-link] Starting client against endpoint={}", endpoint);

        tokio::spawn(token_bridge_task(identity, cred_tx));
        tokio::spawn(connection_manager_task(
            transport,
            endpoint,
            self.timeouts,
            self.handlers,
            cred_rx,
            cmd_rx,
            state_tx,
            ready_tx,
            session_tx,
            system_tx.clone(),
        ));

        Ok(RelayClient {
            cmd_tx,
            state_rx,
            ready_rx,
            session_rx,
            system_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Principal, StaticIdentity};

    #[tokio::test]
    async fn test_builder_pattern() {
        let result = RelayClient::builder()
            .relay_url("https://relay.example.com")
            .identity(Arc::new(StaticIdentity::new(Principal::new("user-1"), "token-abc")))
            .timeouts(RelayTimeouts::fast())
            .build();

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_builder_missing_url() {
        let result = RelayClient::builder()
            .identity(Arc::new(StaticIdentity::new(Principal::new("user-1"), "token-abc")))
            .build();
        assert!(matches!(
            result,
            Err(RelayLinkError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_builder_missing_identity() {
        let result = RelayClient::builder()
            .relay_url("https://relay.example.com")
            .build();
        assert!(matches!(
            result,
            Err(RelayLinkError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_builder_rejects_bad_url() {
        let result = RelayClient::builder()
            .relay_url("not a url")
            .identity(Arc::new(StaticIdentity::new(Principal::new("user-1"), "token-abc")))
            .build();
        assert!(matches!(
            result,
            Err(RelayLinkError::ConfigurationError(_))
        ));
    }
}
