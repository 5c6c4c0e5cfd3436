//! Transport abstraction and the default WebSocket transport.
//!
//! The connection manager talks to the relay server through the [`Transport`]
//! seam: `open` yields a [`Session`] handle plus a stream of
//! [`SessionEvent`]s. The default implementation, [`WsTransport`], speaks JSON
//! envelope frames over tokio-tungstenite and owns the low-level concerns the
//! manager deliberately does not: connection timeouts, keepalive pings, and
//! automatic reconnection with exponential backoff. The manager only reacts to
//! the `Opened` / `Closed` / `Error` signals the transport emits.

use crate::{
    error::{RelayLinkError, Result},
    event_handlers::{DisconnectReason, EventHandlers},
    identity::Credential,
    protocol::{Envelope, EVENT_ACK, EVENT_AUTH},
    timeouts::RelayTimeouts,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::header::{HeaderValue, AUTHORIZATION},
        protocol::Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

/// Fixed path suffix of the relay session endpoint.
const ENDPOINT_SUFFIX: &str = "/realtime";

/// Capacity of the session event channel toward the manager.
const SESSION_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Sleep far enough into the future to be effectively "never".
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle and application events emitted by a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// Transport handshake (including the auth frame) completed.
    Opened,
    /// A named application event pushed by the server.
    Event {
        /// Event name, e.g. `connected` or `system`.
        name: String,
        /// Opaque payload, forwarded verbatim.
        data: Value,
    },
    /// The session dropped; the transport may reconnect on its own.
    Closed(DisconnectReason),
    /// A connection attempt or the live socket failed.
    Error(String),
}

/// Receives the server's acknowledgment for an acked emit.
///
/// Resolves exactly once: `Ok(payload)` when the server replies, `Err` when
/// the connection is lost first. Dropping the sending side (session teardown)
/// surfaces as a receive error on this channel.
pub type AckReceiver = oneshot::Receiver<Result<Value>>;

/// Handle to an open relay session.
pub trait Session: Send + Sync {
    /// Fire-and-forget emit. Silently dropped if the socket is down.
    fn emit(&self, event: &str, data: Value);

    /// Emit expecting a server acknowledgment.
    fn emit_with_ack(&self, event: &str, data: Value) -> AckReceiver;

    /// Close the session and stop the transport's reconnection.
    fn close(&self);
}

/// Capability to open relay sessions.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a session against `endpoint` authenticating with `credential`.
    ///
    /// Returns quickly with the handle and event stream; connection progress
    /// is reported through [`SessionEvent`]s.
    async fn open(
        &self,
        endpoint: &str,
        credential: &Credential,
    ) -> Result<(Box<dyn Session>, mpsc::Receiver<SessionEvent>)>;
}

/// Reconnection behavior of the default WebSocket transport.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Reconnect automatically after a lost connection. Default: true.
    pub auto_reconnect: bool,
    /// Initial reconnection delay in milliseconds. Default: 500.
    pub reconnect_delay_ms: u64,
    /// Cap on the exponential backoff delay in milliseconds. Default: 30000.
    pub max_reconnect_delay_ms: u64,
    /// Give up after this many consecutive failed attempts. `None` = retry forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay_ms: 500,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: None,
        }
    }
}

/// Resolve the session endpoint from the configured relay base URL.
///
/// Maps `http(s)` schemes to `ws(s)` and appends [`ENDPOINT_SUFFIX`] when the
/// path does not already end with it.
pub fn resolve_endpoint(base_url: &str) -> Result<String> {
    let mut url = Url::parse(base_url.trim()).map_err(|e| {
        RelayLinkError::ConfigurationError(format!("Invalid relay_url '{}': {}", base_url, e))
    })?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RelayLinkError::ConfigurationError(format!(
                "Unsupported relay_url scheme '{}'; expected http(s) or ws(s)",
                other
            )));
        }
    };
    url.set_scheme(scheme).map_err(|_| {
        RelayLinkError::ConfigurationError("Failed to set session endpoint scheme".to_string())
    })?;
    url.set_fragment(None);

    let trimmed = url.path().trim_end_matches('/').to_string();
    if trimmed.ends_with(ENDPOINT_SUFFIX) {
        url.set_path(&trimmed);
    } else {
        url.set_path(&format!("{}{}", trimmed, ENDPOINT_SUFFIX));
    }

    Ok(url.to_string())
}

// ── Default WebSocket transport ─────────────────────────────────────────────

/// Outbound commands from the session handle to the socket task.
enum OutFrame {
    Emit {
        event: String,
        data: Value,
        ack: Option<(u64, oneshot::Sender<Result<Value>>)>,
    },
    Close,
}

/// Session handle backed by [`WsTransport`].
struct WsSession {
    out_tx: mpsc::UnboundedSender<OutFrame>,
    next_ack: AtomicU64,
}

impl Session for WsSession {
    fn emit(&self, event: &str, data: Value) {
        let _ = self.out_tx.send(OutFrame::Emit {
            event: event.to_string(),
            data,
            ack: None,
        });
    }

    fn emit_with_ack(&self, event: &str, data: Value) -> AckReceiver {
        let (ack_tx, ack_rx) = oneshot::channel();
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        if self
            .out_tx
            .send(OutFrame::Emit {
                event: event.to_string(),
                data,
                ack: Some((id, ack_tx)),
            })
            .is_err()
        {
            // Socket task gone; the dropped ack_tx resolves the receiver
            // with a channel error, which normalizes to a failure upstream.
        }
        ack_rx
    }

    fn close(&self) {
        let _ = self.out_tx.send(OutFrame::Close);
    }
}

/// Default WebSocket transport speaking JSON envelope frames.
pub struct WsTransport {
    options: ConnectionOptions,
    timeouts: RelayTimeouts,
    handlers: EventHandlers,
}

impl WsTransport {
    /// Create a transport with the given reconnection options, timeouts, and
    /// raw-frame debug hooks.
    pub fn new(options: ConnectionOptions, timeouts: RelayTimeouts, handlers: EventHandlers) -> Self {
        Self {
            options,
            timeouts,
            handlers,
        }
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn open(
        &self,
        endpoint: &str,
        credential: &Credential,
    ) -> Result<(Box<dyn Session>, mpsc::Receiver<SessionEvent>)> {
        // Validate eagerly so a bad endpoint fails the open, not the task.
        let request = endpoint.into_client_request().map_err(|e| {
            RelayLinkError::ConfigurationError(format!(
                "Failed to build session request for '{}': {}",
                endpoint, e
            ))
        })?;
        drop(request);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(SESSION_EVENT_CHANNEL_CAPACITY);

        tokio::spawn(ws_session_task(
            endpoint.to_string(),
            credential.clone(),
            self.options.clone(),
            self.timeouts.clone(),
            self.handlers.clone(),
            out_rx,
            event_tx,
        ));

        Ok((
            Box::new(WsSession {
                out_tx,
                next_ack: AtomicU64::new(1),
            }),
            event_rx,
        ))
    }
}

/// Connect the socket and send the auth handshake frame.
///
/// The credential travels both ways the server accepts it: as a bearer header
/// on the upgrade request and as the first frame after the socket opens.
async fn establish(
    endpoint: &str,
    credential: &Credential,
    timeouts: &RelayTimeouts,
) -> Result<WsStream> {
    let mut request = endpoint.into_client_request().map_err(|e| {
        RelayLinkError::TransportError(format!("Failed to build session request: {}", e))
    })?;

    let bearer = format!("Bearer {}", credential.as_str());
    let header = HeaderValue::from_str(&bearer).map_err(|e| {
        RelayLinkError::AuthenticationError(format!("Credential is not header-safe: {}", e))
    })?;
    request.headers_mut().insert(AUTHORIZATION, header);

    let connect = connect_async(request);
    let (mut ws, _response) = if RelayTimeouts::is_no_timeout(timeouts.connection_timeout) {
        connect
            .await
            .map_err(|e| RelayLinkError::TransportError(format!("Connection failed: {}", e)))?
    } else {
        tokio::time::timeout(timeouts.connection_timeout, connect)
            .await
            .map_err(|_| {
                RelayLinkError::TimeoutError(format!(
                    "Connection timeout ({:?})",
                    timeouts.connection_timeout
                ))
            })?
            .map_err(|e| RelayLinkError::TransportError(format!("Connection failed: {}", e)))?
    };

    let auth = Envelope::new(
        EVENT_AUTH,
        serde_json::json!({ "token": credential.as_str() }),
    );
    let payload = serde_json::to_string(&auth)?;
    ws.send(Message::Text(payload.into())).await.map_err(|e| {
        RelayLinkError::TransportError(format!("Failed to send auth handshake: {}", e))
    })?;

    Ok(ws)
}

/// Why the frame loop stopped.
enum LoopExit {
    /// `close()` was called or the session handle was dropped.
    Shutdown,
    /// The socket died; reconnection may follow.
    Lost(DisconnectReason),
}

/// Background task owning the WebSocket for one session's lifetime, across
/// low-level reconnects.
async fn ws_session_task(
    endpoint: String,
    credential: Credential,
    options: ConnectionOptions,
    timeouts: RelayTimeouts,
    handlers: EventHandlers,
    mut out_rx: mpsc::UnboundedReceiver<OutFrame>,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    let mut attempts: u32 = 0;

    loop {
        match establish(&endpoint, &credential, &timeouts).await {
            Ok(ws) => {
                attempts = 0;
                if event_tx.send(SessionEvent::Opened).await.is_err() {
                    return;
                }
                match frame_loop(ws, &mut out_rx, &event_tx, &timeouts, &handlers).await {
                    LoopExit::Shutdown => return,
                    LoopExit::Lost(reason) => {
                        if event_tx.send(SessionEvent::Closed(reason)).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("[relay-link] Session connect failed: {}", e);
                if event_tx.send(SessionEvent::Error(e.to_string())).await.is_err() {
                    return;
                }
            }
        }

        if !options.auto_reconnect {
            return;
        }
        attempts += 1;
        if let Some(max) = options.max_reconnect_attempts {
            if attempts > max {
                log::warn!("[relay-link] Max reconnection attempts ({}) reached", max);
                return;
            }
        }

        let delay = std::cmp::min(
            options
                .reconnect_delay_ms
                .saturating_mul(2u64.saturating_pow(attempts.saturating_sub(1))),
            options.max_reconnect_delay_ms,
        );
        log::info!(
            "[relay-link] Reconnecting in {}ms (attempt {})",
            delay,
            attempts
        );

        // Honor close requests while backing off.
        let sleep_fut = tokio::time::sleep(Duration::from_millis(delay));
        tokio::pin!(sleep_fut);
        loop {
            tokio::select! {
                frame = out_rx.recv() => match frame {
                    Some(OutFrame::Close) | None => return,
                    Some(OutFrame::Emit { ack, .. }) => {
                        // Emits during a reconnect window are not retried.
                        if let Some((_, ack_tx)) = ack {
                            let _ = ack_tx.send(Err(RelayLinkError::TransportError(
                                "Not connected".to_string(),
                            )));
                        }
                    }
                },
                _ = &mut sleep_fut => break,
            }
        }
    }
}

/// Multiplex outbound frames, inbound frames, and keepalive pings on one
/// live socket. Returns when the socket dies or the session is closed.
async fn frame_loop(
    mut ws: WsStream,
    out_rx: &mut mpsc::UnboundedReceiver<OutFrame>,
    event_tx: &mpsc::Sender<SessionEvent>,
    timeouts: &RelayTimeouts,
    handlers: &EventHandlers,
) -> LoopExit {
    let mut pending_acks: HashMap<u64, oneshot::Sender<Result<Value>>> = HashMap::new();

    let has_keepalive = !timeouts.keepalive_interval.is_zero();
    let keepalive_dur = if has_keepalive {
        timeouts.keepalive_interval
    } else {
        FAR_FUTURE
    };
    let mut idle_deadline = TokioInstant::now() + keepalive_dur;

    let exit = loop {
        let idle_sleep = tokio::time::sleep_until(idle_deadline);
        tokio::pin!(idle_sleep);

        tokio::select! {
            biased;

            frame = out_rx.recv() => match frame {
                Some(OutFrame::Emit { event, data, ack }) => {
                    let envelope = match &ack {
                        Some((id, _)) => Envelope::with_ack(&event, data, *id),
                        None => Envelope::new(&event, data),
                    };
                    let payload = match serde_json::to_string(&envelope) {
                        Ok(p) => p,
                        Err(e) => {
                            log::warn!("[relay-link] Failed to serialize '{}' frame: {}", event, e);
                            if let Some((_, ack_tx)) = ack {
                                let _ = ack_tx.send(Err(e.into()));
                            }
                            continue;
                        }
                    };
                    if let Some((id, ack_tx)) = ack {
                        pending_acks.insert(id, ack_tx);
                    }
                    handlers.emit_send(&payload);
                    if let Err(e) = ws.send(Message::Text(payload.into())).await {
                        break LoopExit::Lost(DisconnectReason::new(format!(
                            "Send failed: {}", e
                        )));
                    }
                    idle_deadline = TokioInstant::now() + keepalive_dur;
                },
                Some(OutFrame::Close) | None => {
                    let _ = ws.close(None).await;
                    break LoopExit::Shutdown;
                },
            },

            _ = &mut idle_sleep, if has_keepalive => {
                if let Err(e) = ws.send(Message::Ping(Bytes::new())).await {
                    break LoopExit::Lost(DisconnectReason::new(format!(
                        "Keepalive ping failed: {}", e
                    )));
                }
                handlers.emit_send("[ping]");
                idle_deadline = TokioInstant::now() + keepalive_dur;
            },

            msg = ws.next() => {
                idle_deadline = TokioInstant::now() + keepalive_dur;
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handlers.emit_receive(text.as_str());
                        route_inbound(text.as_str(), &mut pending_acks, event_tx).await;
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    },
                    Some(Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {},
                    Some(Ok(Message::Close(frame))) => {
                        let reason = match frame {
                            Some(f) => DisconnectReason::with_code(f.reason.to_string(), f.code.into()),
                            None => DisconnectReason::new("Server closed connection"),
                        };
                        break LoopExit::Lost(reason);
                    },
                    Some(Err(e)) => {
                        break LoopExit::Lost(DisconnectReason::new(format!(
                            "Socket error: {}", e
                        )));
                    },
                    None => {
                        break LoopExit::Lost(DisconnectReason::new("Socket stream ended"));
                    },
                }
            },
        }
    };

    // In-flight acks cannot survive the socket; resolve them as failures so
    // callers get a terminal response rather than a hang.
    for (_, ack_tx) in pending_acks.drain() {
        let _ = ack_tx.send(Err(RelayLinkError::TransportError(
            "Connection lost before acknowledgment".to_string(),
        )));
    }

    exit
}

/// Route one inbound text frame: ack replies resolve their pending emit,
/// everything else is forwarded as a named session event.
async fn route_inbound(
    text: &str,
    pending_acks: &mut HashMap<u64, oneshot::Sender<Result<Value>>>,
    event_tx: &mpsc::Sender<SessionEvent>,
) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("[relay-link] Unparseable frame from server: {}", e);
            return;
        }
    };

    if envelope.event == EVENT_ACK {
        match envelope.ack.and_then(|id| pending_acks.remove(&id)) {
            Some(ack_tx) => {
                let _ = ack_tx.send(Ok(envelope.data));
            }
            None => log::debug!(
                "[relay-link] Ack frame with unknown id {:?}",
                envelope.ack
            ),
        }
        return;
    }

    let _ = event_tx
        .send(SessionEvent::Event {
            name: envelope.event,
            data: envelope.data,
        })
        .await;
}
