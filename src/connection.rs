//! Connection state machine and the manager task.
//!
//! A single background task owns the transport session, the connection state,
//! the readiness gate, and the system-event fan-out. All mutation happens
//! inside this task in reaction to three inputs: credential updates from the
//! token bridge, lifecycle/application events from the session, and commands
//! from the public client handle. Nothing here blocks a thread; waiting
//! callers park on the readiness watch instead.

use crate::{
    event_handlers::{ConnectionError, DisconnectReason, EventHandlers},
    identity::Credential,
    protocol::{
        identify_payload, join_room_payload, AckResponse, BroadcastScope, ConnectedInfo,
        EVENT_CONNECTED, EVENT_CONNECT_ERROR, EVENT_IDENTIFY, EVENT_JOIN_ROOM, EVENT_NOTIFY,
        EVENT_RELAY, EVENT_SYSTEM,
    },
    timeouts::RelayTimeouts,
    transport::{AckReceiver, Session, SessionEvent, Transport},
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Connection lifecycle states.
///
/// `Connected` means the transport handshake succeeded; `Ready` additionally
/// requires the server's application-level `connected` acknowledgment. Only
/// `Ready` lets join-room and identify operations proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live session.
    Disconnected,
    /// A session open is in flight.
    Connecting,
    /// Transport handshake succeeded, server acknowledgment pending.
    Connected,
    /// Server acknowledged the session; operations may proceed.
    Ready,
}

/// Commands from the client handle to the manager task.
pub(crate) enum Cmd {
    JoinRoom {
        room: String,
        result_tx: oneshot::Sender<AckResponse>,
    },
    Identify {
        user_id: String,
        result_tx: oneshot::Sender<AckResponse>,
    },
    Notify {
        data: Value,
        scope: BroadcastScope,
    },
    Relay {
        data: Value,
        scope: BroadcastScope,
    },
    Shutdown,
}

/// Apply a state transition, keeping the readiness gate in sync.
///
/// Readiness flips true only on entry into `Ready` and false on entry into
/// `Disconnected`, in the same call — no caller can observe `Ready` state with
/// a stale gate or vice versa.
fn set_state(
    state_tx: &watch::Sender<ConnectionState>,
    ready_tx: &watch::Sender<bool>,
    new: ConnectionState,
) {
    if new == ConnectionState::Disconnected {
        ready_tx.send_if_modified(|r| std::mem::replace(r, false));
    }
    state_tx.send_if_modified(|s| {
        if *s != new {
            *s = new;
            true
        } else {
            false
        }
    });
    if new == ConnectionState::Ready {
        ready_tx.send_if_modified(|r| !std::mem::replace(r, true));
    }
}

/// Await the session event stream, or pend forever when no session exists.
async fn next_session_event(rx: &mut Option<mpsc::Receiver<SessionEvent>>) -> Option<SessionEvent> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

/// Normalize a server acknowledgment (or its absence) into an [`AckResponse`].
async fn await_ack(ack_rx: AckReceiver, ack_timeout: std::time::Duration) -> AckResponse {
    let outcome = if RelayTimeouts::is_no_timeout(ack_timeout) {
        Ok(ack_rx.await)
    } else {
        tokio::time::timeout(ack_timeout, ack_rx).await
    };

    match outcome {
        Ok(Ok(Ok(payload))) => AckResponse::from_payload(payload),
        Ok(Ok(Err(e))) => AckResponse::failure(e.to_string()),
        Ok(Err(_)) => AckResponse::failure("Connection lost before acknowledgment"),
        Err(_) => AckResponse::failure(format!(
            "Timed out waiting for server acknowledgment ({:?})",
            ack_timeout
        )),
    }
}

/// The manager task: single owner of session, state, and readiness.
///
/// Lifecycle:
/// 1. Credential arrives: tear down any existing session (state observably
///    passes through `Disconnected`), then open a new one — unless the session
///    is already `Connected`/`Ready` with an equal credential, which is a
///    no-op to avoid reconnect storms.
/// 2. Session reports `Opened` → `Connected`; the server's `connected` ack →
///    `Ready` and the gate opens.
/// 3. Session drop or error → `Disconnected`, gate closed. Reconnection is the
///    transport's job; this layer just reacts to its signals.
///
/// `session_tx` tracks whether a session handle exists at all. It stays `true`
/// across the transport's own reconnect windows (the handle is kept so a later
/// `Opened` re-promotes the state) and flips `false` only on teardown or when
/// the session task ends for good.
pub(crate) async fn connection_manager_task(
    transport: Arc<dyn Transport>,
    endpoint: String,
    timeouts: RelayTimeouts,
    handlers: EventHandlers,
    mut cred_rx: mpsc::Receiver<Option<Credential>>,
    mut cmd_rx: mpsc::Receiver<Cmd>,
    state_tx: watch::Sender<ConnectionState>,
    ready_tx: watch::Sender<bool>,
    session_tx: watch::Sender<bool>,
    system_tx: broadcast::Sender<Value>,
) {
    let mut session: Option<Box<dyn Session>> = None;
    let mut session_events: Option<mpsc::Receiver<SessionEvent>> = None;
    let mut last_credential: Option<Credential> = None;

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::JoinRoom { room, result_tx }) => {
                    dispatch_acked(
                        &session,
                        &state_tx,
                        EVENT_JOIN_ROOM,
                        join_room_payload(&room),
                        timeouts.ack_timeout,
                        result_tx,
                    );
                },
                Some(Cmd::Identify { user_id, result_tx }) => {
                    dispatch_acked(
                        &session,
                        &state_tx,
                        EVENT_IDENTIFY,
                        identify_payload(&user_id),
                        timeouts.ack_timeout,
                        result_tx,
                    );
                },
                Some(Cmd::Notify { data, scope }) => {
                    dispatch_fire_and_forget(&session, &state_tx, EVENT_NOTIFY, data, scope);
                },
                Some(Cmd::Relay { data, scope }) => {
                    dispatch_fire_and_forget(&session, &state_tx, EVENT_RELAY, data, scope);
                },
                Some(Cmd::Shutdown) | None => {
                    teardown(&mut session, &mut session_events, &state_tx, &ready_tx, &session_tx, &handlers);
                    return;
                },
            },

            cred = cred_rx.recv() => match cred {
                Some(Some(credential)) => {
                    let unchanged = last_credential.as_ref() == Some(&credential)
                        && matches!(
                            *state_tx.borrow(),
                            ConnectionState::Connected | ConnectionState::Ready
                        )
                        && session.is_some();
                    if unchanged {
                        log::debug!(
                            "[relay-link] Credential unchanged on a live session; keeping it"
                        );
                        continue;
                    }

                    teardown(&mut session, &mut session_events, &state_tx, &ready_tx, &session_tx, &handlers);
                    set_state(&state_tx, &ready_tx, ConnectionState::Connecting);

                    match transport.open(&endpoint, &credential).await {
                        Ok((s, events)) => {
                            session = Some(s);
                            session_events = Some(events);
                            session_tx.send_replace(true);
                            last_credential = Some(credential);
                        }
                        Err(e) => {
                            log::error!("[relay-link] Failed to open session: {}", e);
                            handlers.emit_error(ConnectionError::new(e.to_string(), false));
                            set_state(&state_tx, &ready_tx, ConnectionState::Disconnected);
                            last_credential = None;
                        }
                    }
                },
                Some(None) => {
                    // Credential revoked: no live session may outlast it.
                    teardown(&mut session, &mut session_events, &state_tx, &ready_tx, &session_tx, &handlers);
                    last_credential = None;
                },
                None => {
                    // Token bridge ended; nothing can re-open a session.
                    teardown(&mut session, &mut session_events, &state_tx, &ready_tx, &session_tx, &handlers);
                    return;
                },
            },

            ev = next_session_event(&mut session_events) => match ev {
                Some(SessionEvent::Opened) => {
                    set_state(&state_tx, &ready_tx, ConnectionState::Connected);
                    handlers.emit_connect();
                },
                Some(SessionEvent::Event { name, data }) => match name.as_str() {
                    EVENT_CONNECTED => {
                        if *state_tx.borrow() == ConnectionState::Connected {
                            match serde_json::from_value::<ConnectedInfo>(data) {
                                Ok(info) => log::info!(
                                    "[relay-link] Session acknowledged (sessionId={}, principalId={:?})",
                                    info.session_id,
                                    info.principal_id
                                ),
                                Err(e) => log::warn!(
                                    "[relay-link] Malformed 'connected' acknowledgment: {}",
                                    e
                                ),
                            }
                            set_state(&state_tx, &ready_tx, ConnectionState::Ready);
                        } else {
                            log::debug!(
                                "[relay-link] Ignoring 'connected' ack in state {:?}",
                                *state_tx.borrow()
                            );
                        }
                    },
                    EVENT_SYSTEM => {
                        // No subscribers is fine; events are not buffered.
                        let _ = system_tx.send(data);
                    },
                    EVENT_CONNECT_ERROR => {
                        let message = data
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("Server rejected the connection")
                            .to_string();
                        log::error!("[relay-link] Server rejected the session: {}", message);
                        set_state(&state_tx, &ready_tx, ConnectionState::Disconnected);
                        handlers.emit_error(ConnectionError::new(message, true));
                    },
                    other => {
                        log::debug!("[relay-link] Unhandled server event '{}'", other);
                    },
                },
                Some(SessionEvent::Closed(reason)) => {
                    log::warn!("[relay-link] Session dropped: {}", reason);
                    set_state(&state_tx, &ready_tx, ConnectionState::Disconnected);
                    handlers.emit_disconnect(reason);
                    // The transport reconnects on its own; keep the session
                    // handle so a later `Opened` re-promotes the state.
                },
                Some(SessionEvent::Error(message)) => {
                    log::error!("[relay-link] Connection error: {}", message);
                    set_state(&state_tx, &ready_tx, ConnectionState::Disconnected);
                    handlers.emit_error(ConnectionError::new(message, true));
                },
                None => {
                    // Session task ended for good (closed, or gave up retrying).
                    session = None;
                    session_events = None;
                    session_tx.send_replace(false);
                    set_state(&state_tx, &ready_tx, ConnectionState::Disconnected);
                },
            },
        }
    }
}

/// Close the session (if any) and report `Disconnected` synchronously, gate
/// first — no caller observes a stale `Ready` for a dead session.
fn teardown(
    session: &mut Option<Box<dyn Session>>,
    session_events: &mut Option<mpsc::Receiver<SessionEvent>>,
    state_tx: &watch::Sender<ConnectionState>,
    ready_tx: &watch::Sender<bool>,
    session_tx: &watch::Sender<bool>,
    handlers: &EventHandlers,
) {
    let had_session = session.is_some();
    if let Some(s) = session.take() {
        s.close();
    }
    *session_events = None;
    session_tx.send_replace(false);
    let was_up = *state_tx.borrow() != ConnectionState::Disconnected;
    set_state(state_tx, ready_tx, ConnectionState::Disconnected);
    if had_session && was_up {
        handlers.emit_disconnect(DisconnectReason::new("Session closed by client"));
    }
}

/// Execute a join/identify operation that was admitted through the gate.
///
/// The gate is re-checked here, at dispatch time: if the session died while
/// the caller was parked, the operation resolves to a failure instead of
/// emitting into a dead socket. The ack wait runs in its own task so the
/// manager keeps processing events; `result_tx` is consumed exactly once.
fn dispatch_acked(
    session: &Option<Box<dyn Session>>,
    state_tx: &watch::Sender<ConnectionState>,
    event: &str,
    payload: Value,
    ack_timeout: std::time::Duration,
    result_tx: oneshot::Sender<AckResponse>,
) {
    let ready = *state_tx.borrow() == ConnectionState::Ready;
    match (ready, session) {
        (true, Some(s)) => {
            let ack_rx = s.emit_with_ack(event, payload);
            tokio::spawn(async move {
                let response = await_ack(ack_rx, ack_timeout).await;
                let _ = result_tx.send(response);
            });
        }
        _ => {
            let _ = result_tx.send(AckResponse::failure(
                "Disconnected while waiting for authentication",
            ));
        }
    }
}

/// Fire-and-forget broadcast: a no-op without error when not connected.
fn dispatch_fire_and_forget(
    session: &Option<Box<dyn Session>>,
    state_tx: &watch::Sender<ConnectionState>,
    event: &str,
    data: Value,
    scope: BroadcastScope,
) {
    let connected = matches!(
        *state_tx.borrow(),
        ConnectionState::Connected | ConnectionState::Ready
    );
    if let (true, Some(s)) = (connected, session) {
        s.emit(event, scope.shape_payload(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayLinkError;
    use std::time::Duration;

    #[test]
    fn test_set_state_opens_gate_only_on_ready() {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let (ready_tx, ready_rx) = watch::channel(false);

        set_state(&state_tx, &ready_tx, ConnectionState::Connecting);
        assert!(!*ready_rx.borrow());
        set_state(&state_tx, &ready_tx, ConnectionState::Connected);
        assert!(!*ready_rx.borrow());
        set_state(&state_tx, &ready_tx, ConnectionState::Ready);
        assert!(*ready_rx.borrow());
    }

    #[test]
    fn test_set_state_closes_gate_on_disconnect() {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Ready);
        let (ready_tx, ready_rx) = watch::channel(true);

        set_state(&state_tx, &ready_tx, ConnectionState::Disconnected);
        assert!(!*ready_rx.borrow());
        assert_eq!(*state_tx.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_await_ack_normalizes_success() {
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(serde_json::json!({ "success": true }))).unwrap();
        let ack = await_ack(rx, Duration::from_secs(1)).await;
        assert!(ack.success);
    }

    #[tokio::test]
    async fn test_await_ack_maps_transport_error_to_failure() {
        let (tx, rx) = oneshot::channel();
        tx.send(Err(RelayLinkError::TransportError("socket hung up".into())))
            .unwrap();
        let ack = await_ack(rx, Duration::from_secs(1)).await;
        assert!(!ack.success);
        assert!(ack.message.unwrap().contains("socket hung up"));
    }

    #[tokio::test]
    async fn test_await_ack_maps_dropped_sender_to_failure() {
        let (tx, rx) = oneshot::channel::<crate::error::Result<Value>>();
        drop(tx);
        let ack = await_ack(rx, Duration::from_secs(1)).await;
        assert!(!ack.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ack_times_out() {
        let (_tx, rx) = oneshot::channel::<crate::error::Result<Value>>();
        let ack = await_ack(rx, Duration::from_millis(50)).await;
        assert!(!ack.success);
        assert!(ack.message.unwrap().contains("Timed out"));
    }
}
