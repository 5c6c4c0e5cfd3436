//! Shared test harness: a scriptable in-process transport and identity
//! provider so the lifecycle tests run without a relay server.

#![allow(dead_code)]

use relay_link::{
    AckReceiver, Credential, IdentityProvider, Principal, Result, Session, SessionEvent, Transport,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// One recorded `emit`/`emit_with_ack` call. Holding the `ack` sender lets the
/// test script the server's acknowledgment (or drop it to simulate a lost
/// connection mid-flight).
pub struct EmitRecord {
    pub session: usize,
    pub event: String,
    pub data: Value,
    pub ack: Option<oneshot::Sender<Result<Value>>>,
}

#[derive(Default)]
struct MockInner {
    /// Ordered call log: `open#N`, `close#N`, `emit#N:<event>`.
    calls: Vec<String>,
    /// (endpoint, credential) per open, in order.
    opens: Vec<(String, String)>,
    emits: VecDeque<EmitRecord>,
    event_feeds: Vec<mpsc::Sender<SessionEvent>>,
}

/// In-process [`Transport`] that records every call and lets the test inject
/// session events and script acknowledgments.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().opens.len()
    }

    pub fn close_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with("close#"))
            .count()
    }

    pub fn open_credentials(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .opens
            .iter()
            .map(|(_, cred)| cred.clone())
            .collect()
    }

    pub fn open_endpoints(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .opens
            .iter()
            .map(|(ep, _)| ep.clone())
            .collect()
    }

    /// Inject a session event into session `idx`.
    pub async fn inject(&self, idx: usize, event: SessionEvent) {
        let feed = self.inner.lock().unwrap().event_feeds[idx].clone();
        feed.send(event).await.expect("manager dropped session feed");
    }

    /// Drive session `idx` through the transport handshake.
    pub async fn open_session(&self, idx: usize) {
        self.inject(idx, SessionEvent::Opened).await;
    }

    /// Send the server's application-level `connected` acknowledgment.
    pub async fn acknowledge_session(&self, idx: usize) {
        self.inject(
            idx,
            SessionEvent::Event {
                name: "connected".into(),
                data: serde_json::json!({ "sessionId": format!("sess-{}", idx) }),
            },
        )
        .await;
    }

    pub fn take_emit(&self) -> Option<EmitRecord> {
        self.inner.lock().unwrap().emits.pop_front()
    }

    /// Wait (with a generous cap) for the next recorded emit.
    pub async fn next_emit(&self) -> EmitRecord {
        for _ in 0..500 {
            if let Some(rec) = self.take_emit() {
                return rec;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for an emit; call log: {:?}", self.call_log());
    }

    /// Wait until at least `n` sessions have been opened.
    pub async fn wait_for_sessions(&self, n: usize) {
        for _ in 0..500 {
            if self.session_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "timed out waiting for {} sessions; call log: {:?}",
            n,
            self.call_log()
        );
    }

    /// Wait until at least `n` close calls have been recorded.
    pub async fn wait_for_closes(&self, n: usize) {
        for _ in 0..500 {
            if self.close_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "timed out waiting for {} closes; call log: {:?}",
            n,
            self.call_log()
        );
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        endpoint: &str,
        credential: &Credential,
    ) -> Result<(Box<dyn Session>, mpsc::Receiver<SessionEvent>)> {
        let (feed_tx, feed_rx) = mpsc::channel(16);
        let idx = {
            let mut inner = self.inner.lock().unwrap();
            let idx = inner.opens.len();
            inner.calls.push(format!("open#{}", idx));
            inner
                .opens
                .push((endpoint.to_string(), credential.as_str().to_string()));
            inner.event_feeds.push(feed_tx);
            idx
        };
        Ok((
            Box::new(MockSession {
                idx,
                inner: Arc::clone(&self.inner),
            }),
            feed_rx,
        ))
    }
}

struct MockSession {
    idx: usize,
    inner: Arc<Mutex<MockInner>>,
}

impl Session for MockSession {
    fn emit(&self, event: &str, data: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("emit#{}:{}", self.idx, event));
        inner.emits.push_back(EmitRecord {
            session: self.idx,
            event: event.to_string(),
            data,
            ack: None,
        });
    }

    fn emit_with_ack(&self, event: &str, data: Value) -> AckReceiver {
        let (ack_tx, ack_rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("emit#{}:{}", self.idx, event));
        inner.emits.push_back(EmitRecord {
            session: self.idx,
            event: event.to_string(),
            data,
            ack: Some(ack_tx),
        });
        ack_rx
    }

    fn close(&self) {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(format!("close#{}", self.idx));
    }
}

/// Identity provider the test signs in and out at will. Credentials are
/// derived from the principal id (`tok-<id>`), so a principal change always
/// produces a different credential.
pub struct ScriptedIdentity {
    principal_tx: watch::Sender<Option<Principal>>,
}

impl ScriptedIdentity {
    pub fn signed_out() -> Arc<Self> {
        let (principal_tx, _) = watch::channel(None);
        Arc::new(Self { principal_tx })
    }

    pub fn signed_in(id: &str) -> Arc<Self> {
        let (principal_tx, _) = watch::channel(Some(Principal::new(id)));
        Arc::new(Self { principal_tx })
    }

    pub fn sign_in(&self, id: &str) {
        self.principal_tx.send_replace(Some(Principal::new(id)));
    }

    pub fn sign_out(&self) {
        self.principal_tx.send_replace(None);
    }
}

#[async_trait::async_trait]
impl IdentityProvider for ScriptedIdentity {
    fn principal_stream(&self) -> watch::Receiver<Option<Principal>> {
        self.principal_tx.subscribe()
    }

    async fn fetch_credential(
        &self,
        principal: &Principal,
        _force_refresh: bool,
    ) -> Result<Credential> {
        Ok(Credential::new(format!("tok-{}", principal.id)))
    }
}
