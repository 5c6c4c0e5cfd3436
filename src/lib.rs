//! Rust client library for relay realtime servers.
//!
//! `relay-link` keeps a single authenticated WebSocket session alive against
//! a relay server and exposes room joining, identification, and scoped
//! broadcasting on top of it. Authentication is driven by an
//! [`IdentityProvider`]: whenever the signed-in principal changes, the old
//! session is torn down and a new one is opened with a fresh credential.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use relay_link::{BroadcastScope, Principal, RelayClient, StaticIdentity};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RelayClient::builder()
//!     .relay_url("https://relay.example.com")
//!     .identity(Arc::new(StaticIdentity::new(Principal::new("user-1"), "token-abc")))
//!     .build()?;
//!
//! // Parks until the session is ready, then joins.
//! let joined = client.join_room("court-5").await;
//! assert!(joined.success);
//!
//! client
//!     .notify(serde_json::json!({ "kind": "score" }), BroadcastScope::Others)
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod error;
pub mod event_handlers;
pub mod identity;
pub mod protocol;
pub mod timeouts;
pub mod transport;

pub use client::{RelayClient, RelayClientBuilder};
pub use connection::ConnectionState;
pub use error::{RelayLinkError, Result};
pub use event_handlers::{ConnectionError, DisconnectReason, EventHandlers};
pub use identity::{Credential, IdentityProvider, Principal, StaticIdentity};
pub use protocol::{AckResponse, BroadcastScope, ConnectedInfo, Envelope};
pub use timeouts::{RelayTimeouts, RelayTimeoutsBuilder};
pub use transport::{
    AckReceiver, ConnectionOptions, Session, SessionEvent, Transport, WsTransport,
};
