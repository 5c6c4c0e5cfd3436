//! Identity integration: principals, credentials, and the token bridge.
//!
//! The identity provider is an external collaborator: it pushes the signed-in
//! principal (or `None`) through a watch stream and can mint a fresh bearer
//! credential for a principal on demand. The token bridge task turns that
//! stream into a stream of credentials for the connection manager, fetching a
//! fresh credential on every principal change and degrading fetch failures to
//! "no credential" so the session fails safe to disconnected.

use crate::error::Result;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// A signed-in principal as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Stable identifier of the principal.
    pub id: String,
}

impl Principal {
    /// Create a principal from its identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// An opaque bearer token minted by the identity provider.
///
/// Consumed once per connection attempt; the manager keeps only the credential
/// used to open the *current* session, for the idempotent-reconnect check.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for transport handshakes.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    // Never print token material.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(***)")
    }
}

/// External identity provider capability.
///
/// Implement this to bridge your auth system (OIDC, Firebase, a test harness)
/// into the relay client. `principal_stream` must deliver the current value
/// immediately on subscription and every subsequent change.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Watch stream of the signed-in principal, `None` when signed out.
    fn principal_stream(&self) -> watch::Receiver<Option<Principal>>;

    /// Mint a fresh credential for the given principal.
    async fn fetch_credential(&self, principal: &Principal, force_refresh: bool)
        -> Result<Credential>;
}

/// Identity provider with a fixed principal and token.
///
/// Useful for headless tools and tests; the principal never changes and the
/// same token is returned on every fetch.
pub struct StaticIdentity {
    principal_tx: watch::Sender<Option<Principal>>,
    token: String,
}

impl StaticIdentity {
    /// Create a static identity for `principal` authenticating with `token`.
    pub fn new(principal: Principal, token: impl Into<String>) -> Self {
        let (principal_tx, _) = watch::channel(Some(principal));
        Self {
            principal_tx,
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl IdentityProvider for StaticIdentity {
    fn principal_stream(&self) -> watch::Receiver<Option<Principal>> {
        self.principal_tx.subscribe()
    }

    async fn fetch_credential(
        &self,
        _principal: &Principal,
        _force_refresh: bool,
    ) -> Result<Credential> {
        Ok(Credential::new(self.token.clone()))
    }
}

/// Bridge principal changes into credential updates for the manager.
///
/// Forwards exactly one credential-or-absence per observed principal change, in
/// observation order. A fetch whose principal was superseded while the fetch
/// was in flight is discarded rather than forwarded, so a stale credential is
/// never applied after a newer change.
pub(crate) async fn token_bridge_task(
    provider: Arc<dyn IdentityProvider>,
    cred_tx: mpsc::Sender<Option<Credential>>,
) {
    let mut principals = provider.principal_stream();
    loop {
        let principal = principals.borrow_and_update().clone();
        let credential = match &principal {
            Some(p) => match provider.fetch_credential(p, false).await {
                Ok(c) => Some(c),
                Err(e) => {
                    // Fail safe to disconnected; the fetch error stays here.
                    log::warn!(
                        "[relay-link] Credential fetch failed for principal '{}': {}",
                        p.id,
                        e
                    );
                    None
                }
            },
            None => None,
        };

        // A newer principal change supersedes this fetch.
        if principals.has_changed().unwrap_or(false) {
            continue;
        }

        if cred_tx.send(credential).await.is_err() {
            // Manager gone — nothing left to feed.
            return;
        }

        if principals.changed().await.is_err() {
            // Provider stream ended.
            return;
        }
    }
}
