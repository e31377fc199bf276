//! Credential-mapping policy capability.
//!
//! The policy decides, per authentication request, whether the relay
//! forwards the client's own credential or substitutes one it holds. It is
//! injected into each proxy connection at construction rather than looked up
//! from shared state.

use std::sync::Arc;

use async_trait::async_trait;
use ssh_key::{public::KeyData, PrivateKey};

/// Verdict on one authentication request.
#[derive(Clone)]
pub enum AuthDecision {
    /// Forward the request unchanged. Default for every method.
    PassThrough,
    /// Forward using a locally supplied credential, possibly under a
    /// different username.
    Map(MappedCredential),
    /// Consume the request without contacting the backend. The negotiator
    /// answers the client so the attempt is never left hanging.
    Discard,
    /// Replace the request with a method `none` probe, forcing the backend
    /// to advertise its acceptable methods.
    None,
}

/// A credential held by the relay, substituted for the client's own.
#[derive(Clone)]
pub enum MappedCredential {
    Password {
        /// Target username; `None` keeps the claimed one.
        username: Option<String>,
        password: String,
    },
    PrivateKey {
        username: Option<String>,
        key: Arc<PrivateKey>,
    },
}

impl MappedCredential {
    pub fn username_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        let mapped = match self {
            Self::Password { username, .. } => username,
            Self::PrivateKey { username, .. } => username,
        };
        mapped.as_deref().unwrap_or(fallback)
    }
}

/// One request as presented to the policy. For public-key requests the
/// offered key is available so policies can map identities by key.
pub struct PolicyRequest<'a> {
    pub user: &'a str,
    pub method: &'a str,
    pub offered_key: Option<&'a KeyData>,
}

#[async_trait]
pub trait CredentialPolicy: Send + Sync {
    async fn decide(&self, request: PolicyRequest<'_>) -> AuthDecision;
}

/// Forwards everything unchanged; the backend is the sole authority on
/// whether a credential is valid.
pub struct PassThroughPolicy;

#[async_trait]
impl CredentialPolicy for PassThroughPolicy {
    async fn decide(&self, _request: PolicyRequest<'_>) -> AuthDecision {
        AuthDecision::PassThrough
    }
}

/// Maps offered public keys to credentials the relay holds: an
/// authorized-keys table kept on the relay instead of on the backend. A key
/// with no entry, and every non-publickey request, passes through unchanged.
#[derive(Default)]
pub struct KeyMapPolicy {
    entries: Vec<(KeyData, MappedCredential)>,
}

impl KeyMapPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client key and the credential to substitute when it is
    /// offered and its signature has verified.
    pub fn authorize(mut self, key: KeyData, credential: MappedCredential) -> Self {
        self.entries.push((key, credential));
        self
    }
}

#[async_trait]
impl CredentialPolicy for KeyMapPolicy {
    async fn decide(&self, request: PolicyRequest<'_>) -> AuthDecision {
        if let Some(offered) = request.offered_key {
            for (key, credential) in &self.entries {
                if key == offered {
                    return AuthDecision::Map(credential.clone());
                }
            }
        }
        AuthDecision::PassThrough
    }
}
