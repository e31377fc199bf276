//! The authentication negotiation loop.
//!
//! Drives requests from the downstream channel to the backend one at a time,
//! transforming them as policy dictates, until the backend reports success or
//! the downstream channel is exhausted. Public-key queries are answered
//! locally and never reach the backend; invalid signatures are downgraded to
//! a `none` probe instead of being forwarded.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::auth::policy::{AuthDecision, CredentialPolicy, MappedCredential, PolicyRequest};
use crate::auth::request::{acceptable_algorithm, AuthRequest};
use crate::auth::signature::{sign_request, verify_request};
use crate::error::{AuthError, ProxyError};
use crate::transport::{handshake, PacketChannel};
use crate::wire::{
    self, PkOk, MSG_DEBUG, MSG_EXT_INFO, MSG_IGNORE, MSG_USERAUTH_BANNER, MSG_USERAUTH_FAILURE,
    MSG_USERAUTH_REQUEST, MSG_USERAUTH_SUCCESS,
};

/// Reads the next authentication request from a channel, skipping IGNORE and
/// DEBUG packets. Anything else before authentication completes is a
/// protocol violation.
pub async fn next_auth_request<S>(channel: &mut PacketChannel<S>) -> Result<AuthRequest, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let packet = channel.read_packet().await?;
        match wire::packet_type(&packet)? {
            MSG_USERAUTH_REQUEST => return AuthRequest::decode(&packet),
            MSG_IGNORE | MSG_DEBUG => continue,
            other => return Err(AuthError::UnexpectedMessage(other)),
        }
    }
}

/// Runs the negotiation between one downstream and one upstream channel.
/// Exactly one request is in flight at a time on either channel.
pub struct Negotiator<'a, D, U> {
    down: &'a mut PacketChannel<D>,
    up: &'a mut PacketChannel<U>,
    policy: &'a dyn CredentialPolicy,
}

impl<'a, D, U> Negotiator<'a, D, U>
where
    D: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        down: &'a mut PacketChannel<D>,
        up: &'a mut PacketChannel<U>,
        policy: &'a dyn CredentialPolicy,
    ) -> Self {
        Self { down, up, policy }
    }

    /// Negotiates until the backend accepts an authentication attempt.
    /// `first` is the request already read while learning the username.
    pub async fn run(mut self, first: AuthRequest) -> Result<(), ProxyError> {
        handshake::request_auth_service(self.up).await?;

        let mut request = first;
        loop {
            if let Some(outgoing) = self.evaluate(&request).await? {
                if self.forward_and_await(&outgoing).await? {
                    debug!(user = %request.user, "backend accepted authentication");
                    return Ok(());
                }
            }
            request = next_auth_request(self.down).await.map_err(ProxyError::Auth)?;
        }
    }

    /// Evaluates one request and produces the packet to forward upstream, or
    /// `None` when the request was consumed locally.
    async fn evaluate(&mut self, request: &AuthRequest) -> Result<Option<Vec<u8>>, ProxyError> {
        match request.method.as_str() {
            "publickey" => self.evaluate_public_key(request).await,
            "password" => {
                // Plain and change requests alike; validity is the backend's
                // call and the payload is never parsed or logged here.
                let decision = self
                    .policy
                    .decide(PolicyRequest {
                        user: &request.user,
                        method: "password",
                        offered_key: None,
                    })
                    .await;
                self.apply_decision(request, decision).await
            }
            method => {
                trace!(method, "passing through unhandled auth method");
                Ok(Some(request.encode()))
            }
        }
    }

    async fn evaluate_public_key(
        &mut self,
        request: &AuthRequest,
    ) -> Result<Option<Vec<u8>>, ProxyError> {
        let payload = request.public_key().map_err(ProxyError::Auth)?;
        if !acceptable_algorithm(&payload.algorithm) {
            return Err(AuthError::UnsupportedAlgorithm(payload.algorithm).into());
        }

        if payload.is_query() {
            // Two-phase probing: answer the query downstream and consume it.
            // The backend must never see it.
            let reply = PkOk {
                algorithm: payload.algorithm.clone(),
                key_blob: payload.key_blob.clone(),
            };
            self.down
                .write_packet(&reply.encode())
                .await
                .map_err(AuthError::from)
                .map_err(ProxyError::Auth)?;
            debug!(user = %request.user, algo = %payload.algorithm, "answered public key query");
            return Ok(None);
        }

        let verified = verify_request(self.down.session_id(), request, &payload)
            .map_err(ProxyError::Auth)?;
        if !verified {
            // Forwarding a bad signature would leak it upstream and burn an
            // attempt; a none probe makes the client retry instead.
            debug!(user = %request.user, "signature did not verify; downgrading to none");
            return Ok(Some(AuthRequest::none(&request.user).encode()));
        }

        let key = payload.key().map_err(ProxyError::Auth)?;
        let decision = self
            .policy
            .decide(PolicyRequest {
                user: &request.user,
                method: "publickey",
                offered_key: Some(&key),
            })
            .await;
        self.apply_decision(request, decision).await
    }

    async fn apply_decision(
        &mut self,
        request: &AuthRequest,
        decision: AuthDecision,
    ) -> Result<Option<Vec<u8>>, ProxyError> {
        match decision {
            AuthDecision::PassThrough => Ok(Some(request.encode())),
            AuthDecision::Map(credential) => {
                let user = credential.username_or(&request.user).to_owned();
                let rewritten = match credential {
                    MappedCredential::Password { password, .. } => {
                        AuthRequest::password(&user, &password)
                    }
                    MappedCredential::PrivateKey { key, .. } => {
                        // Re-sign against the upstream session identifier;
                        // the client's signature cannot verify there.
                        sign_request(&user, &key, self.up.session_id())
                            .map_err(ProxyError::Auth)?
                    }
                };
                Ok(Some(rewritten.encode()))
            }
            AuthDecision::Discard => {
                // Tell the client the attempt went nowhere so it can retry;
                // a silently consumed request would hang the session.
                let failure = wire::UserAuthFailure {
                    methods: vec!["publickey".into(), "password".into()],
                    partial: false,
                };
                self.down
                    .write_packet(&failure.encode())
                    .await
                    .map_err(AuthError::from)
                    .map_err(ProxyError::Auth)?;
                Ok(None)
            }
            AuthDecision::None => Ok(Some(AuthRequest::none(&request.user).encode())),
        }
    }

    /// Forwards one request upstream and relays replies downstream verbatim
    /// until the backend answers it. Banners, extension info, and keepalives
    /// arriving meanwhile pass through without affecting loop state.
    async fn forward_and_await(&mut self, packet: &[u8]) -> Result<bool, ProxyError> {
        self.up
            .write_packet(packet)
            .await
            .map_err(AuthError::from)
            .map_err(ProxyError::Auth)?;
        loop {
            let reply = self
                .up
                .read_packet()
                .await
                .map_err(AuthError::from)
                .map_err(ProxyError::Auth)?;
            let ty = wire::packet_type(&reply).map_err(AuthError::from).map_err(ProxyError::Auth)?;
            match ty {
                MSG_USERAUTH_SUCCESS => {
                    self.relay_down(&reply).await?;
                    return Ok(true);
                }
                MSG_USERAUTH_FAILURE => {
                    self.relay_down(&reply).await?;
                    return Ok(false);
                }
                MSG_USERAUTH_BANNER | MSG_EXT_INFO | MSG_IGNORE | MSG_DEBUG => {
                    self.relay_down(&reply).await?;
                }
                other => return Err(AuthError::UnexpectedMessage(other).into()),
            }
        }
    }

    async fn relay_down(&mut self, packet: &[u8]) -> Result<(), ProxyError> {
        self.down
            .write_packet(packet)
            .await
            .map_err(AuthError::from)
            .map_err(ProxyError::Auth)
    }
}
