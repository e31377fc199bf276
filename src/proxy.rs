//! Per-connection composition: handshake, resolution, negotiation, relay.

use std::fmt;
use std::sync::Arc;

use ssh_key::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::auth::{next_auth_request, CredentialPolicy, Negotiator};
use crate::error::{ChannelError, ProxyError};
use crate::resolver::UpstreamResolver;
use crate::transport::handshake::{self, ServerIdentity};
use crate::transport::PacketChannel;
use crate::wire::UserAuthFailure;

/// Capabilities and configuration shared by all connections. Read-only after
/// startup; safe for concurrent use.
pub struct ProxyContext {
    pub identity: ServerIdentity,
    pub resolver: Arc<dyn UpstreamResolver>,
    pub policy: Arc<dyn CredentialPolicy>,
    /// Port every resolved backend host is dialed on.
    pub destination_port: u16,
    /// Backend host key to require, when pinned. `None` accepts any backend
    /// key; this is the documented trust boundary of the relay.
    pub pinned_backend_key: Option<PublicKey>,
}

/// Backend endpoint resolved once per connection; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A fully authenticated pair of channels, ready to relay.
pub struct ProxyConnection<D, U> {
    down: PacketChannel<D>,
    up: PacketChannel<U>,
    pub user: String,
    pub target: ProxyTarget,
}

impl<D, U> ProxyConnection<D, U>
where
    D: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Runs the relay phase to its terminal state. A clean disconnect by
    /// either peer is a normal outcome.
    pub async fn run(self) -> Result<(), ChannelError> {
        crate::relay::run(self.down, self.up).await
    }

    /// Forcibly tears down both channels. Idempotent by construction: the
    /// connection is consumed and each shutdown tolerates an already-closed
    /// stream.
    pub async fn close(mut self) {
        self.down.shutdown().await;
        self.up.shutdown().await;
    }
}

/// Builds a proxy connection from an accepted stream: downstream handshake,
/// username resolution, backend dial and handshake, then authentication
/// negotiation. Every failure after the downstream handshake sends an
/// explicit authentication failure to the client before returning.
pub async fn establish<S>(
    stream: S,
    ctx: &ProxyContext,
) -> Result<ProxyConnection<S, TcpStream>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut down = handshake::server_handshake(stream, &ctx.identity).await?;
    let first = next_auth_request(&mut down).await.map_err(ProxyError::Auth)?;
    let user = first.user.clone();
    debug!(user = %user, method = %first.method, "first authentication request");

    let host = match ctx.resolver.resolve(&user).await {
        Ok(host) => host,
        Err(err) => {
            reject(&mut down).await;
            return Err(err.into());
        }
    };
    let target = ProxyTarget { host, port: ctx.destination_port };
    info!(user = %user, target = %target, "resolved upstream target");

    let backend = match TcpStream::connect((target.host.as_str(), target.port)).await {
        Ok(stream) => stream,
        Err(source) => {
            reject(&mut down).await;
            return Err(ProxyError::Dial { target: target.to_string(), source });
        }
    };
    let mut up = match handshake::client_handshake(backend, ctx.pinned_backend_key.as_ref()).await {
        Ok(up) => up,
        Err(err) => {
            reject(&mut down).await;
            return Err(err.into());
        }
    };

    if let Err(err) = Negotiator::new(&mut down, &mut up, ctx.policy.as_ref())
        .run(first)
        .await
    {
        reject(&mut down).await;
        return Err(err);
    }

    Ok(ProxyConnection { down, up, user, target })
}

/// Handles one accepted connection end to end: establish, then relay.
pub async fn handle<S>(stream: S, ctx: &ProxyContext) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let connection = establish(stream, ctx).await?;
    debug!(user = %connection.user, target = %connection.target, "entering relay phase");
    connection.run().await?;
    Ok(())
}

/// Best-effort explicit failure so the client never observes a silent hang.
/// Errors are ignored; the downstream channel may itself be broken.
async fn reject<S>(down: &mut PacketChannel<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let failure = UserAuthFailure {
        methods: vec!["publickey".into(), "password".into()],
        partial: false,
    };
    let _ = down.write_packet(&failure.encode()).await;
    down.shutdown().await;
}
