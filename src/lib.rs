//! sshgate: a transparent relay for SSH sessions.
//!
//! Terminates an inbound session, resolves the claimed username to a backend
//! host, opens an outbound session there, and makes the client's
//! authentication succeed against the backend, re-signing public-key proofs
//! for the upstream session identifier where policy maps credentials. Once
//! the backend accepts, the relay forwards raw packets in both directions
//! until either side disconnects.

pub mod auth;
pub mod config;
pub mod error;
pub mod proxy;
pub mod relay;
pub mod resolver;
pub mod server;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use error::{AuthError, ChannelError, HandshakeError, ProxyError, ServerError};
pub use proxy::{ProxyConnection, ProxyContext, ProxyTarget};
pub use resolver::{ResolveError, StaticResolver, UpstreamResolver};
pub use server::ProxyServer;
pub use transport::handshake::ServerIdentity;
