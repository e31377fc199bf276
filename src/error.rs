use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while decoding or encoding userauth wire messages.
#[derive(Error, Debug)]
pub enum WireError {
    /// Message payload ended before a required field.
    #[error("truncated message")]
    Truncated,

    /// Trailing bytes after the last field of a fixed-shape message.
    #[error("trailing bytes after message")]
    TrailingBytes,

    /// A different message type was expected at this point of the exchange.
    #[error("unexpected message type {actual}, expected {expected}")]
    UnexpectedMessage { expected: u8, actual: u8 },

    /// SSH primitive encoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] ssh_encoding::Error),
}

/// Errors on an established packet channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The peer closed the connection at a packet boundary.
    #[error("channel closed by peer")]
    Closed,

    /// A packet exceeded the negotiated maximum size.
    #[error("packet of {0} bytes exceeds maximum")]
    Oversize(usize),

    /// A zero-length packet carries no type byte and is malformed.
    #[error("empty packet")]
    EmptyPacket,

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while establishing a packet channel with either peer.
///
/// Handshake failures are fatal to the connection attempt; there are no
/// retries.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The peer did not present a compatible version string.
    #[error("incompatible peer version {0:?}")]
    VersionExchange(String),

    /// Server role requires at least one host key.
    #[error("no host key configured")]
    NoHostKey,

    /// The peer requested a service other than ssh-userauth.
    #[error("peer requested service {0:?} before authenticating")]
    ServiceMismatch(String),

    /// The backend refused the ssh-userauth service request.
    #[error("authentication service rejected by peer")]
    ServiceRejected,

    /// The backend presented a host key other than the pinned one.
    #[error("backend host key does not match the pinned key")]
    HostKeyMismatch,

    /// The host-key signature over the exchange did not verify.
    #[error("invalid host key signature in handshake")]
    HostKeySignature,

    /// Signing the handshake exchange with the host key failed.
    #[error("host key signing failed: {0}")]
    Signing(String),

    /// Host key material could not be used.
    #[error("host key error: {0}")]
    Key(#[from] ssh_key::Error),

    /// Malformed handshake message.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The channel failed during the handshake exchange.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// I/O error during the version exchange.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures in the authentication negotiation loop.
///
/// All variants are fatal to the connection except signature verification
/// failures, which the negotiator converts into a forced `none` retry before
/// they ever surface here.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Malformed or out-of-order authentication message.
    #[error("authentication protocol error: {0}")]
    Protocol(String),

    /// A message type that is not valid during authentication.
    #[error("unexpected message type {0} during authentication")]
    UnexpectedMessage(u8),

    /// The client offered a signature algorithm the relay does not accept.
    #[error("signature algorithm {0:?} not accepted")]
    UnsupportedAlgorithm(String),

    /// Re-signing with a mapped credential failed.
    #[error("signing with mapped credential failed: {0}")]
    Signing(String),

    /// Key material in an authentication request could not be parsed.
    #[error("key error: {0}")]
    Key(#[from] ssh_key::Error),

    /// Malformed authentication message payload.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The channel failed mid-negotiation.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Terminal result of one proxy connection, reported to the lifecycle
/// manager. Every variant is contained to its own connection.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Version exchange, session establishment, or service negotiation failed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// No backend host is known for the claimed username.
    #[error(transparent)]
    Resolve(#[from] crate::resolver::ResolveError),

    /// The resolved backend could not be reached.
    #[error("failed to dial backend {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Authentication negotiation failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The relay phase ended with a transport fault. A clean peer disconnect
    /// is not reported through this variant.
    #[error("relay failed: {0}")]
    Relay(#[from] ChannelError),
}

/// Errors configuring or starting the proxy server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
