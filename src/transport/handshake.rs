//! Session establishment for both roles of the relay.
//!
//! Performs the version-string exchange, fixes the per-connection session
//! identifier with a host-key-signed nonce exchange, and negotiates the
//! ssh-userauth service. The nonce exchange stands in for a full key exchange
//! behind the same [`PacketChannel`] interface; a production deployment swaps
//! this file for a binding to a complete SSH transport without touching the
//! layers above.
//!
//! Host-key trust toward the backend is deliberately permissive: unless a key
//! is pinned in the configuration, whatever key the backend presents is
//! accepted for that session. Operators are expected to pin keys or run the
//! relay on a trusted network.

use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use signature::{Signer, Verifier};
use ssh_encoding::{Decode, Encode};
use ssh_key::{public::KeyData, HashAlg, PrivateKey, PublicKey, Signature};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{HandshakeError, WireError};
use crate::transport::{read_packet_from, write_packet_to, PacketChannel, SessionId};
use crate::wire::{
    self, ServiceMessage, MSG_KEX_INIT, MSG_KEX_REPLY, MSG_SERVICE_ACCEPT, MSG_SERVICE_REQUEST,
    SERVICE_USERAUTH,
};

/// Version line sent to every peer.
pub const VERSION_LINE: &str = concat!("SSH-2.0-sshgate_", env!("CARGO_PKG_VERSION"));

const NONCE_LEN: usize = 32;
const MAX_PREAMBLE_LINES: usize = 16;
const MAX_VERSION_LINE: usize = 512;

/// Host key material for the server role. Opaque signer handles, read-only
/// after startup and safe to share across connections.
#[derive(Clone)]
pub struct ServerIdentity {
    host_keys: Vec<PrivateKey>,
}

impl ServerIdentity {
    pub fn new(host_keys: Vec<PrivateKey>) -> Self {
        Self { host_keys }
    }

    fn signer(&self) -> Option<&PrivateKey> {
        self.host_keys.first()
    }
}

/// Establishes the downstream (client-facing) channel: version exchange,
/// session establishment as the server, then the ssh-userauth service
/// negotiation. Returns with the channel ready for the first authentication
/// request.
pub async fn server_handshake<S>(
    mut stream: S,
    identity: &ServerIdentity,
) -> Result<PacketChannel<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let signer = identity.signer().ok_or(HandshakeError::NoHostKey)?;
    exchange_versions(&mut stream).await?;

    let init = read_packet_from(&mut stream).await?;
    let client_nonce = decode_kex_init(&init)?;

    let mut server_nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut server_nonce);

    let mut key_blob = Vec::new();
    signer
        .public_key()
        .key_data()
        .encode(&mut key_blob)
        .map_err(WireError::from)?;

    let session_id = exchange_digest(&client_nonce, &server_nonce, &key_blob);
    let sig = signer
        .try_sign(&session_id)
        .map_err(|err| HandshakeError::Signing(err.to_string()))?;
    let mut sig_blob = Vec::new();
    sig.encode(&mut sig_blob).map_err(WireError::from)?;

    let mut reply = vec![MSG_KEX_REPLY];
    reply.extend_from_slice(&server_nonce);
    wire::put_string(&mut reply, &key_blob);
    wire::put_string(&mut reply, &sig_blob);
    write_packet_to(&mut stream, &reply).await?;

    let mut channel = PacketChannel::new(stream, session_id);
    accept_auth_service(&mut channel).await?;
    Ok(channel)
}

/// Establishes the upstream (backend-facing) channel as the client. When a
/// pinned key is supplied the presented host key must match it; otherwise any
/// key whose exchange signature verifies is accepted for this session.
pub async fn client_handshake<S>(
    mut stream: S,
    pinned_host_key: Option<&PublicKey>,
) -> Result<PacketChannel<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    exchange_versions(&mut stream).await?;

    let mut client_nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut client_nonce);
    let mut init = vec![MSG_KEX_INIT];
    init.extend_from_slice(&client_nonce);
    write_packet_to(&mut stream, &init).await?;

    let reply = read_packet_from(&mut stream).await?;
    let (server_nonce, key_blob, sig_blob) = decode_kex_reply(&reply)?;

    let key_data = KeyData::decode(&mut key_blob.as_slice())?;
    let session_id = exchange_digest(&client_nonce, &server_nonce, &key_blob);
    let sig = Signature::decode(&mut sig_blob.as_slice())?;
    key_data
        .verify(&session_id, &sig)
        .map_err(|_| HandshakeError::HostKeySignature)?;

    match pinned_host_key {
        Some(expected) => {
            let mut expected_blob = Vec::new();
            expected
                .key_data()
                .encode(&mut expected_blob)
                .map_err(WireError::from)?;
            if expected_blob != key_blob {
                return Err(HandshakeError::HostKeyMismatch);
            }
        }
        None => {
            let fingerprint = key_data.fingerprint(HashAlg::Sha256);
            debug!(fp = %fingerprint, "no pinned backend host key; accepting for this session");
        }
    }

    Ok(PacketChannel::new(stream, session_id))
}

/// Sends the ssh-userauth service request and requires acceptance. The
/// negotiator drives this as its first step toward the backend; downstream
/// test clients reuse it verbatim.
pub async fn request_auth_service<S>(channel: &mut PacketChannel<S>) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    channel
        .write_packet(&ServiceMessage::request(SERVICE_USERAUTH))
        .await?;
    let packet = channel.read_packet().await?;
    let msg = ServiceMessage::decode(&packet, MSG_SERVICE_ACCEPT)
        .map_err(|_| HandshakeError::ServiceRejected)?;
    if msg.service != SERVICE_USERAUTH {
        return Err(HandshakeError::ServiceRejected);
    }
    Ok(())
}

async fn accept_auth_service<S>(channel: &mut PacketChannel<S>) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let packet = channel.read_packet().await?;
    let msg = ServiceMessage::decode(&packet, MSG_SERVICE_REQUEST)?;
    if msg.service != SERVICE_USERAUTH {
        return Err(HandshakeError::ServiceMismatch(msg.service));
    }
    channel
        .write_packet(&ServiceMessage::accept(SERVICE_USERAUTH))
        .await?;
    Ok(())
}

fn exchange_digest(client_nonce: &[u8], server_nonce: &[u8], key_blob: &[u8]) -> SessionId {
    let mut hasher = Sha256::new();
    hasher.update(client_nonce);
    hasher.update(server_nonce);
    hasher.update(key_blob);
    hasher.finalize().into()
}

fn decode_kex_init(packet: &[u8]) -> Result<[u8; NONCE_LEN], HandshakeError> {
    let ty = wire::packet_type(packet)?;
    if ty != MSG_KEX_INIT {
        return Err(WireError::UnexpectedMessage { expected: MSG_KEX_INIT, actual: ty }.into());
    }
    let body = &packet[1..];
    if body.len() != NONCE_LEN {
        return Err(WireError::Truncated.into());
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(body);
    Ok(nonce)
}

fn decode_kex_reply(packet: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>, Vec<u8>), HandshakeError> {
    let ty = wire::packet_type(packet)?;
    if ty != MSG_KEX_REPLY {
        return Err(WireError::UnexpectedMessage { expected: MSG_KEX_REPLY, actual: ty }.into());
    }
    let mut reader = &packet[1..];
    let mut nonce = [0u8; NONCE_LEN];
    ssh_encoding::Reader::read(&mut reader, &mut nonce).map_err(|_| WireError::Truncated)?;
    let key_blob = wire::read_string(&mut reader)?;
    let sig_blob = wire::read_string(&mut reader)?;
    Ok((nonce, key_blob, sig_blob))
}

async fn exchange_versions<S>(stream: &mut S) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(VERSION_LINE.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;

    // Peers may send banner lines ahead of the version string.
    for _ in 0..MAX_PREAMBLE_LINES {
        let line = read_line(stream).await?;
        if line.starts_with("SSH-") {
            if line.starts_with("SSH-2.0-") {
                return Ok(line);
            }
            return Err(HandshakeError::VersionExchange(line));
        }
    }
    Err(HandshakeError::VersionExchange("no version line received".into()))
}

async fn read_line<S>(stream: &mut S) -> Result<String, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > MAX_VERSION_LINE {
            return Err(HandshakeError::VersionExchange("oversized version line".into()));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map_err(|_| HandshakeError::VersionExchange("non-utf8 version line".into()))
}
