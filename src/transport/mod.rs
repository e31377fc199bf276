//! Packet-oriented transport over an established byte stream.
//!
//! A [`PacketChannel`] carries discrete packets (one type byte plus payload)
//! framed with a big-endian u32 length, and owns the session identifier fixed
//! during the handshake. Everything above this module is agnostic to the
//! concrete stream type, so tests can drive the full stack over in-memory
//! duplex pipes while the server uses TCP sockets.

pub mod handshake;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::ChannelError;

/// Largest packet accepted or produced on a channel.
pub const MAX_PACKET_LEN: usize = 256 * 1024;

/// Per-connection value fixed during session establishment; authentication
/// signatures bind to it, which is why the relay must re-sign requests it
/// forwards to a different session.
pub type SessionId = [u8; 32];

/// An established, message-oriented connection. Owned exclusively by the
/// proxy connection that created it; dropping it (or either split half pair)
/// closes the underlying stream.
#[derive(Debug)]
pub struct PacketChannel<S> {
    stream: S,
    session_id: SessionId,
}

impl<S> PacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: S, session_id: SessionId) -> Self {
        Self { stream, session_id }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn read_packet(&mut self) -> Result<Vec<u8>, ChannelError> {
        read_packet_from(&mut self.stream).await
    }

    pub async fn write_packet(&mut self, packet: &[u8]) -> Result<(), ChannelError> {
        write_packet_to(&mut self.stream, packet).await
    }

    /// Closes the channel. Safe to call more than once; errors on an already
    /// torn-down stream are ignored.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// Splits the channel into independently owned read and write halves for
    /// the relay phase.
    pub fn into_split(self) -> (PacketReader<S>, PacketWriter<S>)
    where
        S: Send,
    {
        let (read, write) = tokio::io::split(self.stream);
        (PacketReader { read }, PacketWriter { write })
    }
}

/// Read half of a split [`PacketChannel`].
pub struct PacketReader<S> {
    read: ReadHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketReader<S> {
    pub async fn read_packet(&mut self) -> Result<Vec<u8>, ChannelError> {
        read_packet_from(&mut self.read).await
    }
}

/// Write half of a split [`PacketChannel`].
pub struct PacketWriter<S> {
    write: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketWriter<S> {
    pub async fn write_packet(&mut self, packet: &[u8]) -> Result<(), ChannelError> {
        write_packet_to(&mut self.write, packet).await
    }
}

pub(crate) async fn read_packet_from<R>(stream: &mut R) -> Result<Vec<u8>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            // EOF at a frame boundary is a clean close.
            return Err(ChannelError::Closed);
        }
        Err(err) => return Err(ChannelError::Io(err)),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(ChannelError::EmptyPacket);
    }
    if len > MAX_PACKET_LEN {
        return Err(ChannelError::Oversize(len));
    }
    let mut packet = vec![0u8; len];
    stream.read_exact(&mut packet).await?;
    Ok(packet)
}

pub(crate) async fn write_packet_to<W>(stream: &mut W, packet: &[u8]) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    if packet.is_empty() {
        return Err(ChannelError::EmptyPacket);
    }
    if packet.len() > MAX_PACKET_LEN {
        return Err(ChannelError::Oversize(packet.len()));
    }
    let len = (packet.len() as u32).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(packet).await?;
    stream.flush().await?;
    Ok(())
}
