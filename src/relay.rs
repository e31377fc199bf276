//! Raw packet relay for the post-authentication phase.
//!
//! Copies packets verbatim in both directions; no inspection happens here.
//! Channel semantics layered above authentication are opaque payloads.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::error::ChannelError;
use crate::transport::{PacketChannel, PacketReader, PacketWriter};

/// Relays packets between the two channels until either direction fails or
/// closes. Whichever direction finishes first wins the race; returning drops
/// all four split halves, which tears down both streams and unblocks the
/// other direction.
///
/// A clean close by either peer is the expected outcome of a normal
/// disconnect and reports as `Ok`.
pub async fn run<D, U>(down: PacketChannel<D>, up: PacketChannel<U>) -> Result<(), ChannelError>
where
    D: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (down_read, down_write) = down.into_split();
    let (up_read, up_write) = up.into_split();

    let outcome = tokio::select! {
        err = pump(down_read, up_write) => err,
        err = pump(up_read, down_write) => err,
    };
    match outcome {
        ChannelError::Closed => {
            trace!("relay ended on clean close");
            Ok(())
        }
        err => Err(err),
    }
}

/// Copies packets from one channel's read half to the other's write half and
/// returns the error that ended the direction.
async fn pump<R, W>(mut read: PacketReader<R>, mut write: PacketWriter<W>) -> ChannelError
where
    R: AsyncRead + AsyncWrite + Unpin,
    W: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let packet = match read.read_packet().await {
            Ok(packet) => packet,
            Err(err) => return err,
        };
        if let Err(err) = write.write_packet(&packet).await {
            return err;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packets_cross_unchanged_until_close() {
        let (client, down_stream) = tokio::io::duplex(4096);
        let (backend, up_stream) = tokio::io::duplex(4096);
        let down = PacketChannel::new(down_stream, [1u8; 32]);
        let up = PacketChannel::new(up_stream, [2u8; 32]);
        let mut client = PacketChannel::new(client, [1u8; 32]);
        let mut backend = PacketChannel::new(backend, [2u8; 32]);

        let relay = tokio::spawn(run(down, up));

        client.write_packet(&[90, 1, 2]).await.unwrap();
        assert_eq!(backend.read_packet().await.unwrap(), vec![90, 1, 2]);
        backend.write_packet(&[91, 3]).await.unwrap();
        assert_eq!(client.read_packet().await.unwrap(), vec![91, 3]);

        // A clean client close ends the relay without a fault and tears the
        // backend side down as well.
        drop(client);
        assert!(relay.await.unwrap().is_ok());
        assert!(matches!(backend.read_packet().await, Err(ChannelError::Closed)));
    }
}
