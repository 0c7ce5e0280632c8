//! Network utilities

use crate::Result;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Copy data between two streams bidirectionally.
///
/// Each direction runs until end-of-stream, at which point the peer's write
/// half is shut down so the close propagates promptly. The first I/O error on
/// either leg aborts the whole session; both streams are dropped (and thus
/// closed) when this returns. Returns `(a_to_b, b_to_a)` byte counts.
pub async fn relay<A, B>(a: A, b: B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read_a, mut write_a) = tokio::io::split(a);
    let (mut read_b, mut write_b) = tokio::io::split(b);

    let a_to_b = async {
        let n = tokio::io::copy(&mut read_a, &mut write_b).await?;
        // EOF from a: half-close b so it sees the end of stream
        let _ = write_b.shutdown().await;
        Ok::<u64, std::io::Error>(n)
    };

    let b_to_a = async {
        let n = tokio::io::copy(&mut read_b, &mut write_a).await?;
        let _ = write_a.shutdown().await;
        Ok::<u64, std::io::Error>(n)
    };

    let (sent, received) = tokio::try_join!(a_to_b, b_to_a)?;
    Ok((sent, received))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_relay_moves_bytes_both_ways() {
        let (client, near) = tokio::io::duplex(256);
        let (far, server) = tokio::io::duplex(256);

        let session = tokio::spawn(async move { relay(near, far).await });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        client_write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_write.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // Closing both ends lets the relay finish
        client_write.shutdown().await.unwrap();
        server_write.shutdown().await.unwrap();

        let (sent, received) = session.await.unwrap().unwrap();
        assert_eq!(sent, 4);
        assert_eq!(received, 5);
    }

    #[tokio::test]
    async fn test_relay_propagates_half_close() {
        let (client, near) = tokio::io::duplex(64);
        let (far, server) = tokio::io::duplex(64);

        tokio::spawn(async move {
            let _ = relay(near, far).await;
        });

        let (_client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, _server_write) = tokio::io::split(server);

        client_write.write_all(b"bye").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut buf = Vec::new();
        // Reads the pending bytes, then EOF once the shutdown propagates
        server_read.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
    }
}
