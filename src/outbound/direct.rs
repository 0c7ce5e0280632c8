//! Direct outbound (no proxy)

use super::{ConnectError, Upstream};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;

/// Direct connection to the destination
#[derive(Debug, Default)]
pub struct Direct;

impl Direct {
    pub fn new() -> Self {
        Direct
    }
}

#[async_trait]
impl Upstream for Direct {
    fn name(&self) -> &str {
        "direct"
    }

    async fn connect(&self, dest: SocketAddr) -> Result<TcpStream, ConnectError> {
        debug!("direct connecting to {}", dest);
        let stream = super::bounded(super::dial(dest)).await?;
        debug!("direct connected to {}", dest);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_direct_reaches_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
        });

        let mut stream = Direct::new().connect(addr).await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
