//! Upstream connectors
//!
//! Three ways to reach the real destination of an intercepted connection:
//! a plain dial, a SOCKS5 tunnel, or an HTTP CONNECT tunnel. All three share
//! one capability and one failure taxonomy.

mod direct;
mod http;
mod socks5;

pub use direct::Direct;
pub use http::HttpProxyUpstream;
pub use socks5::Socks5Upstream;

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Dial + handshake timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Typed connect failure shared by all connectors
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("dial failed: {0}")]
    DialFailed(#[source] io::Error),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("upstream refused: {0}")]
    UpstreamRefused(String),

    #[error("timed out")]
    Timeout,
}

/// Establish a byte-stream channel to `dest`
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    async fn connect(&self, dest: SocketAddr) -> Result<TcpStream, ConnectError>;
}

/// Bound a whole connect sequence (dial plus any proxy handshake) by
/// [`CONNECT_TIMEOUT`]. An upstream that accepts the TCP connection but
/// never answers the handshake must not park the forwarding task forever.
pub(crate) async fn bounded<T, F>(fut: F) -> Result<T, ConnectError>
where
    F: std::future::Future<Output = Result<T, ConnectError>>,
{
    timeout(CONNECT_TIMEOUT, fut)
        .await
        .map_err(|_| ConnectError::Timeout)?
}

/// Dial a TCP connection with TCP options applied. Callers wrap this in
/// [`bounded`] together with their handshake.
pub(crate) async fn dial(addr: SocketAddr) -> Result<TcpStream, ConnectError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(ConnectError::DialFailed)?;
    crate::common::net::configure_tcp_stream(&stream);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_display() {
        let e = ConnectError::UpstreamRefused("connection refused".into());
        assert_eq!(e.to_string(), "upstream refused: connection refused");
        assert_eq!(ConnectError::Timeout.to_string(), "timed out");
    }

    #[test]
    fn test_dial_failure_is_typed() {
        tokio_test::block_on(async {
            // Port 1 on loopback is almost certainly closed
            let err = bounded(dial("127.0.0.1:1".parse().unwrap()))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                ConnectError::DialFailed(_) | ConnectError::Timeout
            ));
        });
    }
}
