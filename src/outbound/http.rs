//! HTTP proxy upstream
//!
//! Tunnels TCP through an HTTP/1.1 proxy with the CONNECT method. Only the
//! response status line is interpreted; headers are read to the blank line
//! and discarded.

use super::{ConnectError, Upstream};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Largest CONNECT response we accept before giving up
const MAX_RESPONSE_LEN: usize = 1024;

/// HTTP CONNECT proxy connector
pub struct HttpProxyUpstream {
    server: SocketAddr,
}

impl HttpProxyUpstream {
    pub fn new(server: SocketAddr) -> Self {
        HttpProxyUpstream { server }
    }

    async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        dest: SocketAddr,
    ) -> Result<(), ConnectError> {
        let request = format!(
            "CONNECT {dest} HTTP/1.1\r\nHost: {dest}\r\nProxy-Connection: keep-alive\r\n\r\n"
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(ConnectError::DialFailed)?;
        stream.flush().await.map_err(ConnectError::DialFailed)?;

        let mut response = [0u8; MAX_RESPONSE_LEN];
        let mut total_read = 0;

        loop {
            let n = stream
                .read(&mut response[total_read..])
                .await
                .map_err(ConnectError::DialFailed)?;
            if n == 0 {
                return Err(ConnectError::UpstreamRefused(
                    "connection closed during CONNECT".into(),
                ));
            }
            total_read += n;

            if let Some(header_end) = find_header_end(&response[..total_read]) {
                let head = String::from_utf8_lossy(&response[..header_end]);
                let status_line = head.lines().next().unwrap_or("");
                return check_status_line(status_line);
            }

            if total_read >= response.len() {
                return Err(ConnectError::UpstreamRefused(
                    "CONNECT response too large".into(),
                ));
            }
        }
    }
}

/// Accept any 2xx status; 407 is an authentication failure, everything else
/// a refusal.
fn check_status_line(status_line: &str) -> Result<(), ConnectError> {
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            ConnectError::UpstreamRefused(format!("malformed status line: {}", status_line))
        })?;

    match code {
        200..=299 => Ok(()),
        407 => Err(ConnectError::AuthRejected(
            "proxy authentication required".into(),
        )),
        _ => Err(ConnectError::UpstreamRefused(format!(
            "CONNECT failed: {}",
            status_line
        ))),
    }
}

/// Find end of HTTP headers (double CRLF)
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
}

#[async_trait]
impl Upstream for HttpProxyUpstream {
    fn name(&self) -> &str {
        "http-proxy"
    }

    async fn connect(&self, dest: SocketAddr) -> Result<TcpStream, ConnectError> {
        debug!("http proxy connecting to {} via {}", dest, self.server);
        let stream = super::bounded(async {
            let mut stream = super::dial(self.server).await?;
            self.handshake(&mut stream, dest).await?;
            Ok(stream)
        })
        .await?;
        debug!("http proxy connected to {}", dest);
        Ok(stream)
    }
}
