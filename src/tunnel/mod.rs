//! Tunnel core - drives one intercepted connection through the pipeline
//!
//! accept -> registry match -> policy decision -> upstream connect -> relay.
//! Every step is bounded in time and every failure here is contained to the
//! one connection.

use crate::common::net;
use crate::config::ProxyConfig;
use crate::outbound::{Direct, HttpProxyUpstream, Socks5Upstream, Upstream};
use crate::policy::{self, Decision};
use crate::registry::AddressRegistry;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Per-connection pipeline shared by all forwarding tasks
pub struct Tunnel {
    config: Arc<ProxyConfig>,
    registry: Arc<AddressRegistry>,
    direct: Direct,
    socks5: Option<Socks5Upstream>,
    http_proxy: Option<HttpProxyUpstream>,
}

impl Tunnel {
    pub fn new(config: Arc<ProxyConfig>, registry: Arc<AddressRegistry>) -> Self {
        let socks5 = config
            .socks5
            .map(|addr| Socks5Upstream::new(addr, config.socks5_auth.clone()));
        let http_proxy = config.http_proxy.map(HttpProxyUpstream::new);

        Tunnel {
            config,
            registry,
            direct: Direct::new(),
            socks5,
            http_proxy,
        }
    }

    /// Entry point for the per-connection task: run the pipeline and log
    /// the outcome. Errors never escalate past this frame.
    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.process(stream, peer).await {
            if e.is_per_connection() {
                debug!("connection from {} dropped: {}", peer, e);
            } else {
                warn!("connection from {} dropped: {}", peer, e);
            }
        }
    }

    async fn process(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        // The tracer saw the redirected socket's source port; it is the
        // peer port on our side of the accept.
        let key = peer.port();
        let notification = self
            .registry
            .await_match(key, self.config.correlation_wait)
            .await?;
        let dest = notification.dest;

        let decision = policy::select(dest, &self.config);
        debug!(
            "pid {} fd {}: {} -> {} via {:?}",
            notification.pid, notification.fd, peer, dest, decision
        );

        let remote = self.connect(decision, dest).await?;

        net::configure_tcp_stream(&stream);
        let (sent, received) = net::relay(stream, remote)
            .await
            .map_err(|e| Error::forward(e.to_string()))?;

        info!(
            "pid {}: {} -> {} done (sent: {}, received: {})",
            notification.pid, peer, dest, sent, received
        );
        Ok(())
    }

    /// Connect through the decided upstream, with at most one fallback to
    /// the alternate configured proxy under auto/random.
    async fn connect(&self, decision: Decision, dest: SocketAddr) -> Result<TcpStream> {
        let upstream = self.upstream(decision)?;
        match upstream.connect(dest).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                if let Some(alternate) = policy::fallback(decision, &self.config) {
                    warn!(
                        "{} to {} failed ({}), retrying via {:?}",
                        upstream.name(),
                        dest,
                        e,
                        alternate
                    );
                    let upstream = self.upstream(alternate)?;
                    Ok(upstream.connect(dest).await?)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    fn upstream(&self, decision: Decision) -> Result<&dyn Upstream> {
        match decision {
            Decision::Direct => Ok(&self.direct),
            Decision::Socks5 => self
                .socks5
                .as_ref()
                .map(|u| u as &dyn Upstream)
                .ok_or_else(|| Error::SelectionRejected("no SOCKS5 address configured".into())),
            Decision::HttpProxy => self
                .http_proxy
                .as_ref()
                .map(|u| u as &dyn Upstream)
                .ok_or_else(|| {
                    Error::SelectionRejected("no HTTP proxy address configured".into())
                }),
            Decision::Reject => Err(Error::SelectionRejected(format!(
                "mode {} has no usable upstream",
                self.config.mode
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyMode;
    use crate::notify::DestNotification;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn tunnel(config: ProxyConfig) -> (Arc<Tunnel>, Arc<AddressRegistry>) {
        let registry = Arc::new(AddressRegistry::new());
        let tunnel = Arc::new(Tunnel::new(Arc::new(config), registry.clone()));
        (tunnel, registry)
    }

    #[tokio::test]
    async fn test_reject_decision_is_selection_rejected() {
        let (tunnel, _) = tunnel(ProxyConfig {
            mode: ProxyMode::OnlySocks5,
            ..Default::default()
        });
        let err = tunnel
            .connect(Decision::Reject, "9.9.9.9:9".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SelectionRejected(_)));
    }

    #[tokio::test]
    async fn test_process_times_out_without_notification() {
        let (tunnel, _) = tunnel(ProxyConfig {
            correlation_wait: Duration::from_millis(50),
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let err = tunnel.process(stream, peer).await.unwrap_err();
        assert!(matches!(err, Error::CorrelationTimeout { .. }));
        drop(client);
    }

    #[tokio::test]
    async fn test_process_relays_after_match() {
        // Echo destination
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let (tunnel, registry) = tunnel(ProxyConfig {
            mode: ProxyMode::Direct,
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        registry
            .register(DestNotification {
                key: peer.port(),
                pid: 1,
                fd: 3,
                dest: echo_addr,
            })
            .unwrap();

        let session = tokio::spawn(tunnel.handle_connection(stream, peer));

        client.write_all(b"howdy").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"howdy");

        drop(client);
        session.await.unwrap();
    }
}
