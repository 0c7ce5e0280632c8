//! Local listener
//!
//! Accepts the tracer-redirected connections. The port is OS-assigned so
//! the bound address must be reported back to the supervisor, which hands
//! it to the tracer as the redirect target.

use crate::tunnel::Tunnel;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Accept loop for intercepted connections
pub struct LocalListener {
    listener: TcpListener,
    tunnel: Arc<Tunnel>,
}

impl LocalListener {
    /// Bind an ephemeral loopback port.
    pub async fn bind(tunnel: Arc<Tunnel>) -> Result<Self> {
        Self::bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)), tunnel).await
    }

    pub async fn bind_addr(addr: SocketAddr, tunnel: Arc<Tunnel>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", listener.local_addr()?);
        Ok(LocalListener { listener, tunnel })
    }

    /// The actual bound address (the redirect target for the tracer).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept forever; each connection gets its own task so a slow or stuck
    /// session never blocks the others.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let tunnel = self.tunnel.clone();
                    tokio::spawn(tunnel.handle_connection(stream, peer));
                }
                Err(e) => {
                    // Transient accept errors (EMFILE and friends)
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}
