//! Tracegate - local proxy dispatcher for syscall-traced redirection
//!
//! An external tracer intercepts a process's outbound `connect()` calls,
//! points them at our listener and reports the original destination through
//! a named pipe. This crate matches each accepted connection back to its
//! true destination, picks an upstream transport under the configured
//! policy, and relays bytes until either side closes.
//!
//! # Architecture
//!
//! ```text
//!  tracer pipe          intercepted connections
//!       |                         |
//! +-----v------+           +------v------+
//! |  notify/   |           |  inbound/   |
//! |  (reader)  |           | (listener)  |
//! +-----+------+           +------+------+
//!       |                         |
//! +-----v------+           +------v------+
//! | registry/  | <-------> |   tunnel/   |
//! | (matching) |           | (pipeline)  |
//! +------------+           +------+------+
//!                                 |
//!                 +---------------+---------------+
//!                 |               |               |
//!          +------v-----+ +------v------+ +------v------+
//!          |  policy/   | |  outbound/  | | common/net  |
//!          | (selector) | | (connectors)| |  (relay)    |
//!          +------------+ +-------------+ +-------------+
//! ```

pub mod common;
pub mod config;
pub mod inbound;
pub mod notify;
pub mod outbound;
pub mod policy;
pub mod registry;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::ProxyConfig;

use inbound::LocalListener;
use notify::NotificationReader;
use registry::AddressRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{error, info};
use tunnel::Tunnel;

/// Tracegate version
pub const VERSION: &str = "0.2.0";

/// Dispatcher instance wiring registry, listener and notification reader
pub struct Dispatcher {
    registry: Arc<AddressRegistry>,
    listener: LocalListener,
    entry_ttl: std::time::Duration,
}

impl Dispatcher {
    /// Validate the config and bind the listener. The bound address is
    /// available through [`local_addr`](Self::local_addr) before `run`.
    pub async fn bind(config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let entry_ttl = config.entry_ttl;
        let config = Arc::new(config);
        let registry = Arc::new(AddressRegistry::new());
        let tunnel = Arc::new(Tunnel::new(config, registry.clone()));
        let listener = LocalListener::bind(tunnel).await?;

        Ok(Dispatcher {
            registry,
            listener,
            entry_ttl,
        })
    }

    /// The address the tracer must redirect intercepted connects to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until the notification stream fails.
    ///
    /// Per-connection errors are contained inside their tasks; the only
    /// fatal condition is the reader stopping (pipe closed or a malformed
    /// record), after which no destination can be trusted.
    pub async fn run<R>(self, pipe: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        info!("dispatcher starting (v{})", VERSION);

        let sweeper = self.registry.clone().start_sweeper(self.entry_ttl);
        let reader = NotificationReader::new(pipe, self.registry.clone());
        let mut reader_task = tokio::spawn(reader.run());

        let result = tokio::select! {
            res = &mut reader_task => {
                let err = match res {
                    Ok(Err(e)) => e,
                    Ok(Ok(())) => Error::protocol("notification reader stopped"),
                    Err(join) => Error::internal(format!("reader task failed: {}", join)),
                };
                error!("notification stream broken: {}", err);
                Err(err)
            }
            res = self.listener.run() => {
                reader_task.abort();
                res
            }
        };

        sweeper.abort();
        result
    }
}
