//! Notification reader task

use super::NotifyCodec;
use crate::registry::AddressRegistry;
use crate::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::{debug, error};

/// Reads destination notifications from the tracer's pipe and publishes
/// them to the registry in arrival order.
///
/// `run` only returns on error: a malformed record, or the pipe reaching
/// end-of-stream. Either way no further destinations can be trusted, so the
/// caller must shut the dispatcher down.
pub struct NotificationReader<R> {
    framed: FramedRead<R, NotifyCodec>,
    registry: Arc<AddressRegistry>,
}

impl<R: AsyncRead + Unpin> NotificationReader<R> {
    pub fn new(pipe: R, registry: Arc<AddressRegistry>) -> Self {
        NotificationReader {
            framed: FramedRead::new(pipe, NotifyCodec),
            registry,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(record) = self.framed.next().await {
            let notification = record?;
            debug!("notification: {}", notification);

            match self.registry.register(notification) {
                Ok(()) => {}
                // A duplicate is well-formed but suspicious; the original
                // entry is kept so the earlier connect attempt still matches
                // the destination meant for it.
                Err(Error::DuplicateNotification(key)) => {
                    error!("dropping duplicate notification for key {}", key);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::protocol("notification pipe closed"))
    }
}
