//! Transport backends underneath a channel.
//!
//! A backend is the bidirectional byte pipe under one [`crate::Channel`]:
//! either a per-connection TCP socket or the process's standard streams.
//! Both feed inbound bytes through a [`crate::processor::MessageProcessor`]
//! and accept outbound frames through `write`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

mod socket;
mod stdio;

pub use socket::SocketBackend;
pub use stdio::StdioBackend;

#[async_trait]
pub trait ChannelBackend: Send + Sync {
    /// Begin consuming bytes. Idempotent once running.
    async fn start(&self) -> Result<()>;

    /// Cease reads unconditionally and free the underlying descriptors.
    async fn stop(&self);

    /// Let queued outbound bytes drain, then close. Closes immediately
    /// when nothing is buffered.
    async fn prepare_to_close(&self);

    /// Append bytes to the outbound path.
    async fn write(&self, bytes: Bytes) -> Result<()>;

    /// Resolves once the backend has shut down.
    async fn closed(&self);
}

#[cfg(test)]
pub(crate) struct MockBackend {
    written: std::sync::Arc<std::sync::Mutex<Vec<Bytes>>>,
    closed: tokio_util::sync::CancellationToken,
}

#[cfg(test)]
impl MockBackend {
    pub(crate) fn new() -> (Self, std::sync::Arc<std::sync::Mutex<Vec<Bytes>>>) {
        let written = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        (
            Self {
                written: written.clone(),
                closed: tokio_util::sync::CancellationToken::new(),
            },
            written,
        )
    }
}

#[cfg(test)]
#[async_trait]
impl ChannelBackend for MockBackend {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {
        self.closed.cancel();
    }

    async fn prepare_to_close(&self) {
        self.closed.cancel();
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        self.written.lock().unwrap().push(bytes);
        Ok(())
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}
