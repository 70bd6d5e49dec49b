use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::ChannelBackend;
use crate::error::{ChannelError, Result};
use crate::processor::MessageProcessor;

const READ_CHUNK: usize = 8192;

enum WriteItem {
    Data(Bytes),
    /// Close once everything queued ahead of this marker has gone out.
    Drain,
}

/// Backend over the process's standard streams: stdin for reads, stdout
/// for writes.
///
/// Incoming chunks accumulate until one ends in a line feed, which marks
/// the frame as ripe for the processor. End-of-input flushes whatever is
/// left as a final frame and shuts the backend down. Writes go through
/// an unbounded queue drained by a writer task; the pipe is trusted not
/// to block for long, so there is no backpressure.
pub struct StdioBackend {
    inner: Arc<StdioInner>,
}

struct StdioInner {
    processor: MessageProcessor,
    writer_tx: mpsc::UnboundedSender<WriteItem>,
    writer_rx: Mutex<Option<mpsc::UnboundedReceiver<WriteItem>>>,
    started: AtomicBool,
    closed: CancellationToken,
}

impl StdioBackend {
    pub fn new(processor: MessageProcessor) -> Self {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(StdioInner {
                processor,
                writer_tx,
                writer_rx: Mutex::new(Some(writer_rx)),
                started: AtomicBool::new(false),
                closed: CancellationToken::new(),
            }),
        }
    }
}

#[async_trait]
impl ChannelBackend for StdioBackend {
    async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(writer_rx) = self.inner.writer_rx.lock().await.take() else {
            return Ok(());
        };
        tokio::spawn(write_loop(self.inner.clone(), writer_rx));
        tokio::spawn(read_loop(self.inner.clone()));
        debug!("stdio backend started");
        Ok(())
    }

    async fn stop(&self) {
        self.inner.closed.cancel();
    }

    async fn prepare_to_close(&self) {
        // The marker queues behind any pending writes, so they drain first.
        if self.inner.writer_tx.send(WriteItem::Drain).is_err() {
            self.inner.closed.cancel();
        }
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        self.inner
            .writer_tx
            .send(WriteItem::Data(bytes))
            .map_err(|_| ChannelError::ChannelClosed)
    }

    async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }
}

async fn read_loop(inner: Arc<StdioInner>) {
    let mut stdin = tokio::io::stdin();
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    loop {
        tokio::select! {
            _ = inner.closed.cancelled() => break,
            read = stdin.read_buf(&mut buffer) => match read {
                Ok(0) => {
                    if !buffer.is_empty() {
                        inner.processor.process(&mut buffer);
                    }
                    info!("stdin reached end of input");
                    inner.closed.cancel();
                    break;
                }
                Ok(_) => {
                    // A chunk ending in a line feed marks frames as ripe.
                    if buffer.last() == Some(&b'\n') {
                        inner.processor.process(&mut buffer);
                    }
                }
                Err(e) => {
                    error!("stdin read failed: {e}");
                    inner.closed.cancel();
                    break;
                }
            }
        }
    }
}

async fn write_loop(inner: Arc<StdioInner>, mut writer_rx: mpsc::UnboundedReceiver<WriteItem>) {
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            _ = inner.closed.cancelled() => break,
            item = writer_rx.recv() => match item {
                Some(WriteItem::Data(bytes)) => {
                    if let Err(e) = stdout.write_all(&bytes).await {
                        error!("stdout write failed: {e}");
                        inner.closed.cancel();
                        break;
                    }
                    if let Err(e) = stdout.flush().await {
                        error!("stdout flush failed: {e}");
                        inner.closed.cancel();
                        break;
                    }
                }
                Some(WriteItem::Drain) | None => {
                    inner.closed.cancel();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc as tokio_mpsc;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn write_queues_until_started() {
        let (tx, _rx) = tokio_mpsc::unbounded_channel();
        let backend = StdioBackend::new(MessageProcessor::new(tx));
        backend.write(Bytes::from_static(b"[1,\"x\"]\n")).await.unwrap();
    }

    #[tokio::test]
    async fn stop_resolves_closed_waiters() {
        let (tx, _rx) = tokio_mpsc::unbounded_channel();
        let backend = StdioBackend::new(MessageProcessor::new(tx));
        backend.stop().await;
        timeout(Duration::from_secs(5), backend.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn drain_marker_queues_behind_pending_writes() {
        let (tx, _rx) = tokio_mpsc::unbounded_channel();
        let backend = StdioBackend::new(MessageProcessor::new(tx));
        backend
            .write(Bytes::from_static(b"[1,\"first\"]\n"))
            .await
            .unwrap();
        backend.prepare_to_close().await;

        // Without a writer task running, the queue keeps submission order:
        // the data frame sits ahead of the drain marker.
        let mut rx = backend.inner.writer_rx.lock().await.take().unwrap();
        assert!(matches!(rx.try_recv(), Ok(WriteItem::Data(_))));
        assert!(matches!(rx.try_recv(), Ok(WriteItem::Drain)));
    }
}
