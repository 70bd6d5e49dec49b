use std::io::ErrorKind;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::ChannelBackend;
use crate::config::ServerConfig;
use crate::error::{ChannelError, Result};
use crate::processor::MessageProcessor;
use crate::server::ConnectionManager;

/// Backend over one accepted client socket.
///
/// A reader task drains the socket with non-blocking reads whenever it
/// becomes readable and feeds the accumulated bytes to the processor; a
/// partial trailing frame stays in the read buffer between wake-ups.
/// Writes try the socket directly while nothing is queued; whatever does
/// not fit is appended to a bounded write buffer drained by a flush task
/// that is spawned on demand and exits once the buffer empties. With
/// `preparing_to_close` set, the connection closes the moment the write
/// buffer drains; the descriptor itself is released exactly once, when
/// the last task holding the stream exits.
pub struct SocketBackend {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    stream: TcpStream,
    fd: RawFd,
    processor: MessageProcessor,
    manager: Weak<ConnectionManager>,
    write: Mutex<WriteBuffer>,
    preparing_to_close: AtomicBool,
    started: AtomicBool,
    closed: CancellationToken,
    read_chunk: usize,
    high_water: usize,
}

#[derive(Default)]
struct WriteBuffer {
    buffer: BytesMut,
    position: usize,
    flusher_live: bool,
}

impl WriteBuffer {
    fn unflushed(&self) -> usize {
        self.buffer.len() - self.position
    }
}

impl SocketBackend {
    pub(crate) fn new(
        stream: TcpStream,
        fd: RawFd,
        manager: Weak<ConnectionManager>,
        processor: MessageProcessor,
        config: &ServerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                stream,
                fd,
                processor,
                manager,
                write: Mutex::new(WriteBuffer::default()),
                preparing_to_close: AtomicBool::new(false),
                started: AtomicBool::new(false),
                closed: CancellationToken::new(),
                read_chunk: config.read_chunk_size,
                high_water: config.write_high_water,
            }),
        }
    }
}

#[async_trait]
impl ChannelBackend for SocketBackend {
    async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tokio::spawn(read_loop(self.inner.clone()));
        debug!(fd = self.inner.fd, "socket backend started");
        Ok(())
    }

    async fn stop(&self) {
        self.inner.closed.cancel();
    }

    async fn prepare_to_close(&self) {
        self.inner.prepare_to_close().await;
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        self.inner.enqueue(bytes).await
    }

    async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }
}

impl SocketInner {
    /// Close immediately when nothing is buffered, otherwise flag the
    /// connection so the flush task closes it after the final drain.
    async fn prepare_to_close(&self) {
        {
            let write = self.write.lock().await;
            if write.unflushed() > 0 {
                self.preparing_to_close.store(true, Ordering::Release);
                debug!(
                    fd = self.fd,
                    pending = write.unflushed(),
                    "deferring close until writes drain"
                );
                return;
            }
        }
        self.closed.cancel();
    }

    async fn enqueue(self: &Arc<Self>, bytes: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::ChannelClosed);
        }
        let mut write = self.write.lock().await;
        let mut remaining = &bytes[..];
        if write.buffer.is_empty() {
            // Optimistic path: nothing queued, so ordering allows writing
            // straight to the socket until it pushes back.
            while !remaining.is_empty() {
                match self.stream.try_write(remaining) {
                    Ok(n) => remaining = &remaining[n..],
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!(
                            fd = self.fd,
                            errno = e.raw_os_error(),
                            "socket write failed: {e}"
                        );
                        return Err(e.into());
                    }
                }
            }
            if remaining.is_empty() {
                return Ok(());
            }
        }
        if write.unflushed() + remaining.len() > self.high_water {
            return Err(ChannelError::WriteBufferFull {
                fd: self.fd,
                buffered: write.unflushed(),
                high_water: self.high_water,
            });
        }
        write.buffer.extend_from_slice(remaining);
        if !write.flusher_live {
            write.flusher_live = true;
            tokio::spawn(flush_loop(self.clone()));
        }
        Ok(())
    }
}

async fn read_loop(inner: Arc<SocketInner>) {
    let mut buffer = BytesMut::with_capacity(inner.read_chunk);
    loop {
        tokio::select! {
            _ = inner.closed.cancelled() => break,
            ready = inner.stream.readable() => {
                if let Err(e) = ready {
                    error!(fd = inner.fd, errno = e.raw_os_error(), "socket not readable: {e}");
                    inner.prepare_to_close().await;
                    break;
                }
            }
        }
        let mut teardown = false;
        loop {
            buffer.reserve(inner.read_chunk);
            match inner.stream.try_read_buf(&mut buffer) {
                Ok(0) => {
                    debug!(fd = inner.fd, "peer closed connection");
                    teardown = true;
                    break;
                }
                Ok(n) => trace!(fd = inner.fd, bytes = n, "read chunk"),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(
                        fd = inner.fd,
                        errno = e.raw_os_error(),
                        "socket read failed: {e}"
                    );
                    teardown = true;
                    break;
                }
            }
        }
        if !buffer.is_empty() {
            inner.processor.process(&mut buffer);
        }
        if teardown {
            inner.prepare_to_close().await;
            break;
        }
    }
    if let Some(manager) = inner.manager.upgrade() {
        manager.remove(inner.fd).await;
    }
}

enum Flush {
    Done,
    Again,
}

async fn flush_loop(inner: Arc<SocketInner>) {
    loop {
        tokio::select! {
            _ = inner.closed.cancelled() => {
                inner.write.lock().await.flusher_live = false;
                return;
            }
            ready = inner.stream.writable() => {
                if let Err(e) = ready {
                    error!(fd = inner.fd, errno = e.raw_os_error(), "socket not writable: {e}");
                    inner.write.lock().await.flusher_live = false;
                    return;
                }
            }
        }
        let outcome = {
            let mut write = inner.write.lock().await;
            let mut failed = false;
            while write.position < write.buffer.len() {
                match inner.stream.try_write(&write.buffer[write.position..]) {
                    Ok(n) => write.position += n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        // Undeliverable bytes are dropped; teardown is the
                        // reader's job once it observes the broken socket.
                        error!(
                            fd = inner.fd,
                            errno = e.raw_os_error(),
                            dropped = write.unflushed(),
                            "socket write failed: {e}"
                        );
                        failed = true;
                        break;
                    }
                }
            }
            if failed || write.position == write.buffer.len() {
                write.buffer.clear();
                write.position = 0;
                write.flusher_live = false;
                Flush::Done
            } else {
                trace!(fd = inner.fd, pending = write.unflushed(), "partial flush");
                Flush::Again
            }
        };
        if matches!(outcome, Flush::Done) {
            if inner.preparing_to_close.load(Ordering::Acquire) {
                debug!(fd = inner.fd, "write buffer drained, closing");
                inner.closed.cancel();
            }
            return;
        }
    }
}
