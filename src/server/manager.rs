use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::delegate::ChannelDelegate;

/// Owns the live connections of one accept server, keyed by descriptor.
///
/// All table mutation happens under one coordination lock. The manager
/// holds the strong references; each connection keeps only a weak
/// pointer back and asks to be removed when its reader exits.
pub struct ConnectionManager {
    connections: Mutex<HashMap<RawFd, Arc<Channel>>>,
    config: ServerConfig,
}

impl ConnectionManager {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Wrap an accepted socket in a channel and start it. A socket that
    /// fails setup is dropped without creating a channel.
    pub async fn open(self: &Arc<Self>, stream: TcpStream, delegate: Arc<dyn ChannelDelegate>) {
        let fd = stream.as_raw_fd();
        let channel = Channel::socket(stream, fd, Arc::downgrade(self), delegate, &self.config);
        self.connections.lock().await.insert(fd, channel.clone());
        if let Err(e) = channel.start().await {
            warn!(fd, "failed to start connection: {e}");
            self.remove(fd).await;
            return;
        }
        debug!(fd, "connection opened");
    }

    /// Take the connection out of the table and let it drain then close.
    pub async fn remove(&self, fd: RawFd) {
        let channel = self.connections.lock().await.remove(&fd);
        if let Some(channel) = channel {
            debug!(fd, "connection removed");
            channel.prepare_to_close().await;
        }
    }

    pub async fn count(&self) -> usize {
        self.connections.lock().await.len()
    }
}
