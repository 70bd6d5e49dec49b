//! Accept server, its lifecycle ledger, and the connection table.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::delegate::ChannelDelegate;
use crate::error::{ChannelError, Result};
use crate::registry;

mod lifecycle;
mod listener;
mod manager;

pub use lifecycle::{LifecycleCallback, LifecycleManager, Signal};
pub use listener::{ListenerGroup, ListenerGuard};
pub use manager::ConnectionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unknown,
    Started,
    Stopped,
    Failed,
}

/// Listens for Vim clients on a TCP port and hands each accepted socket
/// to the connection manager.
///
/// The accept loop runs on its own task, joined to the process-wide
/// listener group. `stop` closes the listening socket; the loop observes
/// the close, fires the shutdown callbacks exactly once, and exits.
/// Callbacks registered after their phase has already passed fire
/// immediately on registration.
pub struct ChannelServer {
    config: ServerConfig,
    delegate: Arc<dyn ChannelDelegate>,
    state: Mutex<ServerState>,
    lifecycle: LifecycleManager,
    manager: Arc<ConnectionManager>,
    shutdown: CancellationToken,
    bound: Mutex<Option<SocketAddr>>,
}

impl ChannelServer {
    /// Create a server. The instance is registered so [`crate::start_all`]
    /// and [`crate::stop_all`] reach it; registration does not keep it
    /// alive.
    pub fn new(config: ServerConfig, delegate: Arc<dyn ChannelDelegate>) -> Arc<Self> {
        let server = Arc::new(Self {
            manager: ConnectionManager::new(config.clone()),
            config,
            delegate,
            state: Mutex::new(ServerState::Unknown),
            lifecycle: LifecycleManager::new(),
            shutdown: CancellationToken::new(),
            bound: Mutex::new(None),
        });
        registry::register_server(&server);
        server
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// The address actually bound, once listening. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub async fn connection_count(&self) -> usize {
        self.manager.count().await
    }

    pub fn on_startup(&self, callback: impl Fn() + Send + Sync + 'static) {
        let callback: LifecycleCallback = Arc::new(callback);
        self.lifecycle.add_startup(callback.clone());
        if matches!(self.state(), ServerState::Started | ServerState::Stopped) {
            callback();
        }
    }

    pub fn on_shutdown(&self, callback: impl Fn() + Send + Sync + 'static) {
        let callback: LifecycleCallback = Arc::new(callback);
        self.lifecycle.add_shutdown(callback.clone());
        if self.state() == ServerState::Stopped {
            callback();
        }
    }

    pub fn on_failure(&self, callback: impl Fn() + Send + Sync + 'static) {
        let callback: LifecycleCallback = Arc::new(callback);
        self.lifecycle.add_failure(callback.clone());
        if self.state() == ServerState::Failed {
            callback();
        }
    }

    /// Bind the listening socket and launch the accept loop. A bind or
    /// listen failure moves the server to `Failed`, fires the failure
    /// callbacks, and surfaces the error.
    pub async fn listen(self: &Arc<Self>) -> Result<()> {
        if self.state() != ServerState::Unknown {
            return Err(ChannelError::server("server already started"));
        }
        let listener = match self.bind_listener() {
            Ok(listener) => listener,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };
        *self.bound.lock() = listener.local_addr().ok();
        *self.state.lock() = ServerState::Started;
        info!(addr = ?self.local_addr(), "server listening");
        self.lifecycle.fire_startup();

        let guard = ListenerGroup::global().enter();
        let server = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            server.accept_loop(listener).await;
        });
        Ok(())
    }

    fn bind_listener(&self) -> Result<TcpListener> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port).parse()?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(self.config.backlog)?)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    if self.state() == ServerState::Stopped {
                        info!("accept loop exiting after stop");
                        self.lifecycle.fire_shutdown();
                    }
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "accepted connection");
                        self.manager.open(stream, self.delegate.clone()).await;
                    }
                    Err(e) => {
                        if self.state() == ServerState::Stopped {
                            info!("accept interrupted by stop");
                            self.lifecycle.fire_shutdown();
                            return;
                        }
                        self.fail(&e.into());
                        return;
                    }
                }
            }
        }
    }

    fn fail(&self, err: &ChannelError) {
        error!("server failed: {err}");
        *self.state.lock() = ServerState::Failed;
        self.lifecycle.fire_failure();
    }

    /// Stop accepting. Asynchronous: the accept loop observes the closed
    /// listener and exits through the orderly shutdown path. A second
    /// call is a no-op.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != ServerState::Started {
                return;
            }
            *state = ServerState::Stopped;
        }
        info!("stopping server");
        self.shutdown.cancel();
    }

    /// Stop the server when `sig` is delivered to the process.
    pub fn stop_on_signal(self: &Arc<Self>, sig: Signal) -> Result<()> {
        let server = Arc::downgrade(self);
        self.lifecycle.install_signal(
            sig,
            Arc::new(move || {
                if let Some(server) = server.upgrade() {
                    server.stop();
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::message::Message;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout, Duration};

    struct NullDelegate;

    #[async_trait]
    impl ChannelDelegate for NullDelegate {
        async fn on_message(&self, _channel: &Arc<Channel>, _message: Message) {}
    }

    fn test_server() -> Arc<ChannelServer> {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        ChannelServer::new(config, Arc::new(NullDelegate))
    }

    async fn wait_for_state(server: &ChannelServer, state: ServerState) {
        timeout(Duration::from_secs(5), async {
            while server.state() != state {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn startup_fires_once_on_listen() {
        let server = test_server();
        let startups = Arc::new(AtomicUsize::new(0));
        let counter = startups.clone();
        server.on_startup(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        server.listen().await.unwrap();
        assert_eq!(server.state(), ServerState::Started);
        assert_eq!(startups.load(Ordering::SeqCst), 1);
        assert!(server.local_addr().is_some());
        server.stop();
    }

    #[tokio::test]
    async fn stop_fires_shutdown_once_and_is_idempotent() {
        let server = test_server();
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = shutdowns.clone();
        server.on_shutdown(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = failures.clone();
        server.on_failure(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        server.listen().await.unwrap();
        server.stop();
        wait_for_state(&server, ServerState::Stopped).await;

        timeout(Duration::from_secs(5), async {
            while shutdowns.load(Ordering::SeqCst) == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        server.stop();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callbacks_after_terminal_state_fire_immediately() {
        let server = test_server();
        server.listen().await.unwrap();
        server.stop();
        wait_for_state(&server, ServerState::Stopped).await;

        let startups = Arc::new(AtomicUsize::new(0));
        let counter = startups.clone();
        server.on_startup(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(startups.load(Ordering::SeqCst), 1);

        let shutdowns = Arc::new(AtomicUsize::new(0));
        let counter = shutdowns.clone();
        server.on_shutdown(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bind_failure_fires_failure_callbacks() {
        // Take a port, then try to bind it again without reuseport.
        let holder = test_server();
        holder.listen().await.unwrap();
        let addr = holder.local_addr().unwrap();

        let config = ServerConfig {
            port: addr.port(),
            ..ServerConfig::default()
        };
        let server = ChannelServer::new(config, Arc::new(NullDelegate));
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        server.on_failure(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(server.listen().await.is_err());
        assert_eq!(server.state(), ServerState::Failed);
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // Registering after the failure fires immediately as well.
        let late = Arc::new(AtomicUsize::new(0));
        let counter = late.clone();
        server.on_failure(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);

        holder.stop();
    }

    #[tokio::test]
    async fn listen_twice_is_rejected() {
        let server = test_server();
        server.listen().await.unwrap();
        assert!(server.listen().await.is_err());
        server.stop();
    }
}
