//! Reference server speaking Vim's JSON channel protocol.
//!
//! Echoes every request back to Vim. In socket mode, try it from Vim
//! with `:let ch = ch_open('localhost:1337')` and
//! `:echo ch_evalexpr(ch, 'hello')`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, warn};

use vim_channel::{
    Channel, ChannelDelegate, ChannelServer, Command, Message, ServerConfig, Signal,
};

#[derive(Parser, Debug)]
#[command(name = "vim-channel", about = "Reference server for Vim's JSON channel protocol")]
struct Args {
    /// Serve over a TCP socket instead of standard streams
    #[arg(long)]
    socket: bool,

    /// Port to listen on in socket mode
    #[arg(long, default_value_t = 1337)]
    port: u16,

    /// Interface to bind in socket mode
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

struct EchoDelegate;

#[async_trait]
impl ChannelDelegate for EchoDelegate {
    async fn on_message(&self, channel: &Arc<Channel>, message: Message) {
        info!(id = message.id, "message from vim: {}", message.body);
        if message.id > 0 {
            let body = message.body.clone();
            if let Err(e) = channel.respond_to(&message, body).await {
                warn!(id = message.id, "reply failed: {e}");
            }
        }
    }

    async fn on_response_to_command(
        &self,
        _channel: &Arc<Channel>,
        response: Message,
        command: Command,
    ) {
        info!(id = response.id, ?command, "vim answered: {}", response.body);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let args = Args::parse();
    let delegate = Arc::new(EchoDelegate);

    if args.socket {
        let config = ServerConfig {
            host: args.host,
            port: args.port,
            ..ServerConfig::default()
        };
        let server = ChannelServer::new(config, delegate);
        server.stop_on_signal(Signal::Interrupt)?;
        server.stop_on_signal(Signal::Terminate)?;

        let done = Arc::new(Notify::new());
        let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let done = done.clone();
            server.on_shutdown(move || done.notify_one());
        }
        {
            let done = done.clone();
            let failed = failed.clone();
            server.on_failure(move || {
                failed.store(true, std::sync::atomic::Ordering::SeqCst);
                done.notify_one();
            });
        }

        server.listen().await?;
        done.notified().await;
        if failed.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("server failed");
        }
        info!("server stopped");
    } else {
        let channel = Channel::stdio(delegate);
        channel.start().await?;
        channel.wait_closed().await;
        info!("stream channel closed");
    }
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vim_channel=debug,info".to_string()),
        )
        .with_writer(std::io::stderr)
        .init();
}
