//! Process-wide registries over every server and stream channel, so a
//! host can start and stop the lot without threading references around.

use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::error::Result;
use crate::server::{ChannelServer, ListenerGroup, ServerState};

static SERVERS: Lazy<Mutex<Vec<Weak<ChannelServer>>>> = Lazy::new(|| Mutex::new(Vec::new()));
static STREAM_CHANNELS: Lazy<Mutex<Vec<Weak<Channel>>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub(crate) fn register_server(server: &Arc<ChannelServer>) {
    let mut servers = SERVERS.lock();
    servers.retain(|entry| entry.strong_count() > 0);
    servers.push(Arc::downgrade(server));
}

pub(crate) fn register_stream_channel(channel: &Arc<Channel>) {
    let mut channels = STREAM_CHANNELS.lock();
    channels.retain(|entry| entry.strong_count() > 0);
    channels.push(Arc::downgrade(channel));
}

fn live<T>(registry: &Mutex<Vec<Weak<T>>>) -> Vec<Arc<T>> {
    let mut entries = registry.lock();
    entries.retain(|entry| entry.strong_count() > 0);
    entries.iter().filter_map(Weak::upgrade).collect()
}

/// Start every registered server and stream channel that is not already
/// running. The first failure is returned; its server has already fired
/// its failure callbacks.
pub async fn start_all() -> Result<()> {
    for server in live(&SERVERS) {
        if server.state() == ServerState::Unknown {
            server.listen().await?;
        }
    }
    for channel in live(&STREAM_CHANNELS) {
        channel.start().await?;
    }
    Ok(())
}

/// Stop every registered server and stream channel.
pub async fn stop_all() {
    for server in live(&SERVERS) {
        server.stop();
    }
    for channel in live(&STREAM_CHANNELS) {
        channel.stop().await;
    }
}

/// Start everything, wait for every accept loop to exit, then park the
/// task for the life of the process.
pub async fn run_forever() -> Result<()> {
    start_all().await?;
    ListenerGroup::global().wait().await;
    std::future::pending::<()>().await;
    Ok(())
}
