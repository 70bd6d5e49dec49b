use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::channel::Channel;
use crate::command::Command;
use crate::message::Message;

/// Application hook for decoded channel traffic.
///
/// `on_message` receives Vim-originated requests (positive ids) and
/// uncorrelated bodies (id zero). `on_response_to_command` receives the
/// answer to a command this side sent with a negative id, paired with
/// that command. Callbacks run on the channel's dispatch task, never on
/// the reader, so they may freely call back into the channel.
#[async_trait]
pub trait ChannelDelegate: Send + Sync {
    async fn on_message(&self, channel: &Arc<Channel>, message: Message);

    async fn on_response_to_command(
        &self,
        _channel: &Arc<Channel>,
        response: Message,
        command: Command,
    ) {
        debug!(id = response.id, ?command, "command response ignored");
    }
}
