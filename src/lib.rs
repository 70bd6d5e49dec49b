//! Client side of Vim's JSON channel protocol.
//!
//! A [`Channel`] pairs a transport backend with an application
//! [`ChannelDelegate`]. Vim sends requests and unsolicited events as
//! two-element JSON arrays `[id, body]` with `id >= 1`; the delegate
//! replies through [`Channel::respond_to`]. The host may also send
//! [`Command`]s that Vim executes internally; `expr` and `call`
//! commands carrying a negative id are answered by Vim with the same id
//! and routed back to the delegate paired with the original command.
//!
//! Two transports are built in: [`Channel::stdio`] over the process's
//! standard streams, and [`ChannelServer`], which accepts Vim clients
//! on a TCP port and runs one channel per connection.

pub mod backend;
pub mod channel;
pub mod command;
pub mod config;
pub mod delegate;
pub mod error;
pub mod handlers;
pub mod message;
pub mod processor;
mod registry;
pub mod server;

pub use channel::Channel;
pub use command::Command;
pub use config::ServerConfig;
pub use delegate::ChannelDelegate;
pub use error::{ChannelError, Result};
pub use handlers::{Handler, HandlerRegistry, HandlerResult};
pub use message::Message;
pub use registry::{run_forever, start_all, stop_all};
pub use server::{ChannelServer, LifecycleManager, ListenerGroup, ServerState, Signal};
