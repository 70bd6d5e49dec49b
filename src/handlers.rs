//! Typed request dispatch on top of the delegate seam.
//!
//! A [`HandlerRegistry`] maps method names to typed handlers and acts as
//! a [`ChannelDelegate`]: requests whose body looks like
//! `{"method": ..., "params": ...}` are deserialized into the handler's
//! input type, and the handler's output becomes the reply.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::delegate::ChannelDelegate;
use crate::error::{ChannelError, Result};
use crate::message::Message;

/// What a handler produced: data to send back, or nothing worth saying.
#[derive(Debug)]
pub enum HandlerResult<T> {
    Data(T),
    Empty,
}

/// A typed request handler. Input and output types are checked at
/// compile time; the registry bridges them to JSON at the boundary.
#[async_trait]
pub trait Handler: Send + Sync {
    type Input: DeserializeOwned;
    type Output: Serialize;

    async fn handle(
        &self,
        channel: &Arc<Channel>,
        input: Self::Input,
    ) -> Result<HandlerResult<Self::Output>>;
}

#[async_trait]
trait HandlerDispatch: Send + Sync {
    async fn dispatch(&self, channel: &Arc<Channel>, params: Value) -> Result<Option<Value>>;
}

#[async_trait]
impl<H: Handler> HandlerDispatch for H {
    async fn dispatch(&self, channel: &Arc<Channel>, params: Value) -> Result<Option<Value>> {
        let input: H::Input = serde_json::from_value(params)?;
        match self.handle(channel, input).await? {
            HandlerResult::Data(output) => Ok(Some(serde_json::to_value(output)?)),
            HandlerResult::Empty => Ok(None),
        }
    }
}

/// Method-name to handler map.
///
/// Used directly as the delegate of a channel, it replies to each
/// request with the handler's result, `null` when the handler had
/// nothing to return, or an `{"error": ...}` object when it failed.
/// Bodies without a method name are logged and dropped.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn HandlerDispatch>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler<H: Handler + 'static>(&mut self, method: &str, handler: H) {
        self.handlers.insert(method.to_string(), Arc::new(handler));
    }

    pub async fn dispatch(
        &self,
        channel: &Arc<Channel>,
        method: &str,
        params: Value,
    ) -> Result<Option<Value>> {
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| ChannelError::protocol(format!("unknown method: {method}")))?;
        handler.dispatch(channel, params).await
    }
}

#[async_trait]
impl ChannelDelegate for HandlerRegistry {
    async fn on_message(&self, channel: &Arc<Channel>, message: Message) {
        let Some(method) = message
            .body
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            warn!(id = message.id, "request body carries no method, dropping");
            return;
        };
        let params = message
            .body
            .get("params")
            .cloned()
            .unwrap_or(Value::Null);

        debug!(id = message.id, method, "dispatching request");
        let outcome = self.dispatch(channel, &method, params).await;

        if message.id <= 0 {
            // Nothing to correlate a reply with; the result is dropped.
            return;
        }
        let body = match outcome {
            Ok(Some(result)) => result,
            Ok(None) => Value::Null,
            Err(e) => json!({"error": e.to_string()}),
        };
        if let Err(e) = channel.respond_to(&message, body).await {
            warn!(id = message.id, method, "failed to send reply: {e}");
        }
    }
}
