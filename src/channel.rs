use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::backend::{ChannelBackend, SocketBackend, StdioBackend};
use crate::command::Command;
use crate::config::ServerConfig;
use crate::delegate::ChannelDelegate;
use crate::error::Result;
use crate::message::{value_to_wire, Message};
use crate::processor::MessageProcessor;
use crate::registry;
use crate::server::ConnectionManager;

/// A logical two-way JSON-message pipe between this process and a Vim
/// session.
///
/// A channel pairs a transport backend with an application delegate and
/// keeps the table of outgoing commands still awaiting their reply.
/// Incoming frames are routed on a dedicated dispatch task: positive ids
/// go to the delegate as requests, negative ids are matched against the
/// pending-replies table.
pub struct Channel {
    backend: Box<dyn ChannelBackend>,
    delegate: Arc<dyn ChannelDelegate>,
    pending: Mutex<HashMap<i64, Command>>,
    next_id: AtomicI64,
}

impl Channel {
    /// Channel over this process's standard streams. The channel is
    /// registered so [`crate::start_all`] and [`crate::stop_all`] reach it.
    pub fn stdio(delegate: Arc<dyn ChannelDelegate>) -> Arc<Self> {
        let channel = Self::build(delegate, |processor| {
            Box::new(StdioBackend::new(processor))
        });
        registry::register_stream_channel(&channel);
        channel
    }

    /// Channel over one accepted client socket, owned by `manager`.
    pub(crate) fn socket(
        stream: TcpStream,
        fd: RawFd,
        manager: Weak<ConnectionManager>,
        delegate: Arc<dyn ChannelDelegate>,
        config: &ServerConfig,
    ) -> Arc<Self> {
        Self::build(delegate, |processor| {
            Box::new(SocketBackend::new(stream, fd, manager, processor, config))
        })
    }

    pub(crate) fn build<F>(delegate: Arc<dyn ChannelDelegate>, make_backend: F) -> Arc<Self>
    where
        F: FnOnce(MessageProcessor) -> Box<dyn ChannelBackend>,
    {
        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            backend: make_backend(MessageProcessor::new(handoff_tx)),
            delegate,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(-1),
        });
        Self::spawn_dispatch(Arc::downgrade(&channel), handoff_rx);
        channel
    }

    /// Begin consuming bytes. Safe to call more than once.
    pub async fn start(&self) -> Result<()> {
        self.backend.start().await
    }

    /// Cease reads unconditionally and tear the transport down.
    pub async fn stop(&self) {
        self.backend.stop().await;
    }

    /// Let queued outbound bytes drain, then close.
    pub async fn prepare_to_close(&self) {
        self.backend.prepare_to_close().await;
    }

    /// Resolves once the transport has shut down.
    pub async fn wait_closed(&self) {
        self.backend.closed().await;
    }

    /// Allocate the next correlation id for an `Expr` or `Call` command:
    /// -1, -2, -3, and so on.
    pub fn next_request_id(&self) -> i64 {
        self.next_id.fetch_sub(1, Ordering::SeqCst)
    }

    /// Number of sent commands still awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Reply to a message received from Vim, echoing its id.
    pub async fn respond_to(&self, message: &Message, body: Value) -> Result<()> {
        let reply = Message::new(message.id, body);
        let bytes = match reply.to_wire() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(id = reply.id, "failed to serialize reply, dropping: {e}");
                return Ok(());
            }
        };
        debug!(id = reply.id, "sending reply");
        self.backend.write(bytes).await
    }

    /// Send a command for Vim to execute. Commands carrying an id are
    /// entered into the pending-replies table before any byte goes out,
    /// so even an immediate response finds its match.
    pub async fn send(&self, command: Command) -> Result<()> {
        let bytes = match value_to_wire(&command.encode()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to serialize command, dropping: {e}");
                return Ok(());
            }
        };
        let id = command.id();
        if let Some(id) = id {
            self.pending.lock().await.insert(id, command);
            debug!(id, "command awaiting response");
        }
        match self.backend.write(bytes).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(id) = id {
                    self.pending.lock().await.remove(&id);
                }
                Err(e)
            }
        }
    }

    /// Redraw Vim's screen.
    pub async fn redraw(&self, force: bool) -> Result<()> {
        self.send(Command::Redraw { force }).await
    }

    /// Execute an ex command.
    pub async fn ex(&self, command: impl Into<String>) -> Result<()> {
        self.send(Command::Ex {
            command: command.into(),
        })
        .await
    }

    /// Feed keys as if typed in normal mode.
    pub async fn normal(&self, keys: impl Into<String>) -> Result<()> {
        self.send(Command::Normal { keys: keys.into() }).await
    }

    /// Evaluate an expression and request a response. Returns the
    /// allocated id; the answer arrives at the delegate's
    /// `on_response_to_command` carrying that id.
    pub async fn expr(&self, expr: impl Into<String>) -> Result<i64> {
        let id = self.next_request_id();
        self.send(Command::Expr {
            expr: expr.into(),
            id: Some(id),
        })
        .await?;
        Ok(id)
    }

    /// Evaluate an expression, discarding the result.
    pub async fn expr_async(&self, expr: impl Into<String>) -> Result<()> {
        self.send(Command::Expr {
            expr: expr.into(),
            id: None,
        })
        .await
    }

    /// Call a function and request a response. Returns the allocated id,
    /// as for [`Channel::expr`].
    pub async fn call(&self, func: impl Into<String>, args: Vec<Value>) -> Result<i64> {
        let id = self.next_request_id();
        self.send(Command::Call {
            func: func.into(),
            args,
            id: Some(id),
        })
        .await?;
        Ok(id)
    }

    /// Call a function, discarding the result.
    pub async fn call_async(&self, func: impl Into<String>, args: Vec<Value>) -> Result<()> {
        self.send(Command::Call {
            func: func.into(),
            args,
            id: None,
        })
        .await
    }

    fn spawn_dispatch(channel: Weak<Channel>, mut handoff: mpsc::UnboundedReceiver<Message>) {
        tokio::spawn(async move {
            while let Some(message) = handoff.recv().await {
                let Some(channel) = channel.upgrade() else {
                    break;
                };
                channel.route(message).await;
            }
        });
    }

    async fn route(self: &Arc<Self>, message: Message) {
        if message.id < 0 {
            let command = self.pending.lock().await.remove(&message.id);
            match command {
                Some(command) => {
                    debug!(id = message.id, "matched response to command");
                    self.delegate
                        .on_response_to_command(self, message, command)
                        .await;
                }
                None => {
                    warn!(id = message.id, "response for unknown command id, dropping");
                }
            }
        } else {
            self.delegate.on_message(self, message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tokio::time::{timeout, Duration};

    struct Recorder {
        messages: mpsc::UnboundedSender<Message>,
        responses: mpsc::UnboundedSender<(Message, Command)>,
    }

    #[async_trait]
    impl ChannelDelegate for Recorder {
        async fn on_message(&self, _channel: &Arc<Channel>, message: Message) {
            let _ = self.messages.send(message);
        }

        async fn on_response_to_command(
            &self,
            _channel: &Arc<Channel>,
            response: Message,
            command: Command,
        ) {
            let _ = self.responses.send((response, command));
        }
    }

    struct Harness {
        channel: Arc<Channel>,
        processor: MessageProcessor,
        written: Arc<StdMutex<Vec<Bytes>>>,
        messages: mpsc::UnboundedReceiver<Message>,
        responses: mpsc::UnboundedReceiver<(Message, Command)>,
    }

    fn harness() -> Harness {
        let (messages_tx, messages) = mpsc::unbounded_channel();
        let (responses_tx, responses) = mpsc::unbounded_channel();
        let delegate = Arc::new(Recorder {
            messages: messages_tx,
            responses: responses_tx,
        });
        let (backend, written) = MockBackend::new();
        let slot: Arc<StdMutex<Option<MessageProcessor>>> = Arc::new(StdMutex::new(None));
        let slot_clone = slot.clone();
        let channel = Channel::build(delegate, move |processor| {
            *slot_clone.lock().unwrap() = Some(processor);
            Box::new(backend)
        });
        let processor = slot.lock().unwrap().take().unwrap();
        Harness {
            channel,
            processor,
            written,
            messages,
            responses,
        }
    }

    fn feed(harness: &Harness, bytes: &[u8]) {
        let mut buf = bytes::BytesMut::from(bytes);
        assert!(harness.processor.process(&mut buf));
    }

    #[tokio::test]
    async fn send_with_id_tracks_pending_until_response() {
        let mut h = harness();
        let cmd = Command::Expr {
            expr: "line('$')".to_string(),
            id: Some(-2),
        };
        h.channel.send(cmd.clone()).await.unwrap();
        assert_eq!(h.channel.pending_count().await, 1);
        assert_eq!(
            &h.written.lock().unwrap()[0][..],
            b"[\"expr\",\"line('$')\",-2]\n"
        );

        feed(&h, b"[-2,\"42\"]");
        let (response, command) = timeout(Duration::from_secs(5), h.responses.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.id, -2);
        assert_eq!(response.body, json!("42"));
        assert_eq!(command, cmd);
        assert_eq!(h.channel.pending_count().await, 0);
    }

    #[tokio::test]
    async fn send_without_id_creates_no_pending_entry() {
        let h = harness();
        h.channel
            .send(Command::Call {
                func: "setline".to_string(),
                args: vec![json!("$"), json!(["a", "b", "c"])],
                id: None,
            })
            .await
            .unwrap();
        assert_eq!(h.channel.pending_count().await, 0);
        assert_eq!(
            &h.written.lock().unwrap()[0][..],
            b"[\"call\",\"setline\",[\"$\",[\"a\",\"b\",\"c\"]]]\n"
        );
    }

    #[tokio::test]
    async fn unknown_negative_id_is_dropped() {
        let mut h = harness();
        feed(&h, b"[-5,\"stray\"]");
        // Deliver something afterwards to prove the dispatch task skipped
        // the stray response rather than stalling on it.
        feed(&h, b"[1,\"next\"]");
        let msg = timeout(Duration::from_secs(5), h.messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.id, 1);
        assert!(h.responses.try_recv().is_err());
    }

    #[tokio::test]
    async fn positive_and_zero_ids_reach_on_message() {
        let mut h = harness();
        feed(&h, b"[7,\"req\"]{\"event\":\"ping\"}");

        let msg = timeout(Duration::from_secs(5), h.messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.id, 7);

        let msg = timeout(Duration::from_secs(5), h.messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.id, 0);
        assert_eq!(msg.body, json!({"event": "ping"}));
    }

    #[tokio::test]
    async fn respond_to_echoes_the_request_id() {
        let h = harness();
        let request = Message::new(3, json!("hello!"));
        h.channel
            .respond_to(&request, json!("got it!"))
            .await
            .unwrap();
        assert_eq!(&h.written.lock().unwrap()[0][..], b"[3,\"got it!\"]\n");
    }

    #[tokio::test]
    async fn request_ids_count_down_from_minus_one() {
        let h = harness();
        assert_eq!(h.channel.next_request_id(), -1);
        assert_eq!(h.channel.next_request_id(), -2);
        assert_eq!(h.channel.next_request_id(), -3);
    }

    #[tokio::test]
    async fn convenience_senders_encode_like_their_commands() {
        let h = harness();
        h.channel.redraw(false).await.unwrap();
        h.channel.ex("echo 'hi'").await.unwrap();
        h.channel.normal("gg").await.unwrap();
        h.channel.expr_async("mode()").await.unwrap();
        h.channel
            .call_async("setline", vec![json!(1), json!("x")])
            .await
            .unwrap();

        let written = h.written.lock().unwrap();
        assert_eq!(&written[0][..], b"[\"redraw\",\"\"]\n");
        assert_eq!(&written[1][..], b"[\"ex\",\"echo 'hi'\"]\n");
        assert_eq!(&written[2][..], b"[\"normal\",\"gg\"]\n");
        assert_eq!(&written[3][..], b"[\"expr\",\"mode()\"]\n");
        assert_eq!(&written[4][..], b"[\"call\",\"setline\",[1,\"x\"]]\n");
        drop(written);
        assert_eq!(h.channel.pending_count().await, 0);
    }

    #[tokio::test]
    async fn expr_allocates_an_id_and_awaits_its_answer() {
        let mut h = harness();
        let id = h.channel.expr("line('$')").await.unwrap();
        assert_eq!(id, -1);
        assert_eq!(h.channel.pending_count().await, 1);
        assert_eq!(
            &h.written.lock().unwrap()[0][..],
            b"[\"expr\",\"line('$')\",-1]\n"
        );

        feed(&h, b"[-1,99]");
        let (response, command) = timeout(Duration::from_secs(5), h.responses.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.body, json!(99));
        assert_eq!(command.id(), Some(id));
        assert_eq!(h.channel.pending_count().await, 0);
    }

    #[tokio::test]
    async fn call_allocates_ids_independently_of_expr() {
        let h = harness();
        let first = h.channel.call("bufnr", vec![json!("%")]).await.unwrap();
        let second = h.channel.expr("mode()").await.unwrap();
        assert_eq!(first, -1);
        assert_eq!(second, -2);
        assert_eq!(h.channel.pending_count().await, 2);
    }
}
