use std::sync::atomic::{AtomicU8, Ordering};

use bytes::{Buf, BytesMut};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::message::Message;

/// Framing progress for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Waiting for bytes.
    Reset,
    /// Decoding the value at the current read position.
    Initial,
    /// A frame is decoded but not yet handed off.
    Complete,
}

const STATE_RESET: u8 = 0;
const STATE_INITIAL: u8 = 1;
const STATE_COMPLETE: u8 = 2;

/// Frames JSON values off a byte stream and hands each resulting
/// [`Message`] to the channel's dispatch queue, in arrival order.
///
/// Framing is value-by-value: the smallest syntactically valid JSON
/// value at the current read position becomes one frame, whitespace
/// between values is skipped, and no separator is required.
pub struct MessageProcessor {
    state: AtomicU8,
    handoff: mpsc::UnboundedSender<Message>,
}

impl MessageProcessor {
    pub(crate) fn new(handoff: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            state: AtomicU8::new(STATE_RESET),
            handoff,
        }
    }

    pub fn state(&self) -> ProcessorState {
        match self.state.load(Ordering::Acquire) {
            STATE_INITIAL => ProcessorState::Initial,
            STATE_COMPLETE => ProcessorState::Complete,
            _ => ProcessorState::Reset,
        }
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }

    /// Consume as many complete frames as `buf` holds. Returns true when
    /// the buffer was fully consumed (or held nothing useful); false
    /// leaves a partial trailing value in place for the caller to retry
    /// once more bytes arrive.
    pub fn process(&self, buf: &mut BytesMut) -> bool {
        if self.state.load(Ordering::Acquire) == STATE_COMPLETE {
            // A previous hand-off never completed; the dispatch side is
            // gone and retrying cannot help.
            return false;
        }
        loop {
            if buf.is_empty() {
                return true;
            }
            let mut values = serde_json::Deserializer::from_slice(&buf[..]).into_iter::<Value>();
            match values.next() {
                None => {
                    // Nothing but trailing whitespace.
                    buf.clear();
                    return true;
                }
                Some(Ok(value)) => {
                    let consumed = values.byte_offset();
                    self.set_state(STATE_INITIAL);
                    let message = Message::from_value(value);
                    debug!(id = message.id, "framed message");
                    self.set_state(STATE_COMPLETE);
                    if self.handoff.send(message).is_err() {
                        error!("dispatch queue closed, dropping frame");
                        return false;
                    }
                    self.set_state(STATE_RESET);
                    buf.advance(consumed);
                }
                Some(Err(e)) if e.is_eof() => {
                    debug!(pending = buf.len(), "incomplete frame, waiting for more bytes");
                    return false;
                }
                Some(Err(e)) => {
                    error!(dropped = buf.len(), "invalid frame, discarding buffer: {e}");
                    buf.clear();
                    self.set_state(STATE_RESET);
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn processor() -> (MessageProcessor, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MessageProcessor::new(tx), rx)
    }

    #[tokio::test]
    async fn frames_single_message() {
        let (processor, mut rx) = processor();
        let mut buf = BytesMut::from(&b"[1,\"hello!\"]\n"[..]);

        assert!(processor.process(&mut buf));
        assert!(buf.is_empty());
        assert_eq!(processor.state(), ProcessorState::Reset);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.id, 1);
        assert_eq!(msg.body, json!("hello!"));
    }

    #[tokio::test]
    async fn frames_concatenated_messages_in_order() {
        let (processor, mut rx) = processor();
        let mut buf = BytesMut::from(&b"[1,\"a\"][2,\"b\"]\n[3,\"c\"]"[..]);

        assert!(processor.process(&mut buf));
        assert!(buf.is_empty());

        for (id, body) in [(1, "a"), (2, "b"), (3, "c")] {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.id, id);
            assert_eq!(msg.body, json!(body));
        }
    }

    #[tokio::test]
    async fn keeps_partial_trailing_value() {
        let (processor, mut rx) = processor();
        let mut buf = BytesMut::from(&b"[1,\"done\"][2,\"par"[..]);

        assert!(!processor.process(&mut buf));
        assert_eq!(&buf[..], b"[2,\"par");

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.id, 1);

        buf.extend_from_slice(b"tial\"]");
        assert!(processor.process(&mut buf));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.id, 2);
        assert_eq!(msg.body, json!("partial"));
    }

    #[tokio::test]
    async fn drops_invalid_frames() {
        let (processor, mut rx) = processor();
        let mut buf = BytesMut::from(&b"not json at all"[..]);

        assert!(processor.process(&mut buf));
        assert!(buf.is_empty());
        assert_eq!(processor.state(), ProcessorState::Reset);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ignores_empty_and_whitespace_input() {
        let (processor, mut rx) = processor();
        let mut buf = BytesMut::new();
        assert!(processor.process(&mut buf));

        let mut buf = BytesMut::from(&b"  \n\n "[..]);
        assert!(processor.process(&mut buf));
        assert!(buf.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unstructured_value_delivered_with_zero_id() {
        let (processor, mut rx) = processor();
        let mut buf = BytesMut::from(&b"{\"event\":\"ping\"}"[..]);

        assert!(processor.process(&mut buf));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.id, 0);
        assert_eq!(msg.body, json!({"event": "ping"}));
    }

    #[tokio::test]
    async fn reports_failure_once_dispatch_side_is_gone() {
        let (processor, rx) = processor();
        drop(rx);
        let mut buf = BytesMut::from(&b"[1,\"x\"]"[..]);
        assert!(!processor.process(&mut buf));
        assert_eq!(processor.state(), ProcessorState::Complete);
        // Later calls refuse work instead of silently dropping frames.
        let mut buf = BytesMut::from(&b"[2,\"y\"]"[..]);
        assert!(!processor.process(&mut buf));
    }
}
