//! Async message bus — the central nervous system of Oxibot.
//!
//! Replaces nanobot's `bus/queue.py` (asyncio.Queue-based MessageBus),
//! including its per-session inbound buffering and outbound delivery-ack
//! waiter map. Uses tokio::sync::mpsc bounded channels.

use super::types::{CollectedEntry, InboundMessage, OutboundMessage};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, Mutex};

/// State guarding the inbound-buffering protocol: which session (if any) is
/// currently "active" (being processed by the agent), and what has been
/// buffered for it since it became active.
#[derive(Default)]
struct BufferState {
    active_session: Option<String>,
    buffers: HashMap<String, Vec<InboundMessage>>,
}

/// Outcome of an outbound delivery-acknowledgement wait.
pub type AckResult = (bool, Option<String>);

/// The message bus connecting channels ↔ agent loop.
///
/// - Channels publish to `inbound` (user messages arriving)
/// - Agent loop consumes from `inbound`, processes, publishes to `outbound`
/// - Channel manager consumes from `outbound` and routes to correct channel
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::Receiver<OutboundMessage>>,
    buffer: Mutex<BufferState>,
    waiters: Mutex<HashMap<String, oneshot::Sender<AckResult>>>,
}

impl MessageBus {
    /// Create a new message bus with the given buffer capacity.
    pub fn new(buffer_size: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer_size);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer_size);

        MessageBus {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            buffer: Mutex::new(BufferState::default()),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a message from a channel to the agent (inbound).
    ///
    /// If the message's session is currently active (an agent turn for that
    /// session is in flight), it is appended to that session's buffer
    /// instead of entering the queue (see `complete_inbound_turn`).
    pub async fn publish_inbound(
        &self,
        msg: InboundMessage,
    ) -> Result<(), mpsc::error::SendError<InboundMessage>> {
        let mut state = self.buffer.lock().await;
        let key = msg.session_key();
        if state.active_session.as_deref() == Some(key.as_str()) {
            let buf = state.buffers.entry(key.clone()).or_default();
            buf.push(msg);
            tracing::debug!(session = %key, buffered = buf.len(), "buffered inbound message");
            return Ok(());
        }
        drop(state);
        self.inbound_tx.send(msg).await
    }

    /// Consume the next inbound message (blocks until available).
    /// Returns None if all senders are dropped. Marks the message's session
    /// as the active session for buffering purposes.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        let msg = {
            let mut rx = self.inbound_rx.lock().await;
            rx.recv().await
        }?;
        let mut state = self.buffer.lock().await;
        state.active_session = Some(msg.session_key());
        Some(msg)
    }

    /// Mark the given session's turn as complete: drain its buffer, and if
    /// non-empty, enqueue one merged follow-up `InboundMessage` at the tail
    /// of the inbound queue. Clears the active session.
    ///
    /// Does nothing if `session_key` is not the currently active session
    /// (e.g. called twice, or for a session whose turn already ended).
    pub async fn complete_inbound_turn(&self, session_key: &str) {
        let buffered = {
            let mut state = self.buffer.lock().await;
            if state.active_session.as_deref() != Some(session_key) {
                return;
            }
            let buffered = state.buffers.remove(session_key).unwrap_or_default();
            state.active_session = None;
            buffered
        };

        if buffered.is_empty() {
            return;
        }

        let count = buffered.len();
        let merged = Self::merge_buffered(buffered);
        if self.inbound_tx.send(merged).await.is_err() {
            tracing::warn!(session = %session_key, "inbound channel closed while enqueuing merged follow-up");
        } else {
            tracing::debug!(session = %session_key, count, "merged buffered inbound messages");
        }
    }

    /// Merge buffered inbound messages into one follow-up message.
    ///
    /// Ported from nanobot's `MessageBus._merge_buffered_messages`: fields
    /// come from the first entry; `content` is the newline-joined
    /// `"[<sender_id>] <content>"` form (raw content if exactly one entry).
    fn merge_buffered(messages: Vec<InboundMessage>) -> InboundMessage {
        debug_assert!(!messages.is_empty());
        let first = &messages[0];

        let content = if messages.len() == 1 {
            messages[0].content.clone()
        } else {
            messages
                .iter()
                .map(|m| format!("[{}] {}", m.sender_id, m.content))
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        let media = messages.iter().flat_map(|m| m.media.clone()).collect();

        let collected = messages
            .iter()
            .map(|m| CollectedEntry {
                sender_id: m.sender_id.clone(),
                content: m.content.clone(),
                timestamp: m.timestamp,
                media: m.media.clone(),
                metadata: m.metadata.clone(),
            })
            .collect();

        InboundMessage {
            channel: first.channel.clone(),
            sender_id: first.sender_id.clone(),
            chat_id: first.chat_id.clone(),
            content,
            timestamp: first.timestamp,
            media,
            metadata: first.metadata.clone(),
            collected: Some(collected),
        }
    }

    /// Publish a response from the agent to a channel (outbound).
    pub async fn publish_outbound(
        &self,
        msg: OutboundMessage,
    ) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.outbound_tx.send(msg).await
    }

    /// Consume the next outbound message (blocks until available).
    /// Returns None if all senders are dropped.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        let mut rx = self.outbound_rx.lock().await;
        rx.recv().await
    }

    /// Get a clone of the inbound sender (for channels to use).
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Get a clone of the outbound sender (for the agent loop to use).
    pub fn outbound_sender(&self) -> mpsc::Sender<OutboundMessage> {
        self.outbound_tx.clone()
    }

    /// Register a waiter for outbound delivery acknowledgement.
    ///
    /// If a waiter already exists for `request_id`, it is resolved with
    /// `(false, Some("superseded by a newer outbound request"))` before the
    /// new one replaces it.
    pub async fn create_waiter(&self, request_id: &str) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().await;
        if let Some(old) = waiters.insert(request_id.to_string(), tx) {
            let _ = old.send((false, Some("superseded by a newer outbound request".into())));
        }
        rx
    }

    /// Resolve a waiter by request id. A no-op if no such waiter is
    /// registered (or it was already resolved/discarded).
    pub async fn resolve_waiter(&self, request_id: &str, success: bool, error: Option<String>) {
        let mut waiters = self.waiters.lock().await;
        if let Some(tx) = waiters.remove(request_id) {
            let _ = tx.send((success, error));
        }
    }

    /// Drop a waiter without resolving it (used when giving up after a
    /// timeout, so a late resolution doesn't panic on a dropped receiver).
    pub async fn discard_waiter(&self, request_id: &str) {
        self.waiters.lock().await.remove(request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inbound_message_flow() {
        let bus = MessageBus::new(10);

        let msg = InboundMessage::new("telegram", "user_1", "chat_1", "Hello!");
        bus.publish_inbound(msg).await.unwrap();

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.channel, "telegram");
        assert_eq!(received.content, "Hello!");
    }

    #[tokio::test]
    async fn test_outbound_message_flow() {
        let bus = MessageBus::new(10);

        let msg = OutboundMessage::new("discord", "channel_42", "Response here");
        bus.publish_outbound(msg).await.unwrap();

        let received = bus.consume_outbound().await.unwrap();
        assert_eq!(received.channel, "discord");
        assert_eq!(received.content, "Response here");
    }

    #[tokio::test]
    async fn test_message_ordering() {
        let bus = MessageBus::new(10);

        for i in 1..=3 {
            let msg = InboundMessage::new("cli", "local", "default", format!("msg-{}", i));
            bus.publish_inbound(msg).await.unwrap();
        }

        let m1 = bus.consume_inbound().await.unwrap();
        let m2 = bus.consume_inbound().await.unwrap();
        let m3 = bus.consume_inbound().await.unwrap();

        assert_eq!(m1.content, "msg-1");
        assert_eq!(m2.content, "msg-2");
        assert_eq!(m3.content, "msg-3");
    }

    #[tokio::test]
    async fn test_sender_clone_works() {
        let bus = MessageBus::new(10);
        let sender = bus.inbound_sender();

        let msg = InboundMessage::new("slack", "user_x", "channel_y", "From clone");
        sender.send(msg).await.unwrap();

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.channel, "slack");
        assert_eq!(received.content, "From clone");
    }

    #[tokio::test]
    async fn test_multiple_producers() {
        let bus = std::sync::Arc::new(MessageBus::new(10));

        let bus1 = bus.clone();
        let bus2 = bus.clone();

        let h1 = tokio::spawn(async move {
            let msg = InboundMessage::new("telegram", "u1", "c1", "from telegram");
            bus1.publish_inbound(msg).await.unwrap();
        });

        let h2 = tokio::spawn(async move {
            let msg = InboundMessage::new("discord", "u2", "c2", "from discord");
            bus2.publish_inbound(msg).await.unwrap();
        });

        h1.await.unwrap();
        h2.await.unwrap();

        let r1 = bus.consume_inbound().await.unwrap();
        let r2 = bus.consume_inbound().await.unwrap();

        let channels: Vec<&str> = vec![r1.channel.as_str(), r2.channel.as_str()];
        assert!(channels.contains(&"telegram"));
        assert!(channels.contains(&"discord"));
    }

    #[tokio::test]
    async fn test_full_round_trip() {
        let bus = std::sync::Arc::new(MessageBus::new(10));

        let inbound = InboundMessage::new("telegram", "user_42", "chat_99", "What is 2+2?");
        bus.publish_inbound(inbound).await.unwrap();

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.content, "What is 2+2?");

        let response = OutboundMessage::new(
            received.channel.clone(),
            received.chat_id.clone(),
            "The answer is 4.",
        );
        bus.publish_outbound(response).await.unwrap();

        let outbound = bus.consume_outbound().await.unwrap();
        assert_eq!(outbound.channel, "telegram");
        assert_eq!(outbound.chat_id, "chat_99");
        assert_eq!(outbound.content, "The answer is 4.");
    }

    /// Scenario 1 from the testable-properties list: two follow-ups
    /// published while session "chat:c1" is active merge into one message.
    #[tokio::test]
    async fn test_buffered_follow_up_scenario() {
        let bus = MessageBus::new(10);

        bus.publish_inbound(InboundMessage::new("chat", "u0", "c1", "start"))
            .await
            .unwrap();
        let first = bus.consume_inbound().await.unwrap();
        assert_eq!(first.session_key(), "chat:c1");

        bus.publish_inbound(InboundMessage::new("chat", "alice", "c1", "one"))
            .await
            .unwrap();
        bus.publish_inbound(InboundMessage::new("chat", "bob", "c1", "two"))
            .await
            .unwrap();

        // Not yet visible: still buffered.
        bus.complete_inbound_turn(&first.session_key()).await;

        let merged = bus.consume_inbound().await.unwrap();
        assert_eq!(merged.content, "[alice] one\n\n[bob] two");
        assert_eq!(merged.collected_count(), 2);
        let collected = merged.collected.unwrap();
        assert_eq!(collected[0].sender_id, "alice");
        assert_eq!(collected[1].sender_id, "bob");
    }

    #[tokio::test]
    async fn test_single_buffered_message_has_raw_content() {
        let bus = MessageBus::new(10);

        bus.publish_inbound(InboundMessage::new("chat", "u0", "c1", "start"))
            .await
            .unwrap();
        let first = bus.consume_inbound().await.unwrap();

        bus.publish_inbound(InboundMessage::new("chat", "alice", "c1", "only one"))
            .await
            .unwrap();
        bus.complete_inbound_turn(&first.session_key()).await;

        let merged = bus.consume_inbound().await.unwrap();
        assert_eq!(merged.content, "only one");
        assert_eq!(merged.collected_count(), 1);
    }

    /// Cross-session non-interference: a publish for a different session
    /// while "chat:c1" is active is not buffered.
    #[tokio::test]
    async fn test_cross_session_not_buffered() {
        let bus = MessageBus::new(10);

        bus.publish_inbound(InboundMessage::new("chat", "u0", "c1", "start"))
            .await
            .unwrap();
        let first = bus.consume_inbound().await.unwrap();
        assert_eq!(first.session_key(), "chat:c1");

        bus.publish_inbound(InboundMessage::new("chat", "carol", "c2", "unrelated"))
            .await
            .unwrap();

        // Should be immediately available, not buffered under c1.
        let other = bus.consume_inbound().await.unwrap();
        assert_eq!(other.session_key(), "chat:c2");
        assert_eq!(other.content, "unrelated");
    }

    #[tokio::test]
    async fn test_complete_turn_no_buffer_is_noop() {
        let bus = MessageBus::new(10);
        bus.publish_inbound(InboundMessage::new("chat", "u0", "c1", "start"))
            .await
            .unwrap();
        let first = bus.consume_inbound().await.unwrap();
        // No follow-ups published; completing should not enqueue anything.
        bus.complete_inbound_turn(&first.session_key()).await;

        bus.publish_inbound(InboundMessage::new("chat", "u0", "c2", "next"))
            .await
            .unwrap();
        let next = bus.consume_inbound().await.unwrap();
        assert_eq!(next.session_key(), "chat:c2");
    }

    #[tokio::test]
    async fn test_waiter_resolves_with_ack() {
        let bus = MessageBus::new(10);
        let rx = bus.create_waiter("req_1").await;
        bus.resolve_waiter("req_1", true, None).await;
        let (ok, err) = rx.await.unwrap();
        assert!(ok);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_waiter_superseded() {
        let bus = MessageBus::new(10);
        let old = bus.create_waiter("dup").await;
        let _new = bus.create_waiter("dup").await;

        let (ok, err) = old.await.unwrap();
        assert!(!ok);
        assert_eq!(err.as_deref(), Some("superseded by a newer outbound request"));
    }

    #[tokio::test]
    async fn test_discard_waiter_drops_silently() {
        let bus = MessageBus::new(10);
        let _rx = bus.create_waiter("timeout_me").await;
        bus.discard_waiter("timeout_me").await;
        // resolving after discard is a no-op, must not panic
        bus.resolve_waiter("timeout_me", true, None).await;
    }

    #[tokio::test]
    async fn test_resolve_unknown_waiter_is_noop() {
        let bus = MessageBus::new(10);
        bus.resolve_waiter("never_created", false, Some("x".into()))
            .await;
    }
}
