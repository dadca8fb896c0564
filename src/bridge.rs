//! Bounded conduits toward the chat bot.
//!
//! [`BotBridge`] wraps the two channels the supervisor uses to talk to the
//! messaging bot: one for relayed game chat, one for logged server events.
//! The supervisor never blocks on the bot. Sends wait at most five seconds
//! and then the message is dropped and a warning logged. Messages are
//! truncated to the platform limit before sending.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Messages over 2000 characters are cut down to this many bytes.
const TRUNCATE_AT: usize = 1900;
const TRUNCATE_SUFFIX: &str = "...(truncated)";
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// One message bound for the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// In-game speaker, when the message is relayed chat.
    pub name: Option<String>,
    pub text: String,
}

impl ChatMessage {
    pub fn log(text: impl Into<String>) -> Self {
        Self {
            name: None,
            text: text.into(),
        }
    }

    pub fn chat(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            text: text.into(),
        }
    }
}

/// Receiving ends handed to the bot.
pub struct BridgeReceivers {
    pub chat: mpsc::Receiver<ChatMessage>,
    pub log: mpsc::Receiver<ChatMessage>,
}

/// Sending side owned by the supervisor.
#[derive(Clone)]
pub struct BotBridge {
    chat: Option<mpsc::Sender<ChatMessage>>,
    log: Option<mpsc::Sender<ChatMessage>>,
    timeout: Duration,
}

impl BotBridge {
    /// Creates a connected bridge and the receivers for the bot side.
    pub fn connected(capacity: usize) -> (Self, BridgeReceivers) {
        let (chat_tx, chat_rx) = mpsc::channel(capacity);
        let (log_tx, log_rx) = mpsc::channel(capacity);
        (
            Self {
                chat: Some(chat_tx),
                log: Some(log_tx),
                timeout: SEND_TIMEOUT,
            },
            BridgeReceivers {
                chat: chat_rx,
                log: log_rx,
            },
        )
    }

    /// A bridge with no bot attached. Sends become no-ops.
    pub fn disabled() -> Self {
        Self {
            chat: None,
            log: None,
            timeout: SEND_TIMEOUT,
        }
    }

    /// Overrides the send timeout. Test hook.
    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Relays a chat message to the bot, dropping it on timeout.
    pub async fn send_chat(&self, message: ChatMessage) {
        self.send(self.chat.as_ref(), message, "chat").await;
    }

    /// Relays a logged server event to the bot, dropping it on timeout.
    pub async fn send_log(&self, message: ChatMessage) {
        self.send(self.log.as_ref(), message, "log").await;
    }

    async fn send(
        &self,
        pipe: Option<&mpsc::Sender<ChatMessage>>,
        mut message: ChatMessage,
        which: &'static str,
    ) {
        let Some(pipe) = pipe else {
            return;
        };
        clamp(&mut message.text);
        match pipe.send_timeout(message, self.timeout).await {
            Ok(()) => debug!(pipe = which, "sent message to bot"),
            Err(_) => warn!(pipe = which, "discarded message (timeout or closed pipe)"),
        }
    }
}

/// Truncates oversized messages, respecting char boundaries.
fn clamp(text: &mut String) {
    if text.len() < 2000 {
        return;
    }
    let mut cut = TRUNCATE_AT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(TRUNCATE_SUFFIX);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_within_capacity() {
        let (bridge, mut rx) = BotBridge::connected(4);
        bridge.send_chat(ChatMessage::chat("Alice", "hello")).await;
        let got = rx.chat.recv().await.unwrap();
        assert_eq!(got.name.as_deref(), Some("Alice"));
        assert_eq!(got.text, "hello");
    }

    #[tokio::test]
    async fn drops_when_pipe_is_stalled() {
        let (bridge, rx) = BotBridge::connected(1);
        let bridge = bridge.with_timeout(Duration::from_millis(20));

        // Fill the only slot, then send into the stalled pipe.
        bridge.send_log(ChatMessage::log("first")).await;
        bridge.send_log(ChatMessage::log("second")).await;

        drop(bridge);
        let mut log = rx.log;
        assert_eq!(log.recv().await.unwrap().text, "first");
        assert!(log.recv().await.is_none());
    }

    #[tokio::test]
    async fn truncates_oversized_messages() {
        let (bridge, mut rx) = BotBridge::connected(1);
        bridge.send_log(ChatMessage::log("x".repeat(4000))).await;
        let got = rx.log.recv().await.unwrap();
        assert_eq!(got.text.len(), TRUNCATE_AT + TRUNCATE_SUFFIX.len());
        assert!(got.text.ends_with(TRUNCATE_SUFFIX));
    }

    #[tokio::test]
    async fn short_messages_pass_unchanged() {
        let (bridge, mut rx) = BotBridge::connected(1);
        bridge.send_log(ChatMessage::log("short")).await;
        assert_eq!(rx.log.recv().await.unwrap().text, "short");
    }

    #[tokio::test]
    async fn disabled_bridge_is_a_no_op() {
        let bridge = BotBridge::disabled();
        bridge.send_chat(ChatMessage::log("nobody listens")).await;
    }
}
