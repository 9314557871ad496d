#[cfg(test)]
#[path = "transcript_test.rs"]
mod transcript_test;

use super::message::Message;

/// Ordered messages for the active conversation endpoint.
///
/// Mutated only by appends or wholesale replacement. Timestamps are clamped
/// on the way in so the sequence never goes backwards, even when the clock
/// reads earlier than the newest rehydrated history entry.
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn push(&mut self, mut message: Message) {
        if let Some(last) = self.messages.last() {
            message.timestamp_ms = message.timestamp_ms.max(last.timestamp_ms);
        }
        self.messages.push(message);
    }

    /// Swap in a whole new message list (history load).
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages.clear();
        self.messages.reserve(messages.len());
        for message in messages {
            self.push(message);
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}
