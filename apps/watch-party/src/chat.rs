use std::fmt;

use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatSender {
    Me,
    Peer(String),
}

impl fmt::Display for ChatSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatSender::Me => f.write_str("me"),
            ChatSender::Peer(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub id: Uuid,
    pub text: String,
    pub sender: ChatSender,
    pub timestamp: OffsetDateTime,
}

/// Append-only chat history for one side of the call.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    entries: Vec<ChatEntry>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sender: ChatSender, text: impl Into<String>) -> &ChatEntry {
        let index = self.entries.len();
        self.entries.push(ChatEntry {
            id: Uuid::new_v4(),
            text: text.into(),
            sender,
            timestamp: OffsetDateTime::now_utc(),
        });
        &self.entries[index]
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&ChatEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_keep_insertion_order_and_unique_ids() {
        let mut log = ChatLog::new();
        let first = log.push(ChatSender::Me, "hi").id;
        let second = log.push(ChatSender::Peer("bob".into()), "hello").id;
        assert_ne!(first, second);
        let texts: Vec<_> = log.entries().iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["hi", "hello"]);
        assert_eq!(log.last().map(|e| e.sender.to_string()), Some("bob".into()));
    }
}
