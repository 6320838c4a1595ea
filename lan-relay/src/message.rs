//! Local display values. None of this travels on the wire; peers only ever
//! exchange the pre-formatted `"[name]: text"` lines.

use std::{fmt, sync::Mutex};

use chrono::{DateTime, Local};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    sender: String,
    content: String,
    timestamp: DateTime<Local>,
}

impl ChatMessage {
    /// Stamps the message with the current local time.
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::at(sender, content, Local::now())
    }

    pub fn at(sender: impl Into<String>, content: impl Into<String>, timestamp: DateTime<Local>) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
            timestamp,
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// `"[HH:MM:SS] sender: content"`, or without the sender for lines that
    /// arrived already labelled by the relay.
    pub fn format(&self) -> String {
        let time = self.timestamp.format("%H:%M:%S");
        if self.sender.is_empty() {
            format!("[{time}] {}", self.content)
        } else {
            format!("[{time}] {}: {}", self.sender, self.content)
        }
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

/// Append-only message history for one session, shared between the task
/// that receives and the one that reads input.
#[derive(Debug, Default)]
pub struct ChatHistory {
    messages: Mutex<Vec<ChatMessage>>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: ChatMessage) {
        self.lock().push(message);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Every stored message, formatted for display, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lock().iter().map(ChatMessage::format).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ChatMessage>> {
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
