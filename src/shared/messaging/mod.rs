//! Messaging Module
//!
//! This module contains the data structures for project chat:
//!
//! - `Message` / `MessageDto` - A message in a conversation
//! - `Conversation` / `ProjectDto` - A project's conversation and its metadata
//! - topic naming helpers
//!
//! # Usage
//!
//! ```rust
//! use campus_chat::shared::messaging::{topic_for, conversation_id_from_topic};
//!
//! let topic = topic_for("/topic/project/", 42);
//! assert_eq!(topic, "/topic/project/42");
//! assert_eq!(conversation_id_from_topic("/topic/project/", &topic), Some(42));
//! ```

pub mod conversation;
pub mod message;

pub use conversation::{Conversation, ProjectDto, UNTITLED_PROJECT};
pub use message::{Message, MessageDto, SendMessageRequest};

/// Broadcast topic of a conversation
pub fn topic_for(prefix: &str, conversation_id: i64) -> String {
    format!("{}{}", prefix, conversation_id)
}

/// Inverse of [`topic_for`]
pub fn conversation_id_from_topic(prefix: &str, topic: &str) -> Option<i64> {
    topic.strip_prefix(prefix)?.parse().ok()
}
