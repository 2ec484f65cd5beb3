//! Conversation Data Structure
//!
//! A conversation is the chat channel of one project.

use serde::{Deserialize, Serialize};

use super::message::Message;

/// Title used when the project's metadata cannot be fetched
pub const UNTITLED_PROJECT: &str = "Untitled Project";

/// Project metadata as returned by `GET /projects/{id}` and
/// `GET /projects/student/me`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDto {
    pub project_id: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub creator_id: Option<i64>,
    pub status: Option<String>,
}

impl ProjectDto {
    /// Title for display, falling back to [`UNTITLED_PROJECT`]
    pub fn display_title(&self) -> String {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(UNTITLED_PROJECT)
            .to_string()
    }
}

/// Represents a project conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    /// Project id, also the topic suffix
    pub id: i64,
    pub title: String,
    /// Messages in arrival order; ids are unique
    pub messages: Vec<Message>,
    /// Content of the last message (for preview)
    pub last_message: Option<String>,
    /// Server timestamp of the last message
    pub last_message_time: Option<String>,
    /// Number of unread messages
    pub unread_count: u32,
}

impl Conversation {
    /// Create an empty conversation
    pub fn new(id: i64, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            messages: Vec::new(),
            last_message: None,
            last_message_time: None,
            unread_count: 0,
        }
    }

    /// Conversation whose title is not known yet
    pub fn placeholder(id: i64) -> Self {
        Self::new(id, UNTITLED_PROJECT)
    }

    /// Whether a message with this id is already present
    pub fn contains(&self, message_id: i64) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }

    /// Append unless the id is already present. Returns whether it was added.
    pub fn append(&mut self, message: Message) -> bool {
        if self.contains(message.id) {
            return false;
        }
        self.last_message = Some(message.content.clone());
        self.last_message_time = message.created_at.clone();
        self.messages.push(message);
        true
    }

    /// Replace the history with an authoritative snapshot.
    ///
    /// Duplicate ids inside the snapshot keep their first occurrence.
    pub fn replace_history(&mut self, snapshot: Vec<Message>) {
        let mut messages: Vec<Message> = Vec::with_capacity(snapshot.len());
        for message in snapshot {
            if !messages.iter().any(|m| m.id == message.id) {
                messages.push(message);
            }
        }
        self.messages = messages;
        self.refresh_last_message();
    }

    /// Recompute the preview fields from the tail of the sequence
    pub fn refresh_last_message(&mut self) {
        match self.messages.last() {
            Some(last) => {
                self.last_message = Some(last.content.clone());
                self.last_message_time = last.created_at.clone();
            }
            None => {
                self.last_message = None;
                self.last_message_time = None;
            }
        }
    }

    pub fn mark_read(&mut self) {
        self.unread_count = 0;
    }

    /// Case-insensitive title match
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        query.is_empty() || self.title.to_lowercase().contains(&query)
    }
}
