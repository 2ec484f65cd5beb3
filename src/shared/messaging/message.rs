//! Chat Message Data Structure
//!
//! Represents a message in a project conversation, both as it travels on the
//! wire (`MessageDto`) and once accepted by the client (`Message`).

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shared::error::PayloadError;

/// Message as serialized by the backend, over REST and in broker frames.
///
/// Every field is optional on the wire; [`Message::try_from`] decides which
/// ones are required.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub message_id: Option<i64>,
    pub project_id: Option<i64>,
    pub sender_id: Option<i64>,
    pub sender_name: Option<String>,
    pub content: Option<String>,
    pub created_at: Option<String>,
}

/// A chat message accepted into a conversation. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned message id, the deduplication key
    pub id: i64,
    /// Conversation (project) this message belongs to
    pub conversation_id: i64,
    pub sender_id: Option<i64>,
    pub sender_name: Option<String>,
    pub content: String,
    /// Server timestamp as sent by the backend
    pub created_at: Option<String>,
}

impl Message {
    /// Parse the JSON body of an inbound broker frame
    pub fn from_json(body: &str) -> Result<Self, PayloadError> {
        let dto: MessageDto = serde_json::from_str(body)?;
        Self::try_from(dto)
    }

    /// Sender name for display
    pub fn sender_display_name(&self) -> &str {
        self.sender_name.as_deref().unwrap_or("Unknown")
    }

    /// Server timestamp, accepting RFC 3339 and the zone-less form the
    /// backend produces (`2024-03-01T10:15:30.123`), read as UTC
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        let raw = self.created_at.as_deref()?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Get a preview of the message (first N characters)
    pub fn preview(&self, max_len: usize) -> String {
        if self.content.chars().count() <= max_len {
            self.content.clone()
        } else {
            let mut preview: String = self
                .content
                .chars()
                .take(max_len.saturating_sub(3))
                .collect();
            preview.push_str("...");
            preview
        }
    }
}

impl TryFrom<MessageDto> for Message {
    type Error = PayloadError;

    fn try_from(dto: MessageDto) -> Result<Self, Self::Error> {
        Ok(Self {
            id: dto.message_id.ok_or(PayloadError::MissingField("messageId"))?,
            conversation_id: dto.project_id.ok_or(PayloadError::MissingField("projectId"))?,
            sender_id: dto.sender_id,
            sender_name: dto.sender_name,
            content: dto.content.unwrap_or_default(),
            created_at: dto.created_at,
        })
    }
}

impl From<&Message> for MessageDto {
    fn from(message: &Message) -> Self {
        Self {
            message_id: Some(message.id),
            project_id: Some(message.conversation_id),
            sender_id: message.sender_id,
            sender_name: message.sender_name.clone(),
            content: Some(message.content.clone()),
            created_at: message.created_at.clone(),
        }
    }
}

/// Body of `POST /messages/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendMessageRequest {
    pub content: String,
}
