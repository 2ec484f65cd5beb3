//! In-memory stand-ins for the REST backend and the broker subscriber

use async_trait::async_trait;
use campus_chat::client::stomp::{Command, Frame};
use campus_chat::client::{FrameHandler, MessagingApi, SubscriptionId, TopicSubscriber};
use campus_chat::shared::{ApiError, MessageDto, ProjectDto};
use std::collections::HashMap;
use std::sync::Mutex;

/// REST backend backed by maps
#[derive(Default)]
pub struct MemoryApi {
    pub histories: Mutex<HashMap<i64, Vec<MessageDto>>>,
    pub projects: Mutex<Vec<ProjectDto>>,
    pub posted: Mutex<Vec<(i64, String)>>,
}

impl MemoryApi {
    pub fn with_history(conversation_id: i64, ids: &[i64]) -> Self {
        let api = Self::default();
        api.histories.lock().unwrap().insert(
            conversation_id,
            ids.iter().map(|id| dto(conversation_id, *id)).collect(),
        );
        api
    }
}

#[async_trait]
impl MessagingApi for MemoryApi {
    async fn fetch_messages(&self, conversation_id: i64) -> Result<Vec<MessageDto>, ApiError> {
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_project(&self, conversation_id: i64) -> Result<ProjectDto, ApiError> {
        self.projects
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.project_id == Some(conversation_id))
            .cloned()
            .ok_or(ApiError::Status {
                status: 404,
                message: "Project not found".to_string(),
            })
    }

    async fn fetch_my_projects(&self) -> Result<Vec<ProjectDto>, ApiError> {
        Ok(self.projects.lock().unwrap().clone())
    }

    async fn post_message(
        &self,
        conversation_id: i64,
        content: &str,
    ) -> Result<Option<MessageDto>, ApiError> {
        self.posted
            .lock()
            .unwrap()
            .push((conversation_id, content.to_string()));
        Ok(None)
    }
}

/// Subscriber that records bindings and delivers frames on demand
#[derive(Default)]
pub struct RecordingSubscriber {
    handlers: Mutex<HashMap<String, FrameHandler>>,
}

impl RecordingSubscriber {
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.lock().unwrap().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Push `body` to the handler bound to `topic`; `false` if none is
    pub fn deliver(&self, topic: &str, body: &str) -> bool {
        let handler = self.handlers.lock().unwrap().get(topic).cloned();
        match handler {
            Some(handler) => {
                handler(&message_frame(topic, body));
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl TopicSubscriber for RecordingSubscriber {
    async fn subscribe(&self, topic: &str, handler: FrameHandler) -> Option<SubscriptionId> {
        self.handlers
            .lock()
            .unwrap()
            .insert(topic.to_string(), handler);
        None
    }

    async fn unsubscribe(&self, topic: &str) -> bool {
        self.handlers.lock().unwrap().remove(topic).is_some()
    }
}

pub fn dto(conversation_id: i64, message_id: i64) -> MessageDto {
    MessageDto {
        message_id: Some(message_id),
        project_id: Some(conversation_id),
        sender_id: Some(1),
        sender_name: Some("Ada".to_string()),
        content: Some(format!("message {}", message_id)),
        created_at: Some("2024-03-01T10:00:00".to_string()),
    }
}

/// JSON body of a broker message
pub fn message_body(conversation_id: i64, message_id: i64) -> String {
    serde_json::to_string(&dto(conversation_id, message_id)).unwrap()
}

pub fn message_frame(topic: &str, body: &str) -> Frame {
    Frame::new(Command::Message)
        .header("destination", topic)
        .header("subscription", "sub-0")
        .header("message-id", "m-1")
        .with_body(body)
}
