//! Conversation Reconciler
//!
//! Merges two sources of truth for each project conversation: the history
//! snapshot served by the REST backend and the live frames pushed on the
//! conversation's topic. Message ids are unique within a conversation no
//! matter which source delivered them first.
//!
//! Handlers registered with the subscriber only forward frames into a
//! channel; the owner of the reconciler applies them with [`ingest`] or
//! [`next_update`]. Inside `select!`, take frames with [`recv_frame`] and
//! ingest them in the branch body. A history load is two-phase ([`begin_load`] /
//! [`finish_load`]) and frames that arrive in between are merged after the
//! snapshot is applied.
//!
//! [`ingest`]: ConversationReconciler::ingest
//! [`next_update`]: ConversationReconciler::next_update
//! [`recv_frame`]: ConversationReconciler::recv_frame
//! [`begin_load`]: ConversationReconciler::begin_load
//! [`finish_load`]: ConversationReconciler::finish_load

use crate::client::api::MessagingApi;
use crate::client::connection::RealtimeClient;
use crate::client::stomp::Frame;
use crate::client::subscriptions::{FrameHandler, SubscriptionId};
use crate::shared::error::{ApiError, PayloadError};
use crate::shared::messaging::{
    conversation_id_from_topic, topic_for, Conversation, Message, MessageDto,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Where topic bindings are registered
#[async_trait]
pub trait TopicSubscriber: Send + Sync {
    async fn subscribe(&self, topic: &str, handler: FrameHandler) -> Option<SubscriptionId>;
    async fn unsubscribe(&self, topic: &str) -> bool;
}

#[async_trait]
impl<T: TopicSubscriber + ?Sized> TopicSubscriber for Arc<T> {
    async fn subscribe(&self, topic: &str, handler: FrameHandler) -> Option<SubscriptionId> {
        (**self).subscribe(topic, handler).await
    }

    async fn unsubscribe(&self, topic: &str) -> bool {
        (**self).unsubscribe(topic).await
    }
}

#[async_trait]
impl TopicSubscriber for RealtimeClient {
    async fn subscribe(&self, topic: &str, handler: FrameHandler) -> Option<SubscriptionId> {
        RealtimeClient::subscribe(self, topic, handler).await
    }

    async fn unsubscribe(&self, topic: &str) -> bool {
        RealtimeClient::unsubscribe(self, topic).await
    }
}

/// Per-conversation view state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewState {
    #[default]
    Unselected,
    Loading,
    Ready,
}

/// Result of applying one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    /// Added; `unread` tells whether it counted as unread
    Appended {
        conversation_id: i64,
        message_id: i64,
        unread: bool,
    },
    /// Held until the conversation's history load finishes
    Buffered { conversation_id: i64, message_id: i64 },
    /// Id already present
    Duplicate { conversation_id: i64, message_id: i64 },
    /// Not a chat message
    Dropped,
}

pub struct ConversationReconciler<A, S> {
    api: A,
    subscriber: S,
    topic_prefix: String,
    conversations: Vec<Conversation>,
    views: HashMap<i64, ViewState>,
    selected: Option<i64>,
    subscribed: BTreeSet<String>,
    buffered: HashMap<i64, Vec<Message>>,
    inbox_tx: mpsc::UnboundedSender<Frame>,
    inbox: mpsc::UnboundedReceiver<Frame>,
}

impl<A: MessagingApi, S: TopicSubscriber> ConversationReconciler<A, S> {
    pub fn new(api: A, subscriber: S, topic_prefix: impl Into<String>) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        Self {
            api,
            subscriber,
            topic_prefix: topic_prefix.into(),
            conversations: Vec::new(),
            views: HashMap::new(),
            selected: None,
            subscribed: BTreeSet::new(),
            buffered: HashMap::new(),
            inbox_tx,
            inbox,
        }
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, id: i64) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn selected(&self) -> Option<i64> {
        self.selected
    }

    pub fn view(&self, id: i64) -> ViewState {
        self.views.get(&id).copied().unwrap_or_default()
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    /// Conversations whose title contains `query`, ignoring case
    pub fn filtered(&self, query: &str) -> Vec<&Conversation> {
        self.conversations.iter().filter(|c| c.matches(query)).collect()
    }

    /// One conversation per project the user belongs to. Known
    /// conversations keep their messages and unread counts.
    pub async fn load_conversations(&mut self) -> Result<usize, ApiError> {
        let projects = self.api.fetch_my_projects().await?;
        for project in projects {
            let Some(id) = project.project_id else {
                warn!("[RECONCILE] Project without id skipped");
                continue;
            };
            let title = project.display_title();
            match self.conversation_mut(id) {
                Some(existing) => existing.title = title,
                None => self.conversations.push(Conversation::new(id, title)),
            }
        }
        info!("[RECONCILE] {} conversation(s) loaded", self.conversations.len());
        Ok(self.conversations.len())
    }

    /// Subscribe to every known conversation so background ones keep
    /// counting unread messages
    pub async fn watch_all(&mut self) {
        let ids: Vec<i64> = self.conversations.iter().map(|c| c.id).collect();
        for id in ids {
            self.ensure_subscribed(id).await;
        }
    }

    /// Select a conversation and load its history
    pub async fn select(&mut self, id: i64) -> Result<(), ApiError> {
        self.begin_load(id).await;
        let snapshot = self.api.fetch_messages(id).await;
        self.finish_load(id, snapshot).await
    }

    /// First phase of [`select`](Self::select): selection, placeholder,
    /// subscription, `Loading`
    ///
    /// A previous conversation that is still loading keeps buffering until
    /// its own [`finish_load`](Self::finish_load). The topic binding is
    /// registered again so a handler lost on the subscriber side comes back.
    pub async fn begin_load(&mut self, id: i64) {
        if let Some(previous) = self.selected.replace(id) {
            if previous != id && self.view(previous) != ViewState::Loading {
                self.views.insert(previous, ViewState::Unselected);
            }
        }
        self.ensure_conversation(id).await;
        if let Some(conversation) = self.conversation_mut(id) {
            conversation.mark_read();
        }
        self.bind_topic(id).await;
        self.views.insert(id, ViewState::Loading);
        debug!("[RECONCILE] Loading history of {}", id);
    }

    /// Second phase: apply the snapshot, then merge frames received meanwhile
    pub async fn finish_load(
        &mut self,
        id: i64,
        snapshot: Result<Vec<MessageDto>, ApiError>,
    ) -> Result<(), ApiError> {
        self.drain_inbox().await;
        let buffered = self.buffered.remove(&id).unwrap_or_default();
        let selected = self.selected == Some(id);
        let view = if selected {
            ViewState::Ready
        } else {
            ViewState::Unselected
        };
        self.views.insert(id, view);

        let result = match snapshot {
            Ok(dtos) => {
                let messages: Vec<Message> = dtos
                    .into_iter()
                    .filter_map(|dto| history_message(id, dto))
                    .collect();
                debug!("[RECONCILE] {} message(s) in history of {}", messages.len(), id);
                if let Some(conversation) = self.conversation_mut(id) {
                    conversation.replace_history(messages);
                }
                Ok(())
            }
            Err(e) if e.is_permission_denied() => {
                warn!("[RECONCILE] No permission to read conversation {}: {}", id, e);
                Ok(())
            }
            Err(e) => {
                error!("[RECONCILE] Failed to load conversation {}: {}", id, e);
                Err(e)
            }
        };

        if let Some(conversation) = self.conversation_mut(id) {
            for message in buffered {
                if conversation.append(message) && !selected {
                    conversation.unread_count += 1;
                }
            }
            conversation.refresh_last_message();
        }
        result
    }

    /// Apply one inbound `MESSAGE` frame
    pub async fn ingest(&mut self, frame: &Frame) -> Ingested {
        let message = match parse_frame(&self.topic_prefix, frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("[RECONCILE] Dropping malformed frame: {}", e);
                return Ingested::Dropped;
            }
        };
        let conversation_id = message.conversation_id;
        let message_id = message.id;

        self.ensure_conversation(conversation_id).await;

        if self.view(conversation_id) == ViewState::Loading {
            self.buffered.entry(conversation_id).or_default().push(message);
            return Ingested::Buffered {
                conversation_id,
                message_id,
            };
        }

        let selected = self.selected == Some(conversation_id);
        let Some(conversation) = self.conversation_mut(conversation_id) else {
            return Ingested::Dropped;
        };
        if !conversation.append(message) {
            debug!("[RECONCILE] Duplicate message {} in {}", message_id, conversation_id);
            return Ingested::Duplicate {
                conversation_id,
                message_id,
            };
        }
        if !selected {
            conversation.unread_count += 1;
        }
        Ingested::Appended {
            conversation_id,
            message_id,
            unread: !selected,
        }
    }

    /// Apply every frame already queued by the handlers
    pub async fn drain_inbox(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(frame) = self.inbox.try_recv() {
            self.ingest(&frame).await;
            applied += 1;
        }
        applied
    }

    /// Wait for the next inbound frame and apply it.
    ///
    /// Not cancel-safe: a frame already taken from the inbox is lost if the
    /// future is dropped while a placeholder title is being fetched.
    pub async fn next_update(&mut self) -> Option<Ingested> {
        let frame = self.inbox.recv().await?;
        Some(self.ingest(&frame).await)
    }

    /// Wait for the next inbound frame without applying it.
    ///
    /// Cancel-safe; pass the frame to [`ingest`](Self::ingest).
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.inbox.recv().await
    }

    /// Durable send through the REST backend; the realtime echo is
    /// deduplicated. `Ok(false)` when nothing is selected or `content` is
    /// blank.
    pub async fn send_message(&mut self, content: &str) -> Result<bool, ApiError> {
        let Some(id) = self.selected else {
            return Ok(false);
        };
        let content = content.trim();
        if content.is_empty() {
            return Ok(false);
        }
        let echoed = self.api.post_message(id, content).await?;
        if let Some(message) = echoed.and_then(|dto| history_message(id, dto)) {
            if let Some(conversation) = self.conversation_mut(id) {
                conversation.append(message);
            }
        }
        Ok(true)
    }

    /// Drop every topic binding this reconciler registered
    pub async fn close(&mut self) {
        let topics = std::mem::take(&mut self.subscribed);
        for topic in topics {
            self.subscriber.unsubscribe(&topic).await;
        }
        if let Some(id) = self.selected.take() {
            self.views.insert(id, ViewState::Unselected);
        }
        debug!("[RECONCILE] Closed");
    }

    async fn ensure_conversation(&mut self, id: i64) {
        if self.conversation(id).is_some() {
            return;
        }
        let mut conversation = Conversation::placeholder(id);
        match self.api.fetch_project(id).await {
            Ok(project) => conversation.title = project.display_title(),
            Err(e) => debug!("[RECONCILE] No title for {}: {}", id, e),
        }
        self.conversations.push(conversation);
    }

    async fn ensure_subscribed(&mut self, id: i64) {
        let topic = topic_for(&self.topic_prefix, id);
        if !self.subscribed.contains(&topic) {
            self.bind_topic(id).await;
        }
    }

    /// Register (or replace) the forwarding handler for `id`'s topic
    async fn bind_topic(&mut self, id: i64) {
        let topic = topic_for(&self.topic_prefix, id);
        let inbox = self.inbox_tx.clone();
        let handler: FrameHandler = Arc::new(move |frame: &Frame| {
            // receiver gone means the reconciler was dropped
            let _ = inbox.send(frame.clone());
        });
        self.subscriber.subscribe(&topic, handler).await;
        self.subscribed.insert(topic);
    }

    fn conversation_mut(&mut self, id: i64) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }
}

/// Message from a live frame; `projectId` falls back to the topic suffix
fn parse_frame(prefix: &str, frame: &Frame) -> Result<Message, PayloadError> {
    let mut dto: MessageDto = serde_json::from_str(&frame.body)?;
    if dto.project_id.is_none() {
        dto.project_id = frame
            .destination()
            .and_then(|topic| conversation_id_from_topic(prefix, topic));
    }
    Message::try_from(dto)
}

fn history_message(conversation_id: i64, mut dto: MessageDto) -> Option<Message> {
    dto.project_id.get_or_insert(conversation_id);
    match Message::try_from(dto) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("[RECONCILE] Skipping history entry: {}", e);
            None
        }
    }
}
