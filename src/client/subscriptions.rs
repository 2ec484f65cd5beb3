//! Subscription Registry
//!
//! Durable topic bindings. Each topic has at most one handler; while a
//! session is live the binding also carries the id of its broker-side
//! subscription. Bindings outlive the session so they can be replayed on the
//! next `CONNECTED`.
//!
//! `MESSAGE` frames are routed by their `subscription` header, never by
//! destination, so a frame addressed to a replaced or torn-down id reaches no
//! handler.

use crate::client::stomp::Frame;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Callback invoked for every `MESSAGE` frame of a topic
pub type FrameHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Broker-side subscription id (`sub-N`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Binding {
    handler: FrameHandler,
    live_handle: Option<SubscriptionId>,
}

/// Topic → handler bindings with their live handles
#[derive(Default)]
pub struct SubscriptionRegistry {
    bindings: BTreeMap<String, Binding>,
    by_handle: HashMap<SubscriptionId, String>,
    next_id: u64,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.bindings
                    .iter()
                    .map(|(topic, binding)| (topic, &binding.live_handle)),
            )
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `handler` for `topic`, replacing any previous one.
    ///
    /// With `live` set, returns the new handle together with the frames that
    /// put it into effect (`UNSUBSCRIBE` of the old handle first, then
    /// `SUBSCRIBE`). Otherwise the binding waits for the next replay.
    pub fn bind(
        &mut self,
        topic: &str,
        handler: FrameHandler,
        live: bool,
    ) -> (Option<SubscriptionId>, Vec<Frame>) {
        let mut frames = Vec::new();
        let previous = self.bindings.remove(topic);
        if let Some(old) = previous.and_then(|binding| binding.live_handle) {
            self.by_handle.remove(&old);
            frames.push(Frame::unsubscribe(old.as_str()));
        }

        let live_handle = if live {
            let id = self.allocate(topic);
            frames.push(Frame::subscribe(id.as_str(), topic));
            Some(id)
        } else {
            debug!("[REALTIME] Recorded pending subscription to {}", topic);
            None
        };

        self.bindings.insert(
            topic.to_string(),
            Binding {
                handler,
                live_handle: live_handle.clone(),
            },
        );
        (live_handle, frames)
    }

    /// Drop the binding; returns `UNSUBSCRIBE` when it had a live handle
    pub fn remove(&mut self, topic: &str) -> Option<Frame> {
        let binding = self.bindings.remove(topic)?;
        let handle = binding.live_handle?;
        self.by_handle.remove(&handle);
        Some(Frame::unsubscribe(handle.as_str()))
    }

    /// Give every binding a fresh handle; returns the `SUBSCRIBE` frames
    pub fn replay(&mut self) -> Vec<Frame> {
        self.by_handle.clear();
        let topics: Vec<String> = self.bindings.keys().cloned().collect();
        let mut frames = Vec::with_capacity(topics.len());
        for topic in topics {
            let id = self.allocate(&topic);
            frames.push(Frame::subscribe(id.as_str(), &topic));
            if let Some(binding) = self.bindings.get_mut(&topic) {
                binding.live_handle = Some(id);
            }
        }
        debug!("[REALTIME] Replayed {} subscription(s)", frames.len());
        frames
    }

    /// Session ended: forget live handles, keep bindings
    pub fn clear_live(&mut self) {
        self.by_handle.clear();
        for binding in self.bindings.values_mut() {
            binding.live_handle = None;
        }
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.by_handle.clear();
        self.bindings.clear();
    }

    /// Deliver a `MESSAGE` frame to the handler owning its subscription id
    pub fn dispatch(&self, frame: &Frame) -> bool {
        let Some(id) = frame.subscription() else {
            trace!("[REALTIME] MESSAGE without subscription header dropped");
            return false;
        };
        let handler = self
            .by_handle
            .get(&SubscriptionId(id.to_string()))
            .and_then(|topic| self.bindings.get(topic))
            .map(|binding| binding.handler.clone());
        match handler {
            Some(handler) => {
                handler(frame);
                true
            }
            None => {
                trace!("[REALTIME] MESSAGE for stale subscription {} dropped", id);
                false
            }
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.bindings.contains_key(topic)
    }

    pub fn live_handle(&self, topic: &str) -> Option<&SubscriptionId> {
        self.bindings.get(topic)?.live_handle.as_ref()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn allocate(&mut self, topic: &str) -> SubscriptionId {
        let id = SubscriptionId(format!("sub-{}", self.next_id));
        self.next_id += 1;
        self.by_handle.insert(id.clone(), topic.to_string());
        id
    }
}
