//! Realtime client task
//!
//! [`RealtimeClient`] is a cheap, cloneable handle. The single driver task
//! behind it owns the [`ConnectionManager`], the socket and every timer;
//! handles talk to it over a command channel and observe it through a
//! `watch` of the [`ConnectionState`] and a `broadcast` of
//! [`ConnectionEvent`]s. Dropping the last handle shuts the task down.

use super::{Action, ConnectionManager, TransportEvent, Visibility};
use crate::client::auth::CredentialSupplier;
use crate::client::stomp::{frame::heartbeat, Frame, HeartBeat};
use crate::client::subscriptions::{FrameHandler, SubscriptionId};
use crate::client::transport::{self, Incoming, WsSink, WsStream};
use crate::shared::config::{AppConfig, ConfigError};
use crate::shared::error::RealtimeError;
use crate::shared::event::{ConnectionEvent, ConnectionState};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde::Serialize;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

enum Request {
    Connect(oneshot::Sender<Result<(), RealtimeError>>),
    Disconnect(oneshot::Sender<()>),
    Subscribe {
        topic: String,
        handler: FrameHandler,
        reply: oneshot::Sender<Option<SubscriptionId>>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        topic: String,
        body: String,
        reply: oneshot::Sender<bool>,
    },
    Visibility(Visibility, oneshot::Sender<Result<(), RealtimeError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the realtime session
#[derive(Clone)]
pub struct RealtimeClient {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl RealtimeClient {
    /// Spawn the driver task on the current tokio runtime
    pub fn spawn(
        config: &AppConfig,
        credentials: Arc<dyn CredentialSupplier>,
    ) -> Result<Self, ConfigError> {
        Self::start(config, credentials, None)
    }

    /// Like [`spawn`](Self::spawn), reacting to credential rotations
    pub fn spawn_with_rotations(
        config: &AppConfig,
        credentials: Arc<dyn CredentialSupplier>,
        rotations: watch::Receiver<u64>,
    ) -> Result<Self, ConfigError> {
        Self::start(config, credentials, Some(rotations))
    }

    fn start(
        config: &AppConfig,
        credentials: Arc<dyn CredentialSupplier>,
        rotations: Option<watch::Receiver<u64>>,
    ) -> Result<Self, ConfigError> {
        let manager = ConnectionManager::new(config, credentials)?;
        let (requests, commands) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let driver = Driver {
            manager,
            commands,
            state_tx,
            events: events.clone(),
            rotations,
            socket: None,
            opening: None,
            reconnect_at: None,
            settle: None,
            heartbeat: None,
        };
        tokio::spawn(driver.run());

        Ok(Self {
            requests,
            state,
            events,
        })
    }

    /// Connect, re-arming automatic reconnection
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        self.call(Request::Connect)
            .await
            .unwrap_or(Err(RealtimeError::ClientClosed))
    }

    /// Disconnect; subscriptions are kept for the next connect
    pub async fn disconnect(&self) {
        self.call(Request::Disconnect).await;
    }

    /// Bind `handler` to `topic`; `None` means recorded but not yet live
    pub async fn subscribe(&self, topic: &str, handler: FrameHandler) -> Option<SubscriptionId> {
        let topic = topic.to_string();
        self.call(|reply| Request::Subscribe {
            topic,
            handler,
            reply,
        })
        .await
        .flatten()
    }

    pub async fn subscribe_fn<F>(&self, topic: &str, handler: F) -> Option<SubscriptionId>
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(handler)).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let topic = topic.to_string();
        self.call(|reply| Request::Unsubscribe { topic, reply })
            .await
            .unwrap_or(false)
    }

    /// Send `payload` as JSON; `false` when not connected
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> bool {
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("[REALTIME] Cannot encode payload for {}: {}", topic, e);
                return false;
            }
        };
        let topic = topic.to_string();
        self.call(|reply| Request::Publish { topic, body, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn set_visibility(&self, visibility: Visibility) -> Result<(), RealtimeError> {
        self.call(|reply| Request::Visibility(visibility, reply))
            .await
            .unwrap_or(Err(RealtimeError::ClientClosed))
    }

    /// Disconnect, forget every subscription and stop the task
    pub async fn shutdown(&self) {
        self.call(Request::Shutdown).await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Wait until the state equals `target`, up to `timeout`
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        let reached = matches!(
            tokio::time::timeout(timeout, state.wait_for(|s| *s == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Option<T> {
        let (reply, response) = oneshot::channel();
        if self.requests.send(request(reply)).await.is_err() {
            debug!("[REALTIME] Client task has stopped");
            return None;
        }
        response.await.ok()
    }
}

struct Socket {
    epoch: u64,
    sink: WsSink,
    stream: WsStream,
}

struct Heartbeat {
    epoch: u64,
    outgoing: Option<Interval>,
    incoming_deadline: Option<Duration>,
    last_seen: Instant,
}

impl Heartbeat {
    fn new(beat: HeartBeat, epoch: u64) -> Self {
        let outgoing = beat.outgoing.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self {
            epoch,
            outgoing,
            incoming_deadline: beat.incoming_deadline(),
            last_seen: Instant::now(),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.incoming_deadline.map(|window| self.last_seen + window)
    }
}

type OpenFuture = BoxFuture<'static, (u64, Result<(WsSink, WsStream), RealtimeError>)>;

struct Driver {
    manager: ConnectionManager,
    commands: mpsc::Receiver<Request>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    rotations: Option<watch::Receiver<u64>>,
    socket: Option<Socket>,
    opening: Option<OpenFuture>,
    reconnect_at: Option<Instant>,
    settle: Option<(Instant, u64)>,
    heartbeat: Option<Heartbeat>,
}

impl Driver {
    async fn run(mut self) {
        debug!("[REALTIME] Client task started for {}", self.manager.broker_url());
        loop {
            let reconnect_at = self.reconnect_at;
            let settle_at = self.settle.map(|(at, _)| at);
            let incoming_deadline = self.heartbeat.as_ref().and_then(Heartbeat::deadline);

            tokio::select! {
                request = self.commands.recv() => {
                    match request {
                        Some(request) => {
                            if !self.handle(request) {
                                self.flush().await;
                                break;
                            }
                        }
                        None => {
                            debug!("[REALTIME] All handles dropped");
                            self.manager.shutdown();
                            self.flush().await;
                            break;
                        }
                    }
                }
                (epoch, result) = poll_opening(&mut self.opening) => {
                    self.opening = None;
                    match result {
                        Ok((sink, stream)) => {
                            self.socket = Some(Socket { epoch, sink, stream });
                            self.manager.on_transport_event(epoch, TransportEvent::Opened);
                        }
                        Err(e) => {
                            self.manager.on_transport_event(epoch, TransportEvent::Failed(e.to_string()));
                        }
                    }
                }
                (epoch, incoming) = next_incoming(&mut self.socket) => {
                    self.on_incoming(epoch, incoming);
                }
                _ = sleep_until_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    // failures were already emitted as events
                    let _ = self.manager.on_reconnect_timer();
                }
                _ = sleep_until_opt(settle_at) => {
                    if let Some((_, epoch)) = self.settle.take() {
                        self.manager.on_settled(epoch);
                    }
                }
                _ = tick_opt(self.heartbeat.as_mut().and_then(|h| h.outgoing.as_mut())) => {
                    if let Some(socket) = self.socket.as_mut() {
                        if let Err(e) = transport::send_text(&mut socket.sink, heartbeat().to_string()).await {
                            let epoch = socket.epoch;
                            self.socket = None;
                            self.manager.on_transport_event(epoch, TransportEvent::Failed(e.to_string()));
                        }
                    }
                }
                _ = sleep_until_opt(incoming_deadline) => {
                    if let Some(beat) = self.heartbeat.take() {
                        self.manager.on_transport_event(beat.epoch, TransportEvent::HeartbeatTimeout);
                    }
                }
                changed = rotation_changed(&mut self.rotations) => {
                    if changed {
                        let _ = self.manager.on_credential_rotated();
                    } else {
                        self.rotations = None;
                    }
                }
            }

            self.flush().await;
        }
        debug!("[REALTIME] Client task stopped");
    }

    /// Returns `false` when the task should stop
    fn handle(&mut self, request: Request) -> bool {
        match request {
            Request::Connect(reply) => {
                let _ = reply.send(self.manager.connect());
            }
            Request::Disconnect(reply) => {
                self.manager.disconnect();
                let _ = reply.send(());
            }
            Request::Subscribe {
                topic,
                handler,
                reply,
            } => {
                let _ = reply.send(self.manager.subscribe(&topic, handler));
            }
            Request::Unsubscribe { topic, reply } => {
                let _ = reply.send(self.manager.unsubscribe(&topic));
            }
            Request::Publish { topic, body, reply } => {
                let _ = reply.send(self.manager.publish(&topic, body));
            }
            Request::Visibility(visibility, reply) => {
                let _ = reply.send(self.manager.on_visibility_change(visibility));
            }
            Request::Shutdown(reply) => {
                info!("[REALTIME] Shutting down");
                self.manager.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn on_incoming(&mut self, epoch: u64, incoming: Incoming) {
        match incoming {
            Incoming::Text(text) => {
                self.touch();
                self.manager.on_transport_event(epoch, TransportEvent::Text(text));
            }
            Incoming::Control => self.touch(),
            Incoming::Malformed(reason) => {
                self.touch();
                warn!("[STOMP] Dropping message: {}", reason);
            }
            Incoming::Closed(reason) => {
                self.socket = None;
                self.manager.on_transport_event(epoch, TransportEvent::Closed(reason));
            }
            Incoming::Failed(message) => {
                self.socket = None;
                self.manager.on_transport_event(epoch, TransportEvent::Failed(message));
            }
        }
    }

    fn touch(&mut self) {
        if let Some(beat) = self.heartbeat.as_mut() {
            beat.last_seen = Instant::now();
        }
    }

    /// Perform queued actions until the manager has nothing left
    async fn flush(&mut self) {
        loop {
            let actions = self.manager.take_actions();
            if actions.is_empty() {
                return;
            }
            let mut failure = None;
            for action in actions {
                if let Some(failed) = self.perform(action).await {
                    failure = Some(failed);
                }
            }
            if let Some((epoch, message)) = failure {
                self.manager.on_transport_event(epoch, TransportEvent::Failed(message));
            }
        }
    }

    /// Returns the epoch and error of a failed send
    async fn perform(&mut self, action: Action) -> Option<(u64, String)> {
        match action {
            Action::Open { url, epoch } => {
                self.drop_socket().await;
                self.opening = Some(Box::pin(async move { (epoch, transport::open(&url).await) }));
            }
            Action::Send(frame) => {
                let Some(socket) = self.socket.as_mut() else {
                    debug!("[STOMP] No socket, {} dropped", frame.command);
                    return None;
                };
                if let Err(e) = transport::send_text(&mut socket.sink, frame.encode()).await {
                    warn!("[STOMP] {}", e);
                    let epoch = socket.epoch;
                    self.socket = None;
                    return Some((epoch, e.to_string()));
                }
            }
            Action::Close => self.drop_socket().await,
            Action::ScheduleReconnect(delay) => self.reconnect_at = Some(Instant::now() + delay),
            Action::CancelReconnect => self.reconnect_at = None,
            Action::ScheduleSettle { delay, epoch } => {
                self.settle = Some((Instant::now() + delay, epoch));
            }
            Action::StartHeartbeat { beat, epoch } => {
                self.heartbeat = Some(Heartbeat::new(beat, epoch));
            }
            Action::Emit(event) => {
                if let ConnectionEvent::StateChanged(state) = &event {
                    self.state_tx.send_replace(*state);
                }
                // no receivers is fine
                let _ = self.events.send(event);
            }
        }
        None
    }

    async fn drop_socket(&mut self) {
        self.opening = None;
        self.settle = None;
        self.heartbeat = None;
        if let Some(mut socket) = self.socket.take() {
            transport::close(&mut socket.sink).await;
        }
    }
}

async fn poll_opening(
    opening: &mut Option<OpenFuture>,
) -> (u64, Result<(WsSink, WsStream), RealtimeError>) {
    match opening {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn next_incoming(socket: &mut Option<Socket>) -> (u64, Incoming) {
    match socket {
        Some(socket) => {
            let item = socket.stream.next().await;
            (socket.epoch, transport::classify(item))
        }
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn tick_opt(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

/// `true` on a change, `false` once the sender is gone
async fn rotation_changed(rotations: &mut Option<watch::Receiver<u64>>) -> bool {
    match rotations {
        Some(receiver) => receiver.changed().await.is_ok(),
        None => pending().await,
    }
}
