//! Transport Connection Manager
//!
//! [`ConnectionManager`] is the session state machine. It performs no I/O:
//! callers feed it owner commands, transport events and timer expiries, and
//! drain the [`Action`]s it queues (open a socket, send a frame, arm a timer,
//! notify observers). [`RealtimeClient`] is the tokio task that executes those
//! actions against a real socket.
//!
//! Every socket the manager asks to open is tagged with a session epoch.
//! Teardown bumps the epoch, so late events from a previous socket are
//! ignored.

pub mod backoff;
pub mod driver;

pub use backoff::{NextAttempt, ReconnectPolicy, ReconnectState};
pub use driver::RealtimeClient;

use crate::client::auth::CredentialSupplier;
use crate::client::stomp::{decode_lossy, Command, Decoded, Frame, HeartBeat};
use crate::client::subscriptions::{FrameHandler, SubscriptionId, SubscriptionRegistry};
use crate::shared::config::{AppConfig, ConfigError};
use crate::shared::error::RealtimeError;
use crate::shared::event::{ConnectionEvent, ConnectionState};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Header carrying a machine-readable error code on broker `ERROR` frames
pub const ERROR_CODE_HEADER: &str = "code";

const AUTH_ERROR_CODES: &[&str] = &[
    "401",
    "403",
    "UNAUTHORIZED",
    "AUTH_FAILED",
    "AUTHENTICATION_FAILED",
    "INVALID_TOKEN",
    "TOKEN_EXPIRED",
];

const AUTH_ERROR_MARKERS: &[&str] = &["invalid", "expired", "unauthorized", "authorization"];

/// What the socket reported for the session of some epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// WebSocket handshake completed
    Opened,
    /// One text message (frames or a heart-beat)
    Text(String),
    /// Peer closed the socket
    Closed(Option<String>),
    /// Open failed or the socket errored
    Failed(String),
    /// Nothing received within twice the negotiated incoming interval
    HeartbeatTimeout,
}

/// Work the driver must perform
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open a socket for `epoch`, replacing any current one
    Open { url: String, epoch: u64 },
    Send(Frame),
    /// Close the current socket
    Close,
    /// Arm the reconnect timer; at most one is armed at a time
    ScheduleReconnect(Duration),
    CancelReconnect,
    /// Call [`ConnectionManager::on_settled`] for `epoch` after `delay`
    ScheduleSettle { delay: Duration, epoch: u64 },
    StartHeartbeat { beat: HeartBeat, epoch: u64 },
    Emit(ConnectionEvent),
}

/// Application foreground/background signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Foreground,
    Background,
}

/// How a broker `ERROR` frame is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// The credential was refused; never retried
    Authentication,
    /// Anything else; follows the backoff path
    Transient,
}

/// Classify a broker `ERROR` frame.
///
/// A [`ERROR_CODE_HEADER`] wins when present. Without one the message and
/// body are searched case-insensitively for authentication markers.
pub fn classify_broker_error(frame: &Frame) -> BrokerErrorKind {
    if let Some(code) = frame.get(ERROR_CODE_HEADER) {
        let code = code.trim();
        return if AUTH_ERROR_CODES
            .iter()
            .any(|known| known.eq_ignore_ascii_case(code))
        {
            BrokerErrorKind::Authentication
        } else {
            BrokerErrorKind::Transient
        };
    }

    let text = format!("{} {}", frame.get("message").unwrap_or_default(), frame.body).to_lowercase();
    if AUTH_ERROR_MARKERS.iter().any(|marker| text.contains(marker)) {
        BrokerErrorKind::Authentication
    } else {
        BrokerErrorKind::Transient
    }
}

/// Why the last session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Explicit,
    AuthenticationRejected,
    Precondition,
    Exhausted,
}

/// Sans-IO session state machine
pub struct ConnectionManager {
    credentials: Arc<dyn CredentialSupplier>,
    broker_url: String,
    broker_host: String,
    heart_beat_offer: (u64, u64),
    settle_delay: Duration,
    auto_reconnect: bool,
    policy: ReconnectPolicy,
    rng: StdRng,

    state: ConnectionState,
    reconnect: ReconnectState,
    registry: SubscriptionRegistry,
    epoch: u64,
    pending_token: Option<String>,
    reconnect_pending: bool,
    last_stop: Option<StopReason>,
    actions: Vec<Action>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("broker_url", &self.broker_url)
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .field("reconnect", &self.reconnect)
            .field("reconnect_pending", &self.reconnect_pending)
            .field("registry", &self.registry)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        config: &AppConfig,
        credentials: Arc<dyn CredentialSupplier>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            credentials,
            broker_url: config.broker_url()?,
            broker_host: config.broker_host(),
            heart_beat_offer: (config.heartbeat_outgoing_ms, config.heartbeat_incoming_ms),
            settle_delay: config.settle_delay(),
            auto_reconnect: config.reconnect.auto_reconnect,
            policy: ReconnectPolicy::from(&config.reconnect),
            rng: StdRng::from_entropy(),
            state: ConnectionState::Disconnected,
            reconnect: ReconnectState::new(),
            registry: SubscriptionRegistry::new(),
            epoch: 0,
            pending_token: None,
            reconnect_pending: false,
            last_stop: None,
            actions: Vec::new(),
        })
    }

    /// Deterministic jitter, for tests
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn reconnect_state(&self) -> &ReconnectState {
        &self.reconnect
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    pub fn last_stop(&self) -> Option<StopReason> {
        self.last_stop
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Drain queued actions in the order they must be performed
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// Owner-initiated connect. Re-arms automatic reconnection.
    pub fn connect(&mut self) -> Result<(), RealtimeError> {
        if self.state.is_active() {
            debug!("[REALTIME] Already {}, connect ignored", self.state);
            return Ok(());
        }
        self.reconnect.arm();
        self.reconnect.reset();
        self.cancel_reconnect_timer();
        self.open_session()
    }

    /// Guarded entry used by the reconnect timer and the visibility trigger
    pub fn try_connect(&mut self) -> Result<(), RealtimeError> {
        if !self.reconnect.should_reconnect() {
            debug!("[REALTIME] Reconnect not permitted");
            return Ok(());
        }
        if self.state.is_active() {
            return Ok(());
        }
        self.open_session()
    }

    /// Owner-initiated disconnect; bindings are kept for a later connect
    pub fn disconnect(&mut self) {
        self.reconnect.disarm();
        self.cancel_reconnect_timer();
        self.last_stop = Some(StopReason::Explicit);
        if !self.state.is_active() {
            return;
        }
        info!("[REALTIME] Disconnecting");
        let graceful = self.state == ConnectionState::Connected;
        self.set_state(ConnectionState::Disconnecting);
        self.end_session(graceful);
    }

    /// Disconnect and forget every subscription
    pub fn shutdown(&mut self) {
        self.disconnect();
        self.registry.clear();
    }

    pub fn on_transport_event(&mut self, epoch: u64, event: TransportEvent) {
        if epoch != self.epoch || !self.state.is_active() {
            trace!("[STOMP] Ignoring {:?} from stale session {}", event, epoch);
            return;
        }
        match event {
            TransportEvent::Opened => {
                if self.state != ConnectionState::Connecting {
                    return;
                }
                if let Some(token) = self.pending_token.take() {
                    debug!("[STOMP] Socket open, sending CONNECT");
                    self.send(Frame::connect(
                        &self.broker_host,
                        &token,
                        self.heart_beat_offer,
                    ));
                }
            }
            TransportEvent::Text(text) => self.on_text(epoch, &text),
            TransportEvent::Closed(reason) => {
                info!(
                    "[STOMP] Connection closed: {}",
                    reason.as_deref().unwrap_or("no reason")
                );
                self.on_lost(None);
            }
            TransportEvent::Failed(message) => {
                warn!("[STOMP] Transport failure: {}", message);
                self.on_lost(Some(RealtimeError::transport(message)));
            }
            TransportEvent::HeartbeatTimeout => {
                warn!("[STOMP] Broker heart-beat missed");
                self.on_lost(Some(RealtimeError::transport("heart-beat timeout")));
            }
        }
    }

    /// Settle delay after `CONNECTED` has elapsed
    pub fn on_settled(&mut self, epoch: u64) {
        if epoch == self.epoch && self.state == ConnectionState::Connected {
            info!("[REALTIME] Connected");
            self.emit(ConnectionEvent::Connected);
        }
    }

    pub fn on_reconnect_timer(&mut self) -> Result<(), RealtimeError> {
        if !self.reconnect_pending {
            return Ok(());
        }
        self.reconnect_pending = false;
        self.try_connect()
    }

    pub fn on_visibility_change(&mut self, visibility: Visibility) -> Result<(), RealtimeError> {
        if visibility != Visibility::Foreground
            || self.state != ConnectionState::Disconnected
            || !self.reconnect.should_reconnect()
        {
            return Ok(());
        }
        info!("[REALTIME] Back in foreground, reconnecting now");
        self.cancel_reconnect_timer();
        self.try_connect()
    }

    /// The credential changed; reconnect with the new one, or stop on logout
    pub fn on_credential_rotated(&mut self) -> Result<(), RealtimeError> {
        if self.credentials.bearer_token().is_none() {
            if self.state.is_active() || self.reconnect_pending {
                info!("[REALTIME] Credential cleared, disconnecting");
                self.disconnect();
            }
            return Ok(());
        }

        let resumable = self.state.is_active()
            || self.reconnect_pending
            || matches!(
                self.last_stop,
                Some(StopReason::AuthenticationRejected | StopReason::Precondition)
            );
        if !resumable {
            return Ok(());
        }

        info!("[REALTIME] Credential rotated, reconnecting");
        self.cancel_reconnect_timer();
        if self.state.is_active() {
            let graceful = self.state == ConnectionState::Connected;
            self.set_state(ConnectionState::Disconnecting);
            self.end_session(graceful);
        }
        self.reconnect.arm();
        self.reconnect.reset();
        self.open_session()
    }

    /// Bind `handler` to `topic`; returns the live handle when connected
    pub fn subscribe(&mut self, topic: &str, handler: FrameHandler) -> Option<SubscriptionId> {
        let live = self.state.is_live();
        let (handle, frames) = self.registry.bind(topic, handler, live);
        for frame in frames {
            self.send(frame);
        }
        match &handle {
            Some(id) => debug!("[REALTIME] Subscribed to {} as {}", topic, id),
            None => info!("[REALTIME] Not connected, subscription to {} pending", topic),
        }
        handle
    }

    /// Remove the binding; returns whether one existed
    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        let existed = self.registry.contains(topic);
        if let Some(frame) = self.registry.remove(topic) {
            if self.state.is_live() {
                self.send(frame);
            }
        }
        if existed {
            debug!("[REALTIME] Unsubscribed from {}", topic);
        }
        existed
    }

    /// Fire-and-forget `SEND`; nothing is queued while disconnected
    pub fn publish(&mut self, topic: &str, body: String) -> bool {
        if !self.state.is_live() {
            warn!("[REALTIME] {}: publish to {} dropped", RealtimeError::NotConnected, topic);
            return false;
        }
        self.send(Frame::send_json(topic, body));
        true
    }

    fn open_session(&mut self) -> Result<(), RealtimeError> {
        let token = match self.credentials.bearer_token() {
            None => return Err(self.precondition_failed(RealtimeError::MissingCredential)),
            Some(_) if !self.credentials.is_valid() => {
                return Err(self.precondition_failed(RealtimeError::CredentialExpired))
            }
            Some(token) => token,
        };

        self.epoch += 1;
        self.pending_token = Some(token);
        self.last_stop = None;
        info!(
            "[STOMP] Connecting to {} (session {}, retry {})",
            self.broker_url,
            self.epoch,
            self.reconnect.attempt_count()
        );
        self.set_state(ConnectionState::Connecting);
        self.actions.push(Action::Open {
            url: self.broker_url.clone(),
            epoch: self.epoch,
        });
        Ok(())
    }

    fn precondition_failed(&mut self, error: RealtimeError) -> RealtimeError {
        warn!("[REALTIME] Cannot connect: {}", error);
        self.last_stop = Some(StopReason::Precondition);
        self.emit(ConnectionEvent::Error(error.clone()));
        error
    }

    fn on_text(&mut self, epoch: u64, text: &str) {
        let (decoded, error) = decode_lossy(text);
        for item in decoded {
            if epoch != self.epoch {
                return;
            }
            match item {
                Decoded::Heartbeat => trace!("[STOMP] Heart-beat"),
                Decoded::Frame(frame) => self.on_frame(frame),
            }
        }
        if let Some(e) = error {
            warn!("[STOMP] Dropping undecodable remainder of message: {}", e);
            self.emit(ConnectionEvent::Error(RealtimeError::Frame(e)));
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame.command {
            Command::Connected if self.state == ConnectionState::Connecting => {
                self.on_connected(&frame)
            }
            Command::Message if self.state == ConnectionState::Connected => {
                self.registry.dispatch(&frame);
            }
            Command::Error => self.on_broker_error(&frame),
            Command::Receipt => debug!("[STOMP] Receipt {:?}", frame.get("receipt-id")),
            other => debug!("[STOMP] Unexpected {} in state {}", other, self.state),
        }
    }

    fn on_connected(&mut self, frame: &Frame) {
        self.reconnect.reset();
        self.last_stop = None;
        let epoch = self.epoch;

        for subscribe in self.registry.replay() {
            self.send(subscribe);
        }
        self.set_state(ConnectionState::Connected);

        let beat = HeartBeat::negotiate(self.heart_beat_offer, frame.get("heart-beat"));
        if beat != HeartBeat::default() {
            self.actions.push(Action::StartHeartbeat { beat, epoch });
        }
        self.actions.push(Action::ScheduleSettle {
            delay: self.settle_delay,
            epoch,
        });
    }

    fn on_broker_error(&mut self, frame: &Frame) {
        let message = frame.error_message();
        match classify_broker_error(frame) {
            BrokerErrorKind::Authentication => {
                error!("[STOMP] Broker rejected credential: {}", message);
                self.reconnect.disarm();
                self.cancel_reconnect_timer();
                self.end_session(false);
                self.last_stop = Some(StopReason::AuthenticationRejected);
                self.emit(ConnectionEvent::Error(RealtimeError::authentication_rejected(
                    message,
                )));
            }
            BrokerErrorKind::Transient => {
                warn!("[STOMP] Broker error: {}", message);
                self.end_session(false);
                self.emit(ConnectionEvent::Error(RealtimeError::broker(message)));
                self.schedule_reconnect();
            }
        }
    }

    fn on_lost(&mut self, error: Option<RealtimeError>) {
        self.end_session(false);
        if let Some(error) = error {
            self.emit(ConnectionEvent::Error(error));
        }
        self.schedule_reconnect();
    }

    /// Close the socket, drop live handles and move to Disconnected.
    /// `graceful` sends `DISCONNECT` first.
    fn end_session(&mut self, graceful: bool) {
        if graceful {
            self.send(Frame::disconnect(&format!("disconnect-{}", self.epoch)));
        }
        self.actions.push(Action::Close);
        self.registry.clear_live();
        self.pending_token = None;
        self.epoch += 1;
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected);
    }

    fn schedule_reconnect(&mut self) {
        if !self.auto_reconnect || self.reconnect_pending {
            return;
        }
        match self.reconnect.next_attempt(&self.policy, &mut self.rng) {
            NextAttempt::Disabled => debug!("[REALTIME] Reconnect disabled"),
            NextAttempt::Exhausted { attempts } => {
                error!("[REALTIME] Giving up after {} reconnect attempts", attempts);
                self.last_stop = Some(StopReason::Exhausted);
                self.emit(ConnectionEvent::Error(RealtimeError::ReconnectExhausted {
                    attempts,
                }));
            }
            NextAttempt::After { attempt, delay } => {
                info!(
                    "[REALTIME] Reconnecting in {}ms (attempt {}/{})",
                    delay.as_millis(),
                    attempt,
                    self.policy.max_attempts
                );
                self.reconnect_pending = true;
                self.actions.push(Action::ScheduleReconnect(delay));
                self.emit(ConnectionEvent::Reconnecting {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
        }
    }

    fn cancel_reconnect_timer(&mut self) {
        if self.reconnect_pending {
            self.reconnect_pending = false;
            self.actions.push(Action::CancelReconnect);
        }
    }

    fn send(&mut self, frame: Frame) {
        self.actions.push(Action::Send(frame));
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.emit(ConnectionEvent::StateChanged(state));
        }
    }

    fn emit(&mut self, event: ConnectionEvent) {
        self.actions.push(Action::Emit(event));
    }
}
