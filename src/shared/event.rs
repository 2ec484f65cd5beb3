/**
 * Connection Event System
 *
 * Events broadcast by the realtime client to its observers. They replace
 * ad hoc callbacks: a UI, or a reconciler, subscribes to the stream and reacts.
 */
use crate::shared::error::RealtimeError;

/// Lifecycle of the single broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Subscriptions and publishes take effect immediately only when live
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// A connect attempt is in flight or established
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Event emitted by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The state machine moved
    StateChanged(ConnectionState),
    /// Session is usable; every recorded subscription was replayed first
    Connected,
    /// Session ended, expected or not
    Disconnected,
    /// A retry was scheduled
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        delay_ms: u64,
    },
    /// Something went wrong; see [`RealtimeError::class`]
    Error(RealtimeError),
}

impl ConnectionEvent {
    /// The session will not come back on its own: recovery stopped, or a
    /// fresh credential is needed. The UI should offer a refresh or sign-in.
    pub fn is_terminal_error(&self) -> bool {
        matches!(
            self,
            Self::Error(error) if error.is_terminal() || error.requires_reauthentication()
        )
    }
}
