//! STOMP over WebSocket
//!
//! The broker speaks STOMP 1.2 in text WebSocket messages. This module only
//! knows the wire format; session semantics live in `client::connection`.

pub mod frame;
pub mod heartbeat;

pub use frame::{decode_all, decode_lossy, Command, Decoded, Frame};
pub use heartbeat::HeartBeat;
