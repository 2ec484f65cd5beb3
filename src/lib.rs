//! Campus Chat - Realtime Messaging Client
//!
//! Client side of the project chat of a student-collaboration platform. One
//! [`RealtimeClient`](client::RealtimeClient) per application session keeps a
//! STOMP-over-WebSocket connection to the broker, reconnects with
//! exponential backoff, and replays topic subscriptions after every
//! reconnect. A [`ConversationReconciler`](client::ConversationReconciler)
//! merges REST-fetched history with live frames per conversation, without
//! duplicates, and keeps unread counts.
//!
//! # Module Structure
//!
//! - **`shared`** - Types with no I/O
//!   - Messages, conversations, topic naming
//!   - Connection events and error types
//!   - Configuration
//!
//! - **`client`** - Everything that talks to the backend
//!   - Credential supply
//!   - STOMP codec and WebSocket transport
//!   - Connection manager and its driver task
//!   - Subscription registry, REST client, reconciler
//!
//! # Feature Flags
//!
//! - **`cli`** - builds the `campus-chat` binary (tracing-subscriber, dotenv)
//!
//! # Error Handling
//!
//! - `RealtimeError::class()` separates precondition, terminal, transient and
//!   local failures
//! - REST failures are `ApiError`, configuration failures `ConfigError`

/// Shared types and data structures
pub mod shared;

/// Realtime client, REST client and reconciler
pub mod client;
