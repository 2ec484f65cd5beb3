//! Realtime Client Module
//!
//! Everything that talks to the campus backend:
//!
//! - `auth` - credential supply and JWT expiry checks
//! - `stomp` - STOMP 1.2 frame codec
//! - `transport` - WebSocket plumbing
//! - `connection` - session state machine and the task that drives it
//! - `subscriptions` - durable topic bindings, replayed on every reconnect
//! - `api` - REST endpoints for history and the durable send path
//! - `reconciler` - merges REST history with live frames per conversation
//!
//! # Usage
//!
//! ```rust,no_run
//! use campus_chat::client::{ConversationReconciler, HttpApi, RealtimeClient, TokenStore};
//! use campus_chat::shared::AppConfig;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load_layered()?;
//! let tokens = Arc::new(TokenStore::with_token("eyJ..."));
//! let client = RealtimeClient::spawn_with_rotations(&config, tokens.clone(), tokens.rotations())?;
//! client.connect().await?;
//!
//! let api = HttpApi::new(config.clone(), tokens);
//! let mut conversations = ConversationReconciler::new(api, client.clone(), config.topic_prefix.clone());
//! conversations.select(42).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod connection;
pub mod reconciler;
pub mod stomp;
pub mod subscriptions;
pub mod transport;

pub use api::{HttpApi, MessagingApi};
pub use auth::{CredentialSupplier, TokenStore};
pub use connection::{ConnectionManager, RealtimeClient, Visibility};
pub use reconciler::{ConversationReconciler, Ingested, TopicSubscriber, ViewState};
pub use subscriptions::{FrameHandler, SubscriptionId, SubscriptionRegistry};
