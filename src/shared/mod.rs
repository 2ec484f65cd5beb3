//! Shared Module
//!
//! This module contains the types shared by every part of the client: the
//! wire representation of messages and projects, the connection events that
//! observers receive, error types, and configuration.
//!
//! # Overview
//!
//! Nothing in here performs I/O. The `client` module builds the
//! connection manager, the subscription registry and the reconciler on top
//! of these types.

/// Application configuration
pub mod config;

/// Shared error types
pub mod error;

/// Connection lifecycle events
pub mod event;

/// Messages, conversations and topic naming
pub mod messaging;

/// Re-export commonly used types for convenience
pub use config::{AppConfig, AppConfigBuilder, ConfigError, ReconnectConfig};
pub use error::{ApiError, ErrorClass, FrameError, PayloadError, RealtimeError};
pub use event::{ConnectionEvent, ConnectionState};
pub use messaging::{Conversation, Message, MessageDto, ProjectDto};
