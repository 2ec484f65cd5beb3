//! Common test utilities and helpers
//!
//! - an in-process STOMP broker
//! - JWT helpers
//! - in-memory REST and subscriber fakes

#![allow(dead_code)]

pub mod auth_helpers;
pub mod broker;
pub mod fakes;

pub use auth_helpers::*;
pub use broker::*;
pub use fakes::*;

use std::time::Duration;

/// Poll `check` every 10ms until it holds or `timeout` passes
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
