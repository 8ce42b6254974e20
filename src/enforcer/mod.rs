//! Enforcer: the per-layer server that multiplexes many clients over many
//! monitored targets.
//!
//! [`core::EnforcerCore`] holds all bookkeeping and is driven one event at a
//! time; [`server`] runs it on a single event-loop thread behind the RPC
//! listener.

pub mod core;
pub mod generation_log;
pub mod server;
pub mod timers;


use std::time::Duration;

use thiserror::Error;

pub use self::core::{CallKind, EnforcerCore, OutboundCall};
pub use generation_log::{GenerationLog, GenerationLogError};
pub use server::{EnforcerServer, ShutdownTrigger};
pub use timers::TimerQueue;

/// Any error escaping the event loop stops the enforcer.
#[derive(Debug, Error)]
pub enum EnforcerError {
    #[error(transparent)]
    GenerationLog(#[from] GenerationLogError),
}

/// Client bookkeeping knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnforcerSettings {
    /// Pause between successful client heartbeats.
    pub heartbeat_interval: Duration,
    /// Consecutive failed heartbeats tolerated before a client is dropped.
    pub heartbeat_retries: u32,
    /// Attempts per Down notification.
    pub down_retries: u32,
}

impl Default for EnforcerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(90),
            heartbeat_retries: 5,
            down_retries: 3,
        }
    }
}
