//! Client side: the monitoring tree, watchdogs, callback delivery and the
//! coordinator that owns them.

pub mod callback;
pub mod coordinator;
pub mod layer;
pub mod target;
pub mod watchdog;


use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::generation::Generation;
use crate::rpc::RpcError;
use crate::status::SpyStatus;

pub use callback::{CallbackFn, CallbackList, CallbackPool, FalconCallback, Notification, UserData};
pub use coordinator::{ClientCoordinator, CoordinatorOptions};
pub use layer::{KillOutcome, LayerNode, TreeContext};
pub use target::MonitorTarget;
pub use watchdog::{Watchdog, WatchdogSettings};

/// Why a single layer could not be added to the tree.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("cannot reach the enforcer for {layer}: {source}")]
    Connect {
        layer: String,
        #[source]
        source: RpcError,
    },
    #[error("layer {layer} has no enforcer link")]
    NoEnforcer { layer: String },
    #[error("call to {peer} failed: {source}")]
    Rpc {
        peer: String,
        #[source]
        source: RpcError,
    },
    #[error("enforcer rejected {layer}: {status}")]
    Rejected { layer: String, status: SpyStatus },
    #[error("generation {child} for {layer} does not extend {parent}")]
    BadGeneration {
        layer: String,
        parent: Generation,
        child: Generation,
    },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("a monitoring chain needs at least two layers, got {len}")]
    InvalidChain { len: usize },
    #[error("failed to register layer {layer}")]
    Registration {
        layer: String,
        #[source]
        source: RegisterError,
    },
    #[error("client coordinator has stopped")]
    CoordinatorStopped,
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
