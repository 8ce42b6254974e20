//! Exactly-once callback delivery.
//!
//! A [`FalconCallback`] wraps one registration's user function. Liveness
//! events may reach it repeatedly; the first terminal event is delivered at
//! most once and disarms it. A terminal event that arrives while no function
//! is installed is held back and replayed on the next [`FalconCallback::reactivate`].
//!
//! User functions never run on the caller's thread. Deliveries are handed to
//! a [`CallbackPool`] so a slow callback cannot stall tree mutation or
//! notification handling.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{trace, warn};

use super::lock;
use crate::status::FalconStatus;

/// Opaque data handed back to the user function on every delivery.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// User notification function.
pub type CallbackFn = Arc<dyn Fn(&Notification) + Send + Sync>;

/// One delivery to a user callback.
#[derive(Clone)]
pub struct Notification {
    /// The full chain the registration was made for, innermost layer first.
    pub chain: Arc<[String]>,
    /// Index in `chain` of the layer the event concerns.
    pub layer_index: usize,
    pub status: FalconStatus,
    /// Layer-specific status reported by the remote enforcer.
    pub remote_status: u32,
    pub user_data: Option<UserData>,
}

impl Notification {
    pub fn layer(&self) -> Option<&str> {
        self.chain.get(self.layer_index).map(String::as_str)
    }

    /// Human readable one-liner for logs and CLI output.
    pub fn describe(&self) -> String {
        format!(
            "layer: {} falcon: {} remote: {}",
            self.layer().unwrap_or("?"),
            self.status,
            self.remote_status
        )
    }
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notification")
            .field("chain", &self.chain)
            .field("layer_index", &self.layer_index)
            .field("status", &self.status)
            .field("remote_status", &self.remote_status)
            .field("user_data", &self.user_data.is_some())
            .finish()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads running user callbacks.
#[derive(Clone)]
pub struct CallbackPool {
    sender: Sender<Job>,
}

impl CallbackPool {
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        for i in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let spawned = thread::Builder::new()
                .name(format!("falcon-callback-{i}"))
                .spawn(move || worker_loop(receiver));
            if let Err(e) = spawned {
                warn!(error = %e, "failed to spawn callback worker");
            }
        }
        Self { sender }
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if let Err(mpsc::SendError(job)) = self.sender.send(Box::new(job)) {
            // No workers left; run on a detached thread instead.
            thread::spawn(job);
        }
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = match lock(&receiver).recv() {
            Ok(job) => job,
            Err(_) => return,
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("user callback panicked");
        }
    }
}

#[derive(Clone, Copy)]
struct Pending {
    layer_index: usize,
    status: FalconStatus,
    remote_status: u32,
}

struct CallbackState {
    f: Option<CallbackFn>,
    user_data: Option<UserData>,
    run_final: bool,
    deferred: Option<Pending>,
}

pub struct FalconCallback {
    chain: Arc<[String]>,
    repeatable: bool,
    pool: CallbackPool,
    state: Mutex<CallbackState>,
}

impl FalconCallback {
    pub fn new(
        f: Option<CallbackFn>,
        chain: Vec<String>,
        user_data: Option<UserData>,
        repeatable: bool,
        pool: CallbackPool,
    ) -> Self {
        Self {
            chain: chain.into(),
            repeatable,
            pool,
            state: Mutex::new(CallbackState {
                f,
                user_data,
                run_final: false,
                deferred: None,
            }),
        }
    }

    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    /// Deliver an event concerning `layer`.
    pub fn invoke(&self, layer: &str, status: FalconStatus, remote_status: u32) {
        let mut state = lock(&self.state);
        if state.run_final {
            trace!(layer, %status, "callback already delivered its final event");
            return;
        }

        let layer_index = if status == FalconStatus::SignOfLife {
            self.chain.len().saturating_sub(1)
        } else {
            self.chain
                .iter()
                .position(|l| l == layer)
                .unwrap_or(self.chain.len().saturating_sub(1))
        };
        let event = Pending {
            layer_index,
            status,
            remote_status,
        };
        let terminal = !self.repeatable || status.is_terminal();

        match state.f.clone() {
            Some(f) => self.dispatch(f, state.user_data.clone(), event),
            None if terminal => state.deferred = Some(event),
            None => {}
        }

        if terminal {
            state.f = None;
            state.run_final = true;
        }
    }

    /// Install `f`, replacing the user data when given. A terminal event
    /// that arrived while deactivated is replayed once; returns true if so.
    pub fn reactivate(&self, f: CallbackFn, user_data: Option<UserData>) -> bool {
        let mut state = lock(&self.state);
        if user_data.is_some() {
            state.user_data = user_data;
        }
        if let Some(event) = state.deferred.take() {
            self.dispatch(f, state.user_data.clone(), event);
            return true;
        }
        if !state.run_final {
            state.f = Some(f);
        }
        false
    }

    /// Remove the user function. Terminal events are deferred until reactivated.
    pub fn deactivate(&self) {
        lock(&self.state).f = None;
    }

    pub fn set_data(&self, user_data: Option<UserData>) {
        lock(&self.state).user_data = user_data;
    }

    pub fn has_run_final(&self) -> bool {
        lock(&self.state).run_final
    }

    fn dispatch(&self, f: CallbackFn, user_data: Option<UserData>, event: Pending) {
        let notification = Notification {
            chain: Arc::clone(&self.chain),
            layer_index: event.layer_index,
            status: event.status,
            remote_status: event.remote_status,
            user_data,
        };
        self.pool.submit(move || f(&notification));
    }
}

impl fmt::Debug for FalconCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FalconCallback")
            .field("chain", &self.chain)
            .field("repeatable", &self.repeatable)
            .field("run_final", &self.has_run_final())
            .finish()
    }
}

/// Thread-safe multiset of callbacks attached to one layer node.
#[derive(Default)]
pub struct CallbackList {
    callbacks: Mutex<Vec<Arc<FalconCallback>>>,
}

impl CallbackList {
    pub fn add(&self, cb: Arc<FalconCallback>) {
        lock(&self.callbacks).push(cb);
    }

    pub fn len(&self) -> usize {
        lock(&self.callbacks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the list and invoke every drained callback with the same event.
    /// Callbacks added after the drain are not affected.
    pub fn run_all(&self, layer: &str, status: FalconStatus, remote_status: u32) {
        let drained = std::mem::take(&mut *lock(&self.callbacks));
        for cb in drained {
            cb.invoke(layer, status, remote_status);
        }
    }
}
