//! End-to-end timeout escalation for one leaf registration.
//!
//! The watchdog thread waits for its deadline. On expiry it asks the leaf's
//! parent to kill the leaf, retrying the same step on transient failure, and
//! then walks the path recorded at creation releasing every reservation the
//! chain holds. A cancelled or stopped watchdog skips the kill but still
//! releases the path. The release walk runs at most once.
//!
//! Only leaf nodes own a watchdog.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::callback::FalconCallback;
use super::layer::{KillOutcome, LayerNode};
use super::lock;
use crate::status::FalconStatus;

/// Retry budget for the kill step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    pub kill_retry: Duration,
    pub kill_attempts: u32,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            kill_retry: Duration::from_secs(3),
            kill_attempts: 5,
        }
    }
}

#[derive(Default)]
struct DogState {
    deadline: Option<Instant>,
    up_callback: Option<Arc<FalconCallback>>,
    stopping: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<DogState>,
    cond: Condvar,
}

impl Shared {
    fn is_stopping(&self) -> bool {
        lock(&self.state).stopping
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, DogState>,
        timeout: Duration,
    ) -> MutexGuard<'a, DogState> {
        self.cond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }
}

/// How often `await_down` looks for the leaf's erasure.
const DOWN_POLL: Duration = Duration::from_millis(10);

type EscalationStep = (Weak<LayerNode>, String);

pub struct Watchdog {
    target: String,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start a watchdog for `target`. `path` lists `(owner, child)` pairs
    /// from the leaf towards the base.
    pub(crate) fn spawn(
        target: String,
        path: Vec<EscalationStep>,
        settings: WatchdogSettings,
    ) -> Self {
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let thread_target = target.clone();
        let thread = thread::Builder::new()
            .name(format!("falcon-watchdog-{target}"))
            .spawn(move || run(thread_target, thread_shared, path, settings));
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(layer = %target, error = %e, "failed to spawn watchdog thread");
                None
            }
        };
        Self {
            target,
            shared,
            thread,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Arm the deadline `timeout` from now. `cb` receives liveness pets.
    pub fn start_timer(&self, cb: Arc<FalconCallback>, timeout: Duration) {
        let mut state = lock(&self.shared.state);
        state.up_callback = Some(cb);
        // A timeout too large to represent never expires.
        state.deadline = Instant::now().checked_add(timeout);
        self.shared.cond.notify_all();
    }

    /// Disarm the deadline.
    pub fn stop_timer(&self) {
        let mut state = lock(&self.shared.state);
        state.deadline = None;
        self.shared.cond.notify_all();
    }

    /// Relay a sign of life to the armed callback. The deadline is untouched.
    pub fn pet(&self) {
        let cb = lock(&self.shared.state).up_callback.clone();
        if let Some(cb) = cb {
            cb.invoke(&self.target, FalconStatus::SignOfLife, 0);
        }
    }

    /// Stop without escalating. Reservations along the path are released.
    pub fn cancel(&self) {
        let mut state = lock(&self.shared.state);
        state.stopping = true;
        self.shared.cond.notify_all();
        debug!(layer = %self.target, "watchdog cancelled");
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }

    /// Tear the watchdog down without blocking the caller.
    pub fn stop(mut self) {
        self.cancel();
        if let Some(handle) = self.thread.take() {
            let target = self.target.clone();
            let reaper = thread::Builder::new()
                .name(format!("falcon-watchdog-reaper-{target}"))
                .spawn(move || {
                    if handle.join().is_err() {
                        warn!(layer = %target, "watchdog thread panicked");
                    }
                });
            if let Err(e) = reaper {
                warn!(layer = %self.target, error = %e, "failed to spawn watchdog reaper");
            }
        }
    }
}

fn run(target: String, shared: Arc<Shared>, path: Vec<EscalationStep>, settings: WatchdogSettings) {
    let expired = {
        let mut state = lock(&shared.state);
        loop {
            if state.stopping {
                break false;
            }
            match state.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break true;
                    }
                    state = shared.wait_timeout(state, deadline - now);
                }
                None => {
                    state = shared
                        .cond
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    };

    if expired {
        info!(layer = %target, "end-to-end timeout expired, escalating");
        if escalate(&target, &shared, &path, settings) == Some(KillOutcome::Killed) {
            await_down(&target, &shared, &path, settings.kill_retry);
        }
        // The release walk below erases the leaf, so a Down arriving later
        // would find nothing. Settle the terminal status here; it is a no-op
        // for callbacks that already received one.
        if let Some(leaf) = leaf_of(&path) {
            if let Some((_, child)) = path.first() {
                leaf.run_callbacks(child, FalconStatus::E2eTimeout, 0);
            }
        }
    }

    info!(layer = %target, "watchdog releasing registration path");
    for (owner, child) in &path {
        match owner.upgrade() {
            Some(node) => {
                debug!(layer = %child, at = %node.handle(), "cancelling");
                node.cancel_child(child);
            }
            None => debug!(layer = %child, "owner gone, nothing to cancel"),
        }
    }
}

fn leaf_of(path: &[EscalationStep]) -> Option<Arc<LayerNode>> {
    let (owner, child) = path.first()?;
    owner.upgrade()?.child(child)
}

/// Give the enforcer's Down for an acknowledged kill up to `limit` to erase
/// the leaf, so the user sees the kill rather than a timeout.
fn await_down(target: &str, shared: &Shared, path: &[EscalationStep], limit: Duration) {
    let until = Instant::now() + limit;
    let mut state = lock(&shared.state);
    while !state.stopping {
        drop(state);
        if leaf_of(path).is_none() {
            debug!(layer = %target, "leaf erased by down notification");
            return;
        }
        state = lock(&shared.state);
        let now = Instant::now();
        if now >= until {
            debug!(layer = %target, "no down notification after kill");
            return;
        }
        state = shared.wait_timeout(state, (until - now).min(DOWN_POLL));
    }
}

fn escalate(
    target: &str,
    shared: &Shared,
    path: &[EscalationStep],
    settings: WatchdogSettings,
) -> Option<KillOutcome> {
    let (owner, child) = path.first()?;
    let attempts = settings.kill_attempts.max(1);

    for attempt in 1..=attempts {
        if shared.is_stopping() {
            debug!(layer = %target, "watchdog stopped during escalation");
            return None;
        }
        let Some(node) = owner.upgrade() else {
            info!(layer = %target, "parent layer gone, escalation over");
            return None;
        };

        let outcome = node.kill_child(child);
        if outcome.is_final() {
            info!(layer = %target, ?outcome, "escalation finished");
            return Some(outcome);
        }

        if attempt == attempts {
            warn!(layer = %target, attempts, "kill retries exhausted");
            return Some(outcome);
        }

        warn!(layer = %target, attempt, "kill failed, retrying");
        drop(node);
        let retry_at = Instant::now() + settings.kill_retry;
        let mut state = lock(&shared.state);
        while !state.stopping {
            let now = Instant::now();
            if now >= retry_at {
                break;
            }
            state = shared.wait_timeout(state, retry_at - now);
        }
    }
    None
}
