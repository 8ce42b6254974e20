//! Handle returned to applications for one registered chain.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::debug;

use super::callback::{CallbackFn, FalconCallback, UserData};
use super::layer::LayerNode;

#[derive(Clone, Debug)]
pub struct MonitorTarget {
    callback: Arc<FalconCallback>,
    top_layer: Weak<LayerNode>,
}

impl MonitorTarget {
    pub(crate) fn new(callback: Arc<FalconCallback>, top_layer: Weak<LayerNode>) -> Self {
        Self {
            callback,
            top_layer,
        }
    }

    pub fn chain(&self) -> &[String] {
        self.callback.chain()
    }

    /// The leaf node, while it is still part of the tree.
    pub fn leaf(&self) -> Option<Arc<LayerNode>> {
        self.top_layer.upgrade()
    }

    /// Install `f` and arm the end-to-end timer. A zero timeout leaves the
    /// timer disarmed.
    pub fn start_monitoring(&self, f: CallbackFn, e2e_timeout: Duration) {
        self.set_callback(f);
        self.start_timer(e2e_timeout);
    }

    /// Disarm the timer and detach the callback. Terminal events arriving
    /// afterwards are held until a callback is installed again.
    pub fn stop_monitoring(&self) {
        self.stop_timer();
        self.remove_callback();
    }

    pub fn start_timer(&self, e2e_timeout: Duration) {
        if e2e_timeout.is_zero() {
            return;
        }
        match self.leaf() {
            Some(leaf) => match leaf.watchdog() {
                Some(watchdog) => watchdog.start_timer(Arc::clone(&self.callback), e2e_timeout),
                None => debug!(layer = %leaf.handle(), "start timer on layer without watchdog"),
            },
            None => debug!("start timer on a target that is no longer monitored"),
        }
    }

    pub fn stop_timer(&self) {
        if let Some(leaf) = self.leaf() {
            if let Some(watchdog) = leaf.watchdog() {
                watchdog.stop_timer();
            }
        }
    }

    /// Returns true if a held terminal event was replayed to `f`.
    pub fn set_callback(&self, f: CallbackFn) -> bool {
        self.callback.reactivate(f, None)
    }

    pub fn remove_callback(&self) {
        self.callback.deactivate();
    }

    pub fn set_data(&self, user_data: Option<UserData>) {
        self.callback.set_data(user_data);
    }

    /// Unwind the chain without killing anything.
    pub fn uninit(&self) {
        if let Some(leaf) = self.leaf() {
            match leaf.watchdog() {
                Some(watchdog) => watchdog.cancel(),
                None => debug!(layer = %leaf.handle(), "uninit on layer without watchdog"),
            }
        }
    }

    /// False once a terminal status has been delivered or is pending.
    pub fn query_alive(&self) -> bool {
        !self.callback.has_run_final()
    }
}
