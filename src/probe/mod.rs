//! Layer-specific liveness probes.
//!
//! An enforcer is generic over how a layer is observed and killed. A probe is
//! told which targets to watch and reports what it sees through a
//! [`ProbeHandle`]; the enforcer turns those reports into Up and Down
//! notifications for its clients.

pub mod process;
pub mod scripted;

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use anyhow::Result;

use crate::generation::{GenNo, Generation};

pub use process::ProcessProbe;
pub use scripted::{Behavior, ScriptedProbe};

/// Something a probe observed about one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    Up {
        target: String,
    },
    Down {
        target: String,
        status: u32,
        killed: bool,
        would_kill: bool,
    },
}

/// Channel from a probe back into its enforcer. Cheap to clone and safe to
/// use from probe-owned threads.
#[derive(Clone)]
pub struct ProbeHandle {
    sink: Arc<dyn Fn(ProbeEvent) + Send + Sync>,
}

impl ProbeHandle {
    pub fn new(sink: impl Fn(ProbeEvent) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// A handle whose events are collected on a channel.
    pub fn channel() -> (Self, Receiver<ProbeEvent>) {
        let (tx, rx) = mpsc::channel();
        let handle = Self::new(move |event| {
            let _ = tx.send(event);
        });
        (handle, rx)
    }

    pub fn observe_up(&self, target: &str) {
        (self.sink)(ProbeEvent::Up {
            target: target.to_string(),
        });
    }

    pub fn observe_down(&self, target: &str, status: u32, killed: bool, would_kill: bool) {
        (self.sink)(ProbeEvent::Down {
            target: target.to_string(),
            status,
            killed,
            would_kill,
        });
    }
}

impl std::fmt::Debug for ProbeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeHandle").finish_non_exhaustive()
    }
}

/// Contract between the generic enforcer and one kind of layer.
///
/// All methods are called from the enforcer's event loop and must not block;
/// anything slow happens on probe-owned threads that report back through the
/// handle given to [`Probe::init`].
pub trait Probe: Send {
    /// One-time setup. May return this layer's ancestor generation vector
    /// when the probe knows it better than the configuration does.
    fn init(&mut self, handle: ProbeHandle) -> Result<Option<Generation>>;

    fn start_monitoring(&mut self, target: &str);

    fn stop_monitoring(&mut self, target: &str);

    /// Whether `target` is unknown to this layer.
    fn invalid_target(&self, target: &str) -> bool;

    /// Best-effort termination. Must eventually report the target down.
    /// `licensed` is true when some client granted lethal force.
    fn kill(&mut self, target: &str, licensed: bool);

    /// Ground-truth counter for `target`, when the layer tracks one itself.
    fn update_generations(&mut self, _target: &str) -> Option<GenNo> {
        None
    }

    /// Kill license for `target` was granted or withdrawn.
    fn set_licensed(&mut self, _target: &str, _licensed: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_forwards_events() {
        let (handle, events) = ProbeHandle::channel();
        handle.observe_up("appA");
        handle.clone().observe_down("appA", 7, true, false);

        assert_eq!(
            events.try_recv().unwrap(),
            ProbeEvent::Up {
                target: "appA".into()
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            ProbeEvent::Down {
                target: "appA".into(),
                status: 7,
                killed: true,
                would_kill: false,
            }
        );
    }
}
