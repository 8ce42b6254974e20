//! Probe with canned per-target behaviour, for demos and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Probe, ProbeHandle};
use crate::generation::Generation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    /// Reports up on every poll.
    Alive,
    /// Reports down on the first poll.
    Dead,
    /// Never reports anything.
    Stuck,
}

struct Monitor {
    stop: Arc<AtomicBool>,
    reported: Arc<AtomicBool>,
    licensed: Arc<AtomicBool>,
}

impl Monitor {
    fn halt(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub struct ScriptedProbe {
    targets: HashMap<String, Behavior>,
    poll_interval: Duration,
    handle: Option<ProbeHandle>,
    monitors: HashMap<String, Monitor>,
    licensed: HashMap<String, bool>,
}

impl ScriptedProbe {
    pub fn new(targets: HashMap<String, Behavior>, poll_interval: Duration) -> Self {
        Self {
            targets,
            poll_interval,
            handle: None,
            monitors: HashMap::new(),
            licensed: HashMap::new(),
        }
    }

    /// The stock `alive`, `dead` and `stuck` targets.
    pub fn standard(poll_interval: Duration) -> Self {
        let targets = [
            ("alive", Behavior::Alive),
            ("dead", Behavior::Dead),
            ("stuck", Behavior::Stuck),
        ]
        .into_iter()
        .map(|(name, behavior)| (name.to_string(), behavior))
        .collect();
        Self::new(targets, poll_interval)
    }

    pub fn is_monitoring(&self, target: &str) -> bool {
        self.monitors.contains_key(target)
    }
}

fn poll(
    target: String,
    behavior: Behavior,
    interval: Duration,
    handle: ProbeHandle,
    stop: Arc<AtomicBool>,
    reported: Arc<AtomicBool>,
    licensed: Arc<AtomicBool>,
) {
    loop {
        thread::sleep(interval);
        if stop.load(Ordering::Relaxed) {
            return;
        }
        match behavior {
            Behavior::Alive => handle.observe_up(&target),
            Behavior::Dead => {
                if !reported.swap(true, Ordering::SeqCst) {
                    handle.observe_down(&target, 0, licensed.load(Ordering::SeqCst), true);
                }
                return;
            }
            Behavior::Stuck => return,
        }
    }
}

impl Probe for ScriptedProbe {
    fn init(&mut self, handle: ProbeHandle) -> Result<Option<Generation>> {
        info!(targets = self.targets.len(), "scripted probe ready");
        self.handle = Some(handle);
        Ok(None)
    }

    fn start_monitoring(&mut self, target: &str) {
        let (Some(handle), Some(&behavior)) = (self.handle.clone(), self.targets.get(target)) else {
            warn!(target, "cannot monitor unknown or uninitialised target");
            return;
        };
        if let Some(previous) = self.monitors.remove(target) {
            previous.halt();
        }

        let monitor = Monitor {
            stop: Arc::new(AtomicBool::new(false)),
            reported: Arc::new(AtomicBool::new(false)),
            licensed: Arc::new(AtomicBool::new(
                self.licensed.get(target).copied().unwrap_or(false),
            )),
        };
        let name = target.to_string();
        let interval = self.poll_interval;
        let stop = Arc::clone(&monitor.stop);
        let reported = Arc::clone(&monitor.reported);
        let licensed = Arc::clone(&monitor.licensed);
        let spawned = thread::Builder::new()
            .name(format!("probe-{target}"))
            .spawn(move || poll(name, behavior, interval, handle, stop, reported, licensed));
        if let Err(e) = spawned {
            warn!(target, error = %e, "failed to start poller");
            return;
        }

        debug!(target, ?behavior, "start monitoring");
        self.monitors.insert(target.to_string(), monitor);
    }

    fn stop_monitoring(&mut self, target: &str) {
        if let Some(monitor) = self.monitors.remove(target) {
            debug!(target, "stop monitoring");
            monitor.halt();
        }
    }

    fn invalid_target(&self, target: &str) -> bool {
        !self.targets.contains_key(target)
    }

    fn kill(&mut self, target: &str, licensed: bool) {
        let (Some(handle), Some(monitor)) = (self.handle.as_ref(), self.monitors.get(target)) else {
            debug!(target, "kill for unmonitored target");
            return;
        };
        info!(target, licensed, "killing");
        if !monitor.reported.swap(true, Ordering::SeqCst) {
            monitor.halt();
            handle.observe_down(target, 0, true, true);
        }
    }

    fn set_licensed(&mut self, target: &str, licensed: bool) {
        self.licensed.insert(target.to_string(), licensed);
        if let Some(monitor) = self.monitors.get(target) {
            monitor.licensed.store(licensed, Ordering::SeqCst);
        }
    }
}

impl Drop for ScriptedProbe {
    fn drop(&mut self) {
        for monitor in self.monitors.values() {
            monitor.halt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeEvent;

    const POLL: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(2);

    fn started(target: &str) -> (ScriptedProbe, std::sync::mpsc::Receiver<ProbeEvent>) {
        let mut probe = ScriptedProbe::standard(POLL);
        let (handle, events) = ProbeHandle::channel();
        probe.init(handle).unwrap();
        probe.start_monitoring(target);
        (probe, events)
    }

    #[test]
    fn test_alive_reports_up_repeatedly() {
        let (_probe, events) = started("alive");
        for _ in 0..3 {
            assert_eq!(
                events.recv_timeout(WAIT).unwrap(),
                ProbeEvent::Up {
                    target: "alive".into()
                }
            );
        }
    }

    #[test]
    fn test_dead_reports_down_once() {
        let (_probe, events) = started("dead");
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            ProbeEvent::Down {
                target: "dead".into(),
                status: 0,
                killed: false,
                would_kill: true,
            }
        );
        assert!(events.recv_timeout(POLL * 5).is_err());
    }

    #[test]
    fn test_dead_with_license_reports_killed() {
        let mut probe = ScriptedProbe::standard(POLL);
        let (handle, events) = ProbeHandle::channel();
        probe.init(handle).unwrap();
        probe.set_licensed("dead", true);
        probe.start_monitoring("dead");

        match events.recv_timeout(WAIT).unwrap() {
            ProbeEvent::Down { killed, .. } => assert!(killed),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_stuck_stays_silent_until_killed() {
        let (mut probe, events) = started("stuck");
        assert!(events.recv_timeout(POLL * 5).is_err());

        probe.kill("stuck", true);
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            ProbeEvent::Down {
                target: "stuck".into(),
                status: 0,
                killed: true,
                would_kill: true,
            }
        );
    }

    #[test]
    fn test_kill_after_stop_is_ignored() {
        let (mut probe, events) = started("stuck");
        probe.stop_monitoring("stuck");
        probe.kill("stuck", true);
        assert!(!probe.is_monitoring("stuck"));
        assert!(events.recv_timeout(POLL * 5).is_err());
    }

    #[test]
    fn test_unknown_targets_are_invalid() {
        let probe = ScriptedProbe::standard(POLL);
        assert!(probe.invalid_target("nope"));
        assert!(!probe.invalid_target("alive"));
    }
}
