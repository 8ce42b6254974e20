//! Probe for local OS processes. Targets are decimal PIDs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use super::{Probe, ProbeHandle};
use crate::generation::Generation;

/// Check whether a process exists.
///
/// The null signal distinguishes a live process we may not signal (`EPERM`)
/// from one that is gone (`ESRCH`).
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => false,
    }
}

fn parse_pid(target: &str) -> Option<i32> {
    target.parse::<i32>().ok().filter(|pid| *pid > 0)
}

struct Monitor {
    pid: i32,
    stop: Arc<AtomicBool>,
    reported: Arc<AtomicBool>,
}

pub struct ProcessProbe {
    poll_interval: Duration,
    confirm_wait: Duration,
    handle: Option<ProbeHandle>,
    monitors: HashMap<String, Monitor>,
}

impl ProcessProbe {
    pub fn new(poll_interval: Duration, confirm_wait: Duration) -> Self {
        Self {
            poll_interval,
            confirm_wait,
            handle: None,
            monitors: HashMap::new(),
        }
    }
}

fn watch(
    target: String,
    pid: i32,
    interval: Duration,
    handle: ProbeHandle,
    stop: Arc<AtomicBool>,
    reported: Arc<AtomicBool>,
) {
    loop {
        thread::sleep(interval);
        if stop.load(Ordering::Relaxed) {
            return;
        }
        if is_process_alive(pid) {
            handle.observe_up(&target);
            continue;
        }
        if !reported.swap(true, Ordering::SeqCst) {
            info!(target = %target, pid, "process exited");
            handle.observe_down(&target, 0, false, false);
        }
        return;
    }
}

/// Give up confirming a SIGKILL after this long. A zombie stays visible to
/// the null signal until its parent reaps it.
const CONFIRM_LIMIT: Duration = Duration::from_secs(10);

/// Poll until `pid` is gone, then report it killed.
fn confirm_death(target: String, pid: i32, wait: Duration, handle: ProbeHandle) {
    let until = Instant::now() + CONFIRM_LIMIT;
    while is_process_alive(pid) {
        if Instant::now() >= until {
            warn!(target = %target, pid, "process still visible after SIGKILL");
            break;
        }
        thread::sleep(wait);
    }
    info!(target = %target, pid, "kill confirmed");
    handle.observe_down(&target, 0, true, true);
}

/// Report the outcome of sending SIGKILL to `pid`.
fn settle_kill(
    target: &str,
    pid: i32,
    sent: nix::Result<()>,
    wait: Duration,
    handle: &ProbeHandle,
) {
    match sent {
        Ok(()) => {
            let name = target.to_string();
            let confirm = handle.clone();
            let spawned = thread::Builder::new()
                .name(format!("probe-kill-{pid}"))
                .spawn(move || confirm_death(name, pid, wait, confirm));
            if let Err(e) = spawned {
                warn!(target, error = %e, "failed to start kill confirmation");
                handle.observe_down(target, 0, true, true);
            }
        }
        Err(Errno::ESRCH) => handle.observe_down(target, 0, false, false),
        Err(e) => {
            warn!(target, pid, error = %e, "SIGKILL failed");
            handle.observe_down(target, 0, false, true);
        }
    }
}

impl Probe for ProcessProbe {
    fn init(&mut self, handle: ProbeHandle) -> Result<Option<Generation>> {
        self.handle = Some(handle);
        Ok(None)
    }

    fn start_monitoring(&mut self, target: &str) {
        let (Some(handle), Some(pid)) = (self.handle.clone(), parse_pid(target)) else {
            warn!(target, "cannot monitor target");
            return;
        };
        if let Some(previous) = self.monitors.remove(target) {
            previous.stop.store(true, Ordering::Relaxed);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let reported = Arc::new(AtomicBool::new(false));
        let name = target.to_string();
        let interval = self.poll_interval;
        let (thread_stop, thread_reported) = (Arc::clone(&stop), Arc::clone(&reported));
        let spawned = thread::Builder::new()
            .name(format!("probe-{pid}"))
            .spawn(move || watch(name, pid, interval, handle, thread_stop, thread_reported));
        if let Err(e) = spawned {
            warn!(target, error = %e, "failed to start process watcher");
            return;
        }

        debug!(target, pid, "start monitoring");
        self.monitors.insert(
            target.to_string(),
            Monitor {
                pid,
                stop,
                reported,
            },
        );
    }

    fn stop_monitoring(&mut self, target: &str) {
        if let Some(monitor) = self.monitors.remove(target) {
            debug!(target, "stop monitoring");
            monitor.stop.store(true, Ordering::Relaxed);
        }
    }

    fn invalid_target(&self, target: &str) -> bool {
        !parse_pid(target).is_some_and(is_process_alive)
    }

    fn kill(&mut self, target: &str, licensed: bool) {
        let (Some(handle), Some(monitor)) = (self.handle.clone(), self.monitors.get(target)) else {
            debug!(target, "kill for unmonitored target");
            return;
        };
        if monitor.reported.swap(true, Ordering::SeqCst) {
            return;
        }
        monitor.stop.store(true, Ordering::Relaxed);
        let pid = monitor.pid;

        if !is_process_alive(pid) {
            handle.observe_down(target, 0, false, false);
            return;
        }
        if !licensed {
            info!(target, pid, "no kill license, reporting would-kill");
            handle.observe_down(target, 0, false, true);
            return;
        }

        info!(target, pid, "sending SIGKILL");
        let sent = kill(Pid::from_raw(pid), Signal::SIGKILL);
        settle_kill(target, pid, sent, self.confirm_wait, &handle);
    }
}

impl Drop for ProcessProbe {
    fn drop(&mut self) {
        for monitor in self.monitors.values() {
            monitor.stop.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeEvent;
    use std::process::{Command, Stdio};

    const POLL: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(5);

    fn probe() -> (ProcessProbe, std::sync::mpsc::Receiver<ProbeEvent>) {
        let mut probe = ProcessProbe::new(POLL, Duration::from_millis(5));
        let (handle, events) = ProbeHandle::channel();
        probe.init(handle).unwrap();
        (probe, events)
    }

    fn down_event(events: &std::sync::mpsc::Receiver<ProbeEvent>) -> (bool, bool) {
        loop {
            match events.recv_timeout(WAIT).unwrap() {
                ProbeEvent::Down {
                    killed, would_kill, ..
                } => return (killed, would_kill),
                ProbeEvent::Up { .. } => continue,
            }
        }
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id() as i32));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(-1));
    }

    #[test]
    fn test_targets_must_be_live_pids() {
        let (probe, _events) = probe();
        assert!(probe.invalid_target("not-a-pid"));
        assert!(probe.invalid_target("0"));
        assert!(!probe.invalid_target(&std::process::id().to_string()));
    }

    #[test]
    fn test_licensed_kill_terminates_process() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let target = child.id().to_string();
        let (mut probe, events) = probe();
        probe.start_monitoring(&target);

        let reaper = thread::spawn(move || child.wait());
        probe.kill(&target, true);
        assert_eq!(down_event(&events), (true, true));
        assert!(reaper.join().unwrap().is_ok());
    }

    #[test]
    fn test_unlicensed_kill_reports_would_kill() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let target = child.id().to_string();
        let (mut probe, events) = probe();
        probe.start_monitoring(&target);

        probe.kill(&target, false);
        assert_eq!(down_event(&events), (false, true));
        assert!(is_process_alive(child.id() as i32));

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_refused_sigkill_reports_would_kill() {
        let (handle, events) = ProbeHandle::channel();
        settle_kill("4242", 4242, Err(Errno::EPERM), POLL, &handle);
        assert_eq!(down_event(&events), (false, true));
    }

    #[test]
    fn test_sigkill_for_vanished_process_reports_plain_down() {
        let (handle, events) = ProbeHandle::channel();
        settle_kill("4242", 4242, Err(Errno::ESRCH), POLL, &handle);
        assert_eq!(down_event(&events), (false, false));
    }

    #[test]
    fn test_exit_is_reported_down() {
        let mut child = Command::new("sleep").arg("0.2").spawn().unwrap();
        let target = child.id().to_string();
        let (mut probe, events) = probe();
        probe.start_monitoring(&target);

        let reaper = thread::spawn(move || child.wait());
        assert_eq!(down_event(&events), (false, false));
        assert!(reaper.join().unwrap().is_ok());
    }
}
