//! Shared helpers for loopback integration tests

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use falcon::client::{CallbackFn, Notification};
use falcon::config::{ClientConfig, EnforcerConfig};
use falcon::enforcer::EnforcerServer;
use falcon::probe::ScriptedProbe;
use falcon::status::FalconStatus;

pub const POLL: Duration = Duration::from_millis(20);
pub const WAIT: Duration = Duration::from_secs(10);

/// Enforcer settings for a throwaway loopback enforcer logging into `dir`.
pub fn enforcer_config(dir: &TempDir) -> EnforcerConfig {
    EnforcerConfig {
        listen: "127.0.0.1:0".to_string(),
        generation_log: dir.path().join("generations.log"),
        rpc_timeout_secs: 2,
        ..EnforcerConfig::default()
    }
}

/// Start an enforcer over the stock scripted targets.
pub fn start_enforcer(config: &EnforcerConfig) -> EnforcerServer {
    EnforcerServer::start(config, Box::new(ScriptedProbe::standard(POLL)))
        .expect("Failed to start enforcer")
}

/// Client settings that resolve layer names to the given enforcers.
pub fn client_config(enforcers: &[(&str, SocketAddr)]) -> ClientConfig {
    let hosts: HashMap<String, SocketAddr> = enforcers
        .iter()
        .map(|(name, addr)| (name.to_string(), *addr))
        .collect();
    ClientConfig {
        listen: "127.0.0.1:0".to_string(),
        rpc_timeout_secs: 2,
        rpc_attempts: 1,
        kill_retry_secs: 1,
        kill_attempts: 3,
        callback_workers: 1,
        hosts,
        ..ClientConfig::default()
    }
}

/// Callback that forwards every delivered status.
pub fn recorder() -> (CallbackFn, Receiver<FalconStatus>) {
    let (tx, rx) = mpsc::channel();
    let callback: CallbackFn = Arc::new(move |notification: &Notification| {
        let _ = tx.send(notification.status);
    });
    (callback, rx)
}

/// Skip liveness deliveries and return the first terminal status.
pub fn next_terminal(statuses: &Receiver<FalconStatus>, limit: Duration) -> Option<FalconStatus> {
    let deadline = Instant::now() + limit;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match statuses.recv_timeout(remaining) {
            Ok(status) if status.is_terminal() => return Some(status),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

pub fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(POLL);
    }
    condition()
}

pub fn chain(layers: &[&str]) -> Vec<String> {
    layers.iter().map(|layer| layer.to_string()).collect()
}
