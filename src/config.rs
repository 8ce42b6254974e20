//! TOML configuration for enforcers, clients and probes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::generation::Generation;
use crate::probe::{Behavior, ProcessProbe, Probe, ScriptedProbe};

pub const DEFAULT_ENFORCER_PORT: u16 = 22222;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FalconConfig {
    pub enforcer: EnforcerConfig,
    pub client: ClientConfig,
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcerConfig {
    pub listen: String,
    pub generation_log: PathBuf,
    /// Generation vector of this layer's ancestors.
    pub base_generation: Generation,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_retries: u32,
    pub down_retries: u32,
    pub rpc_timeout_secs: u64,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{DEFAULT_ENFORCER_PORT}"),
            generation_log: PathBuf::from("falcon-generations.log"),
            base_generation: Generation::empty(),
            heartbeat_interval_secs: 90,
            heartbeat_retries: 5,
            down_retries: 3,
            rpc_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Address the notification responder binds.
    pub listen: String,
    /// Host enforcers should call back on, when the listener address is not
    /// reachable from them.
    pub advertise_host: Option<String>,
    pub enforcer_port: u16,
    pub rpc_timeout_secs: u64,
    pub rpc_attempts: u32,
    pub kill_retry_secs: u64,
    pub kill_attempts: u32,
    pub default_up_interval_secs: i32,
    pub callback_workers: usize,
    /// Static layer name to enforcer address overrides.
    pub hosts: HashMap<String, SocketAddr>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:0".to_string(),
            advertise_host: None,
            enforcer_port: DEFAULT_ENFORCER_PORT,
            rpc_timeout_secs: 10,
            rpc_attempts: 3,
            kill_retry_secs: 3,
            kill_attempts: 5,
            default_up_interval_secs: 60,
            callback_workers: 4,
            hosts: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    #[default]
    Scripted,
    Process,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub kind: ProbeKind,
    pub poll_interval_ms: u64,
    pub confirm_wait_ms: u64,
    /// Scripted probe behaviour per target. Empty means the stock
    /// `alive`, `dead` and `stuck` targets.
    pub targets: HashMap<String, Behavior>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            kind: ProbeKind::Scripted,
            poll_interval_ms: 100,
            confirm_wait_ms: 5,
            targets: HashMap::new(),
        }
    }
}

impl ProbeConfig {
    pub fn build(&self) -> Box<dyn Probe> {
        let poll = Duration::from_millis(self.poll_interval_ms);
        match self.kind {
            ProbeKind::Scripted if self.targets.is_empty() => Box::new(ScriptedProbe::standard(poll)),
            ProbeKind::Scripted => Box::new(ScriptedProbe::new(self.targets.clone(), poll)),
            ProbeKind::Process => Box::new(ProcessProbe::new(
                poll,
                Duration::from_millis(self.confirm_wait_ms),
            )),
        }
    }
}

impl FalconConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse falcon config")
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Load from `path`, or from the default location if it exists, or fall
    /// back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_file(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load_file(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// `$XDG_CONFIG_HOME/falcon/config.toml` or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("falcon").join("config.toml"))
}
