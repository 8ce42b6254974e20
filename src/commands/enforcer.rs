//! `falcon enforcer`: run an enforcer in the foreground.

use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::Colorize;

use crate::config::FalconConfig;
use crate::enforcer::EnforcerServer;

/// Command-line overrides for the `[enforcer]` section.
#[derive(Debug, Default, Clone)]
pub struct EnforcerOverrides {
    pub listen: Option<String>,
    pub generation_log: Option<PathBuf>,
}

pub fn execute(mut config: FalconConfig, overrides: EnforcerOverrides) -> Result<()> {
    if let Some(listen) = overrides.listen {
        config.enforcer.listen = listen;
    }
    if let Some(path) = overrides.generation_log {
        config.enforcer.generation_log = path;
    }

    let probe = config.probe.build();
    let server = EnforcerServer::start(&config.enforcer, probe)?;

    let trigger = server.shutdown_trigger();
    ctrlc::set_handler(move || trigger.trigger()).context("Failed to set Ctrl+C handler")?;

    println!(
        "{} Enforcer listening on {} ({:?} probe, log {})",
        "→".cyan().bold(),
        server.local_addr().to_string().bold(),
        config.probe.kind,
        config.enforcer.generation_log.display()
    );
    println!("{}", "Press Ctrl+C to stop".dimmed());

    server.join()?;
    println!("{} Enforcer stopped", "✓".green().bold());
    Ok(())
}
