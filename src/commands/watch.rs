//! `falcon watch`: register a chain and print every callback until a
//! terminal one arrives.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use colored::Colorize;

use crate::client::{CallbackFn, ClientCoordinator, MonitorTarget, Notification};
use crate::config::FalconConfig;
use crate::status::FalconStatus;

#[derive(Debug, Clone)]
pub struct WatchArgs {
    /// Layers, innermost first.
    pub chain: Vec<String>,
    pub lethal: bool,
    pub timeout_secs: Option<u64>,
    pub up_interval_secs: Option<i32>,
}

enum WatchEvent {
    Callback { status: FalconStatus, line: String },
    Interrupted,
}

/// End-to-end timeout: explicit, or three Up periods when Ups are requested.
pub fn effective_timeout(timeout_secs: Option<u64>, up_interval_secs: i32) -> Duration {
    match timeout_secs {
        Some(secs) => Duration::from_secs(secs),
        None if up_interval_secs >= 0 => Duration::from_secs(up_interval_secs.max(1) as u64 * 3),
        None => Duration::ZERO,
    }
}

pub fn execute(config: &FalconConfig, args: WatchArgs) -> Result<()> {
    let coordinator = ClientCoordinator::start(&config.client)?;
    let (events, received) = mpsc::channel();

    let sink = events.clone();
    let callback: CallbackFn = Arc::new(move |notification: &Notification| {
        let _ = sink.send(WatchEvent::Callback {
            status: notification.status,
            line: notification.describe(),
        });
    });
    ctrlc::set_handler(move || {
        let _ = events.send(WatchEvent::Interrupted);
    })
    .context("Failed to set Ctrl+C handler")?;

    let up_interval = args
        .up_interval_secs
        .unwrap_or(config.client.default_up_interval_secs);
    let timeout = effective_timeout(args.timeout_secs, up_interval);

    println!(
        "{} Registering {} (return address {})",
        "→".cyan().bold(),
        args.chain.join(" < ").bold(),
        coordinator.return_addr()
    );
    let target = coordinator
        .start_monitoring(&args.chain, args.lethal, Some(callback), None, up_interval)
        .context("Failed to start monitoring")?;
    target.start_timer(timeout);
    println!("{} Monitoring, end-to-end timeout {:?}", "✓".green().bold(), timeout);

    while let Ok(event) = received.recv() {
        match event {
            WatchEvent::Callback { status, line } if !status.is_terminal() => {
                println!("{} {}", "♥".green(), line.dimmed());
                target.start_timer(timeout);
            }
            WatchEvent::Callback { line, .. } => {
                println!("{} {}", "✗".red().bold(), line);
                break;
            }
            WatchEvent::Interrupted => {
                println!("{} Releasing chain", "→".cyan().bold());
                target.uninit();
                wait_for_release(&target, Duration::from_secs(config.client.rpc_timeout_secs));
                break;
            }
        }
    }
    Ok(())
}

/// Give the release sweep a chance to reach the enforcers before exiting.
fn wait_for_release(target: &MonitorTarget, limit: Duration) {
    let deadline = Instant::now() + limit;
    while target.leaf().is_some() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
}
