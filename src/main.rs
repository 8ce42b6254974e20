use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use falcon::commands::enforcer::EnforcerOverrides;
use falcon::commands::watch::WatchArgs;
use falcon::commands::{enforcer, generations, watch};
use falcon::config::FalconConfig;
use falcon::logging;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "falcon")]
#[command(about = "Hierarchical failure detector for layered applications", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/falcon/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an enforcer for this layer in the foreground
    Enforcer {
        /// Address to listen on (overrides [enforcer].listen)
        #[arg(short, long)]
        listen: Option<String>,

        /// Generation log path (overrides [enforcer].generation_log)
        #[arg(long, value_name = "PATH")]
        log: Option<PathBuf>,
    },

    /// Monitor a chain of layers and print every callback
    ///
    /// Layers are given innermost first, e.g. `falcon watch appA hostA hypervisorA`.
    Watch {
        /// Layer handles, innermost first (at least two)
        #[arg(required = true, num_args = 2..)]
        layers: Vec<String>,

        /// Grant the enforcers a license to kill these layers
        #[arg(long)]
        lethal: bool,

        /// End-to-end timeout in seconds (0 disables the watchdog)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Requested Up notification period in seconds (negative: none)
        #[arg(short, long, allow_hyphen_values = true)]
        up_interval: Option<i32>,
    },

    /// Print the counters recorded in a generation log
    Generations {
        /// Generation log to replay
        log: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Enforcer { listen, log } => {
            let config = FalconConfig::load(cli.config.as_deref())?;
            enforcer::execute(
                config,
                EnforcerOverrides {
                    listen,
                    generation_log: log,
                },
            )
        }
        Commands::Watch {
            layers,
            lethal,
            timeout,
            up_interval,
        } => {
            let config = FalconConfig::load(cli.config.as_deref())?;
            watch::execute(
                &config,
                WatchArgs {
                    chain: layers,
                    lethal,
                    timeout_secs: timeout,
                    up_interval_secs: up_interval,
                },
            )
        }
        Commands::Generations { log, json } => generations::execute(&log, json),
    }
}
