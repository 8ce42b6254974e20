//! CLI subcommands.

pub mod enforcer;
pub mod generations;
pub mod watch;
