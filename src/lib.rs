//! Falcon: a hierarchical failure detector.
//!
//! Applications register a chain of layers (process, host, hypervisor, ...).
//! Each layer has an enforcer that watches the layer below it and can kill
//! it; clients learn of failures through Up/Down notifications and escalate
//! through the chain when an end-to-end deadline passes.

pub mod client;
pub mod commands;
pub mod config;
pub mod enforcer;
pub mod generation;
pub mod logging;
pub mod probe;
pub mod rpc;
pub mod status;
