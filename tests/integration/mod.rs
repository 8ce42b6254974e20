//! Integration tests for falcon
//!
//! These run real enforcers and client coordinators against each other over
//! loopback TCP, using the scripted probe for predictable target behaviour.

pub mod enforcer_restart;
pub mod helpers;
pub mod monitoring;
