//! CloudNet node
//!
//! Wires the cluster crate to a real process: configuration file, logging,
//! default collaborators and the bootstrap sequence.

pub mod commands;
pub mod config;
pub mod logging;
pub mod node;
pub mod services;
pub mod templates;
