//! Metamorph - supervise a fleet of coding agents that coordinate through git

pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod git;
pub mod layout;
pub mod locks;
pub mod notify;
pub mod process;
pub mod reconcile;
pub mod runtime;
pub mod state;
pub mod subprocess;
pub mod telemetry;

#[cfg(test)]
mod testutil;
