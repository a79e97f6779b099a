//! Sidecar process that registers a service with the orchestrator and keeps it registered for as
//! long as the service runs.

pub mod args;
pub mod config;
pub mod process;
pub mod signals;
