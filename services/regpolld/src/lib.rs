//! Register Polling Service
//!
//! Thin adapters around `regpoll-core`: configuration loading, logging
//! bootstrap, the CLI, the polling loop with derived values, and actuators.

pub mod actuator;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod poller;

pub use error::{Result, ServiceError};

pub const SERVICE_NAME: &str = "regpolld";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
