//! Commkit CLI library
//!
//! Scenario runners and configuration loading for the `commkit` demonstration binary.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;

pub use app::{CommkitApp, PingSummary, StreamSummary};
pub use cli::{Cli, Commands};
pub use config::AppConfig;
pub use error::{CliError, Result};
