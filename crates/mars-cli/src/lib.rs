//! `mars` command line front end: layered configuration, subcommand handlers
//! and run reports on top of the `coordination` library.

pub mod cli;
pub mod commands;
pub mod config;
pub mod report;

pub use cli::{Cli, Command};
pub use config::MarsConfig;
