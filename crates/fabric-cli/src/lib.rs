//! Fabric CLI library
//!
//! Argument parsing, layered configuration and the handlers behind the
//! `fabric` binary's `hub`, `leaf` and `keygen` subcommands.

pub mod cli;
pub mod commands;
pub mod config;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::ConfigError;
