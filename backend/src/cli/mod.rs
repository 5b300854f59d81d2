//! Command-line interface for db-keeper.

pub mod commands;
pub mod runner;

pub use commands::{Cli, Command};
pub use runner::run;
