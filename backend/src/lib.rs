//! db-keeper - Backend Library
//!
//! Backup, restore and storage orchestration for PostgreSQL, MySQL, MariaDB,
//! SQL Server and MongoDB.

#[macro_use]
mod macros;

pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod services;
pub mod storage;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
