//! Backup, restore and housekeeping services.

pub mod backup_service;
pub mod catalog;
pub mod config_store;
pub mod config_sync_service;
pub mod encryption;
pub mod event_bus;
pub mod exclusivity;
pub mod migration_service;
pub mod notification_service;
pub mod retention_service;
pub mod scheduler_service;
pub mod task_tracker;

pub use backup_service::BackupService;
