//! Domain models.

pub mod artifact;
pub mod connection;
pub mod schedule;
pub mod settings;
pub mod storage_target;
pub mod task;

pub use artifact::{
    ArtifactLocation, ArtifactName, BackupArtifact, ChecksumRecord, TransformChain,
    VerificationReport,
};
pub use connection::{ConnectionParams, DatabaseConnection, EngineKind};
pub use schedule::ScheduleEntry;
pub use settings::{
    CompressionAlgorithm, EncryptionAlgorithm, GlobalSettings, KeySource, WebhookKind,
};
pub use storage_target::{StorageBackendConfig, StorageTarget, TargetKind};
pub use task::{Task, TaskError, TaskKind, TaskStatus};
