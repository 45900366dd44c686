use foundry_db::StoreError;
use foundry_storage::StorageError;

/// A failure that kept a generation task's outcome from being recorded.
///
/// The delivery is nacked and the task redelivered; backend failures are
/// never reported through this type, they become failed segments.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors raised while assembling the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] foundry_core::config::ConfigError),

    #[error("Failed to connect to the database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to apply migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Adapter(#[from] foundry_adapters::FactoryError),

    #[error(transparent)]
    Orchestrator(#[from] foundry_pipeline::OrchestratorError),
}
