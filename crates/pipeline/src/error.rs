use foundry_core::error::CoreError;
use foundry_core::taxonomy::ErrorCode;
use foundry_core::types::DbId;
use foundry_db::StoreError;
use foundry_events::QueueError;
use foundry_storage::StorageError;

/// Errors returned by [`Orchestrator`](crate::Orchestrator) operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Project {0} has no segments")]
    EmptyProject(DbId),

    /// A segment failed with a non-retryable error and has not been edited
    /// since.
    #[error("Segment {segment_id} failed with {code}; edit it before rendering again")]
    DeadLettered { segment_id: DbId, code: ErrorCode },

    #[error("Segment {0} is not in a retryable failed state")]
    NotRetryable(DbId),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Core(CoreError::NotFound { entity, id }) => Self::NotFound { entity, id },
            other => Self::Store(other),
        }
    }
}

/// Errors from assembling a job's final artifact.
#[derive(Debug, thiserror::Error)]
pub enum CompositionError {
    #[error("Nothing to compose")]
    EmptyInput,

    #[error("Segment {segment_id} has no recorded output for fingerprint {fingerprint}")]
    MissingOutput { segment_id: DbId, fingerprint: String },

    #[error("ffmpeg binary not found: {0}")]
    FfmpegNotFound(std::io::Error),

    #[error("ffmpeg failed (exit code {exit_code:?}): {stderr}")]
    FfmpegFailed { exit_code: Option<i32>, stderr: String },

    #[error("Composition I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Infrastructure failure; the task is redelivered rather than failing
    /// the job.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CompositionError {
    /// Whether the failure belongs to the job rather than the
    /// infrastructure.
    pub fn fails_job(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}
