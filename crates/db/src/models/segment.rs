//! Segment entity model and DTOs.

use foundry_core::taxonomy::ErrorCode;
use foundry_core::types::{DbId, Fingerprint, OutputRef, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::models::status::SegmentStatus;

/// A row from the `segments` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Segment {
    pub id: DbId,
    pub project_id: DbId,
    /// Dense `0..n-1` within the project.
    pub order_index: i32,
    pub prompt: String,
    /// Opaque to the engine; `model` selects the generation backend.
    pub model_params: serde_json::Value,
    #[sqlx(rename = "status_id", try_from = "i16")]
    pub status: SegmentStatus,
    pub fingerprint: Fingerprint,
    /// Set iff `status` is `completed`.
    pub output_ref: Option<OutputRef>,
    // -- Last failure --
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub error_retryable: Option<bool>,
    // -- Current attempt --
    /// Incremented each time the segment enters `queued`.
    pub attempt: i32,
    pub backend: Option<String>,
    pub external_job_id: Option<String>,
    // -- Timestamps --
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Segment {
    /// Parsed form of the persisted `error_code`.
    pub fn failure_code(&self) -> Option<ErrorCode> {
        self.error_code
            .as_deref()
            .and_then(|code| ErrorCode::parse(code).ok())
    }

    /// Failed with a non-retryable error for the current fingerprint.
    ///
    /// Such a segment only becomes eligible again once it is edited.
    pub fn is_dead_lettered(&self) -> bool {
        self.status == SegmentStatus::Failed && self.error_retryable == Some(false)
    }

    /// Failed with a retryable error.
    pub fn is_retryable_failure(&self) -> bool {
        self.status == SegmentStatus::Failed && self.error_retryable == Some(true)
    }
}

/// DTO for adding a segment to a project.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSegment {
    pub prompt: String,
    #[serde(default = "empty_params")]
    pub model_params: serde_json::Value,
    /// Insert before the segment currently at this index; append when `None`
    /// or past the end.
    pub position: Option<i32>,
}

impl CreateSegment {
    pub fn new(prompt: impl Into<String>, model_params: serde_json::Value) -> Self {
        Self {
            prompt: prompt.into(),
            model_params,
            position: None,
        }
    }
}

/// DTO for editing a segment's generation inputs. Omitted fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSegment {
    pub prompt: Option<String>,
    pub model_params: Option<serde_json::Value>,
}

/// Result of [`EntityStore::update_segment`](crate::store::EntityStore::update_segment).
#[derive(Debug, Clone)]
pub struct SegmentEdit {
    pub segment: Segment,
    /// The fingerprint changed and the segment was reset to `pending`.
    pub changed: bool,
    /// Active jobs that were awaiting the superseded fingerprint and have
    /// been failed.
    pub superseded_jobs: Vec<DbId>,
}

/// Terminal failure to persist on a segment.
#[derive(Debug, Clone)]
pub struct SegmentFailure {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl SegmentFailure {
    /// Failure whose retryability follows the code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}
