//! Render job entity model.

use foundry_core::taxonomy::ErrorCode;
use foundry_core::types::{DbId, Fingerprint, OutputRef, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

use crate::models::status::RenderJobStatus;

/// A row from the `render_jobs` table plus its segment snapshot.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RenderJob {
    pub id: DbId,
    pub project_id: DbId,
    #[sqlx(rename = "status_id", try_from = "i16")]
    pub status: RenderJobStatus,
    pub segments_total: i32,
    /// Never exceeds `segments_total`; never decreases.
    pub segments_completed: i32,
    /// Set in the same step as the transition to `compositing`.
    pub composition_dispatched: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub final_output_ref: Option<OutputRef>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    /// Ordered by `order_index`. Loaded from `render_job_segments`.
    #[sqlx(skip)]
    pub segments: Vec<JobSegment>,
}

/// One entry of a render job's segment snapshot.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct JobSegment {
    pub segment_id: DbId,
    pub order_index: i32,
    /// The fingerprint the job renders for this segment.
    pub fingerprint: Fingerprint,
    pub completed: bool,
}

impl RenderJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Percentage of snapshot segments with an output, `0.0..=100.0`.
    pub fn progress_percent(&self) -> f64 {
        if self.segments_total <= 0 {
            return 0.0;
        }
        f64::from(self.segments_completed) / f64::from(self.segments_total) * 100.0
    }

    /// Whether the job still waits on `(segment_id, fingerprint)`.
    pub fn awaits(&self, segment_id: DbId, fingerprint: &str) -> bool {
        !self.is_terminal()
            && self
                .segments
                .iter()
                .any(|s| s.segment_id == segment_id && s.fingerprint == fingerprint && !s.completed)
    }

    /// Whether the snapshot includes `segment_id` at all.
    pub fn references(&self, segment_id: DbId) -> bool {
        self.segments.iter().any(|s| s.segment_id == segment_id)
    }

    /// Parsed form of the persisted `error_code`.
    pub fn failure_code(&self) -> Option<ErrorCode> {
        self.error_code
            .as_deref()
            .and_then(|code| ErrorCode::parse(code).ok())
    }
}

/// Outcome of recording a segment completion against one job.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    /// Terminal job, unknown segment, fingerprint mismatch or already counted.
    Unchanged,
    /// The snapshot entry flipped; more segments are outstanding.
    Progressed(RenderJob),
    /// The last entry flipped and this call moved the job to `compositing`.
    /// Exactly one caller per job ever observes this.
    ReadyForComposition(RenderJob),
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn job(status: RenderJobStatus, completed: &[bool]) -> RenderJob {
        let now = Utc::now();
        RenderJob {
            id: 1,
            project_id: 1,
            status,
            segments_total: completed.len() as i32,
            segments_completed: completed.iter().filter(|c| **c).count() as i32,
            composition_dispatched: false,
            error_code: None,
            error_message: None,
            final_output_ref: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            segments: completed
                .iter()
                .enumerate()
                .map(|(i, c)| JobSegment {
                    segment_id: i as DbId + 10,
                    order_index: i as i32,
                    fingerprint: format!("fp{i}"),
                    completed: *c,
                })
                .collect(),
        }
    }

    #[test]
    fn progress_percent() {
        assert_eq!(job(RenderJobStatus::Processing, &[true, false, false, false]).progress_percent(), 25.0);
        assert_eq!(job(RenderJobStatus::Compositing, &[true, true]).progress_percent(), 100.0);
        assert_eq!(job(RenderJobStatus::Queued, &[]).progress_percent(), 0.0);
    }

    #[test]
    fn awaits_requires_matching_fingerprint_and_active_job() {
        let active = job(RenderJobStatus::Processing, &[true, false]);
        assert!(active.awaits(11, "fp1"));
        assert!(!active.awaits(11, "other"));
        assert!(!active.awaits(10, "fp0"));

        let cancelled = job(RenderJobStatus::Cancelled, &[true, false]);
        assert!(!cancelled.awaits(11, "fp1"));
        assert!(cancelled.references(11));
    }
}
