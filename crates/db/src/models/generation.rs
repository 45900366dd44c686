//! Successful segment generations, keyed by `(segment_id, fingerprint)`.

use foundry_core::types::{DbId, Fingerprint, OutputRef, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `segment_generations` table.
///
/// A segment is clean exactly when a generation exists for its current
/// fingerprint.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SegmentGeneration {
    pub id: DbId,
    pub segment_id: DbId,
    pub fingerprint: Fingerprint,
    pub output_ref: OutputRef,
    pub created_at: Timestamp,
}
