//! Repository for the `segment_generations` table.

use foundry_core::types::DbId;
use sqlx::PgPool;

use crate::models::generation::SegmentGeneration;
use crate::models::segment::Segment;
use crate::models::status::SegmentStatus;
use crate::repositories::segment_repo;

/// Column list for `segment_generations` queries.
const COLUMNS: &str = "id, segment_id, fingerprint, output_ref, created_at";

/// Outcome of [`GenerationRepo::record`].
#[derive(Debug, Clone)]
pub struct RecordedGeneration {
    pub generation: SegmentGeneration,
    pub created: bool,
    pub completed_segment: Option<Segment>,
}

/// Provides lookup and idempotent insert for successful generations.
pub struct GenerationRepo;

impl GenerationRepo {
    pub async fn find(
        pool: &PgPool,
        segment_id: DbId,
        fingerprint: &str,
    ) -> Result<Option<SegmentGeneration>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM segment_generations WHERE segment_id = $1 AND fingerprint = $2"
        );
        sqlx::query_as::<_, SegmentGeneration>(&query)
            .bind(segment_id)
            .bind(fingerprint)
            .fetch_optional(pool)
            .await
    }

    /// Insert the generation unless one exists for the fingerprint, then
    /// complete the segment if the fingerprint is still current.
    ///
    /// The first recorded `output_ref` wins; later duplicates return it.
    pub async fn record(
        pool: &PgPool,
        segment_id: DbId,
        fingerprint: &str,
        output_ref: &str,
    ) -> Result<RecordedGeneration, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!(
            "INSERT INTO segment_generations (segment_id, fingerprint, output_ref) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (segment_id, fingerprint) DO NOTHING \
             RETURNING {COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, SegmentGeneration>(&query)
            .bind(segment_id)
            .bind(fingerprint)
            .bind(output_ref)
            .fetch_optional(&mut *tx)
            .await?;

        let (generation, created) = match inserted {
            Some(generation) => (generation, true),
            None => {
                let query = format!(
                    "SELECT {COLUMNS} FROM segment_generations \
                     WHERE segment_id = $1 AND fingerprint = $2"
                );
                let existing = sqlx::query_as::<_, SegmentGeneration>(&query)
                    .bind(segment_id)
                    .bind(fingerprint)
                    .fetch_one(&mut *tx)
                    .await?;
                (existing, false)
            }
        };

        let query = format!(
            "UPDATE segments \
             SET status_id = $3, output_ref = $4, error_code = NULL, error_message = NULL, \
                 error_retryable = NULL, updated_at = NOW() \
             WHERE id = $1 AND fingerprint = $2 AND status_id <> $3 \
             RETURNING {}",
            segment_repo::COLUMNS
        );
        let completed_segment = sqlx::query_as::<_, Segment>(&query)
            .bind(segment_id)
            .bind(fingerprint)
            .bind(SegmentStatus::Completed.id())
            .bind(&generation.output_ref)
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(RecordedGeneration {
            generation,
            created,
            completed_segment,
        })
    }
}
