//! Repository for the `segments` table.
//!
//! Every status change is a conditional `UPDATE ... WHERE status_id = ANY(..)`
//! guarded by fingerprint and attempt; a `None` return means the
//! precondition no longer held.

use foundry_core::hashing::segment_fingerprint;
use foundry_core::types::DbId;
use sqlx::PgPool;

use crate::models::generation::SegmentGeneration;
use crate::models::segment::{CreateSegment, Segment, SegmentFailure, UpdateSegment};
use crate::models::status::{status_ids, RenderJobStatus, SegmentStatus, ACTIVE_JOB_STATUSES};

/// Column list for `segments` queries.
pub(crate) const COLUMNS: &str = "\
    id, project_id, order_index, prompt, model_params, status_id, fingerprint, \
    output_ref, error_code, error_message, error_retryable, \
    attempt, backend, external_job_id, created_at, updated_at";

/// Assignments that clear the failure and external-job fields.
const CLEAR_ATTEMPT: &str = "\
    error_code = NULL, error_message = NULL, error_retryable = NULL, \
    backend = NULL, external_job_id = NULL";

/// Outcome of [`SegmentRepo::update_inputs`].
#[derive(Debug, Clone)]
pub struct InputsUpdate {
    pub segment: Segment,
    pub changed: bool,
    pub superseded_jobs: Vec<DbId>,
}

/// Outcome of [`SegmentRepo::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentDelete {
    Deleted,
    NotFound,
    ActiveJob,
}

/// Provides CRUD and state-transition operations for segments.
pub struct SegmentRepo;

impl SegmentRepo {
    /// Insert a segment at `input.position` (append when absent), shifting
    /// later segments by one.
    pub async fn insert(
        pool: &PgPool,
        project_id: DbId,
        input: &CreateSegment,
    ) -> Result<Segment, sqlx::Error> {
        let mut tx = pool.begin().await?;

        // Serialises concurrent inserts into the same project.
        sqlx::query("SELECT id FROM projects WHERE id = $1 FOR UPDATE")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM segments WHERE project_id = $1")
            .bind(project_id)
            .fetch_one(&mut *tx)
            .await?;
        let count = count.0 as i32;
        let position = input.position.map_or(count, |p| p.clamp(0, count));

        sqlx::query(
            "UPDATE segments SET order_index = order_index + 1, updated_at = NOW() \
             WHERE project_id = $1 AND order_index >= $2",
        )
        .bind(project_id)
        .bind(position)
        .execute(&mut *tx)
        .await?;

        let query = format!(
            "INSERT INTO segments (project_id, order_index, prompt, model_params, status_id, fingerprint) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        let segment = sqlx::query_as::<_, Segment>(&query)
            .bind(project_id)
            .bind(position)
            .bind(&input.prompt)
            .bind(&input.model_params)
            .bind(SegmentStatus::Pending.id())
            .bind(segment_fingerprint(&input.prompt, &input.model_params))
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("UPDATE projects SET updated_at = NOW() WHERE id = $1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(segment)
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Segment>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM segments WHERE id = $1");
        sqlx::query_as::<_, Segment>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Segments of a project ordered by `order_index`.
    pub async fn list_by_project(
        pool: &PgPool,
        project_id: DbId,
    ) -> Result<Vec<Segment>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM segments WHERE project_id = $1 ORDER BY order_index ASC"
        );
        sqlx::query_as::<_, Segment>(&query)
            .bind(project_id)
            .fetch_all(pool)
            .await
    }

    /// Edit prompt/model params. A changed fingerprint resets the segment
    /// to pending and fails active jobs awaiting the old fingerprint.
    pub async fn update_inputs(
        pool: &PgPool,
        id: DbId,
        input: &UpdateSegment,
    ) -> Result<Option<InputsUpdate>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!("SELECT {COLUMNS} FROM segments WHERE id = $1 FOR UPDATE");
        let Some(current) = sqlx::query_as::<_, Segment>(&query)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        let prompt = input.prompt.as_ref().unwrap_or(&current.prompt);
        let model_params = input.model_params.as_ref().unwrap_or(&current.model_params);
        let fingerprint = segment_fingerprint(prompt, model_params);
        let changed = fingerprint != current.fingerprint;

        let segment = if changed {
            let query = format!(
                "UPDATE segments SET prompt = $2, model_params = $3, fingerprint = $4, \
                 status_id = $5, output_ref = NULL, {CLEAR_ATTEMPT}, updated_at = NOW() \
                 WHERE id = $1 RETURNING {COLUMNS}"
            );
            sqlx::query_as::<_, Segment>(&query)
                .bind(id)
                .bind(prompt)
                .bind(model_params)
                .bind(&fingerprint)
                .bind(SegmentStatus::Pending.id())
                .fetch_one(&mut *tx)
                .await?
        } else {
            let query = format!(
                "UPDATE segments SET prompt = $2, model_params = $3, updated_at = NOW() \
                 WHERE id = $1 RETURNING {COLUMNS}"
            );
            sqlx::query_as::<_, Segment>(&query)
                .bind(id)
                .bind(prompt)
                .bind(model_params)
                .fetch_one(&mut *tx)
                .await?
        };

        let superseded_jobs: Vec<DbId> = if changed {
            let rows: Vec<(DbId,)> = sqlx::query_as(
                "UPDATE render_jobs \
                 SET status_id = $3, error_code = NULL, error_message = $4, \
                     completed_at = NOW(), updated_at = NOW() \
                 WHERE status_id = ANY($5) AND id IN ( \
                     SELECT job_id FROM render_job_segments \
                     WHERE segment_id = $1 AND fingerprint = $2 AND completed = FALSE \
                 ) \
                 RETURNING id",
            )
            .bind(id)
            .bind(&current.fingerprint)
            .bind(RenderJobStatus::Failed.id())
            .bind(format!("Segment {id} was edited during the render"))
            .bind(status_ids(&ACTIVE_JOB_STATUSES))
            .fetch_all(&mut *tx)
            .await?;
            rows.into_iter().map(|r| r.0).collect()
        } else {
            Vec::new()
        };

        sqlx::query("UPDATE projects SET updated_at = NOW() WHERE id = $1")
            .bind(segment.project_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(InputsUpdate {
            segment,
            changed,
            superseded_jobs,
        }))
    }

    /// Delete a segment unless an active job references it, then close the
    /// gap in the project's order indexes.
    pub async fn delete(pool: &PgPool, id: DbId) -> Result<SegmentDelete, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let project: Option<(DbId,)> =
            sqlx::query_as("SELECT project_id FROM segments WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((project_id,)) = project else {
            return Ok(SegmentDelete::NotFound);
        };

        let active: (bool,) = sqlx::query_as(
            "SELECT EXISTS ( \
                 SELECT 1 FROM render_job_segments rjs \
                 JOIN render_jobs rj ON rj.id = rjs.job_id \
                 WHERE rjs.segment_id = $1 AND rj.status_id = ANY($2) \
             )",
        )
        .bind(id)
        .bind(status_ids(&ACTIVE_JOB_STATUSES))
        .fetch_one(&mut *tx)
        .await?;
        if active.0 {
            return Ok(SegmentDelete::ActiveJob);
        }

        sqlx::query("DELETE FROM segments WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE segments s SET order_index = ranked.new_index, updated_at = NOW() \
             FROM ( \
                 SELECT id, (ROW_NUMBER() OVER (ORDER BY order_index) - 1)::INTEGER AS new_index \
                 FROM segments WHERE project_id = $1 \
             ) ranked \
             WHERE s.id = ranked.id AND s.order_index <> ranked.new_index",
        )
        .bind(project_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE projects SET updated_at = NOW() WHERE id = $1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(SegmentDelete::Deleted)
    }

    /// Assign `order_index = position in ordered_ids`. The caller has
    /// already checked that `ordered_ids` is a permutation of the project.
    pub async fn reorder(
        pool: &PgPool,
        project_id: DbId,
        ordered_ids: &[DbId],
    ) -> Result<Vec<Segment>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        for (index, id) in ordered_ids.iter().enumerate() {
            sqlx::query(
                "UPDATE segments SET order_index = $3, updated_at = NOW() \
                 WHERE id = $1 AND project_id = $2 AND order_index <> $3",
            )
            .bind(id)
            .bind(project_id)
            .bind(index as i32)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("UPDATE projects SET updated_at = NOW() WHERE id = $1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Self::list_by_project(pool, project_id).await
    }

    /// CAS `from -> queued`, incrementing `attempt`.
    pub async fn queue(
        pool: &PgPool,
        id: DbId,
        fingerprint: &str,
        from: &[SegmentStatus],
    ) -> Result<Option<Segment>, sqlx::Error> {
        let query = format!(
            "UPDATE segments \
             SET status_id = $3, attempt = attempt + 1, output_ref = NULL, {CLEAR_ATTEMPT}, \
                 updated_at = NOW() \
             WHERE id = $1 AND fingerprint = $2 AND status_id = ANY($4) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Segment>(&query)
            .bind(id)
            .bind(fingerprint)
            .bind(SegmentStatus::Queued.id())
            .bind(status_ids(from))
            .fetch_optional(pool)
            .await
    }

    /// CAS `queued -> generating` for one attempt.
    pub async fn start(
        pool: &PgPool,
        id: DbId,
        fingerprint: &str,
        attempt: i32,
    ) -> Result<Option<Segment>, sqlx::Error> {
        let query = format!(
            "UPDATE segments SET status_id = $4, updated_at = NOW() \
             WHERE id = $1 AND fingerprint = $2 AND attempt = $3 AND status_id = $5 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Segment>(&query)
            .bind(id)
            .bind(fingerprint)
            .bind(attempt)
            .bind(SegmentStatus::Generating.id())
            .bind(SegmentStatus::Queued.id())
            .fetch_optional(pool)
            .await
    }

    pub async fn set_external_job(
        pool: &PgPool,
        id: DbId,
        attempt: i32,
        backend: &str,
        external_job_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE segments SET backend = $3, external_job_id = $4, updated_at = NOW() \
             WHERE id = $1 AND attempt = $2 AND status_id = $5",
        )
        .bind(id)
        .bind(attempt)
        .bind(backend)
        .bind(external_job_id)
        .bind(SegmentStatus::Generating.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// CAS `queued | generating -> failed` for one attempt.
    pub async fn fail(
        pool: &PgPool,
        id: DbId,
        fingerprint: &str,
        attempt: i32,
        failure: &SegmentFailure,
    ) -> Result<Option<Segment>, sqlx::Error> {
        let query = format!(
            "UPDATE segments \
             SET status_id = $4, output_ref = NULL, error_code = $5, error_message = $6, \
                 error_retryable = $7, updated_at = NOW() \
             WHERE id = $1 AND fingerprint = $2 AND attempt = $3 AND status_id = ANY($8) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Segment>(&query)
            .bind(id)
            .bind(fingerprint)
            .bind(attempt)
            .bind(SegmentStatus::Failed.id())
            .bind(failure.code.as_str())
            .bind(&failure.message)
            .bind(failure.retryable)
            .bind(status_ids(&[SegmentStatus::Queued, SegmentStatus::Generating]))
            .fetch_optional(pool)
            .await
    }

    /// CAS `pending | failed -> completed` from a recorded generation.
    pub async fn reuse(
        pool: &PgPool,
        generation: &SegmentGeneration,
    ) -> Result<Option<Segment>, sqlx::Error> {
        let query = format!(
            "UPDATE segments \
             SET status_id = $3, output_ref = $4, {CLEAR_ATTEMPT}, updated_at = NOW() \
             WHERE id = $1 AND fingerprint = $2 AND status_id = ANY($5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Segment>(&query)
            .bind(generation.segment_id)
            .bind(&generation.fingerprint)
            .bind(SegmentStatus::Completed.id())
            .bind(&generation.output_ref)
            .bind(status_ids(&[SegmentStatus::Pending, SegmentStatus::Failed]))
            .fetch_optional(pool)
            .await
    }
}
