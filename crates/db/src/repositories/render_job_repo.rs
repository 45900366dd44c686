//! Repository for the `render_jobs` and `render_job_segments` tables.
//!
//! Uses `RenderJobStatus` from `models::status` for every transition. The
//! segment snapshot is loaded alongside each returned job.

use std::collections::HashMap;

use foundry_core::taxonomy::ErrorCode;
use foundry_core::types::DbId;
use sqlx::{PgConnection, PgPool};

use crate::models::render_job::{CompletionOutcome, JobSegment, RenderJob};
use crate::models::status::{status_ids, RenderJobStatus, ACTIVE_JOB_STATUSES};

/// Column list for `render_jobs` queries.
const COLUMNS: &str = "\
    id, project_id, status_id, segments_total, segments_completed, \
    composition_dispatched, error_code, error_message, final_output_ref, \
    created_at, updated_at, completed_at";

/// Provides creation, queries and CAS transitions for render jobs.
pub struct RenderJobRepo;

impl RenderJobRepo {
    /// Insert a `queued` job and its snapshot rows.
    pub async fn create(
        pool: &PgPool,
        project_id: DbId,
        snapshot: &[JobSegment],
    ) -> Result<RenderJob, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let completed = snapshot.iter().filter(|s| s.completed).count() as i32;
        let query = format!(
            "INSERT INTO render_jobs (project_id, status_id, segments_total, segments_completed) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {COLUMNS}"
        );
        let mut job = sqlx::query_as::<_, RenderJob>(&query)
            .bind(project_id)
            .bind(RenderJobStatus::Queued.id())
            .bind(snapshot.len() as i32)
            .bind(completed)
            .fetch_one(&mut *tx)
            .await?;

        for entry in snapshot {
            sqlx::query(
                "INSERT INTO render_job_segments (job_id, segment_id, order_index, fingerprint, completed) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(job.id)
            .bind(entry.segment_id)
            .bind(entry.order_index)
            .bind(&entry.fingerprint)
            .bind(entry.completed)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        let mut segments = snapshot.to_vec();
        segments.sort_by_key(|s| s.order_index);
        job.segments = segments;
        Ok(job)
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<RenderJob>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM render_jobs WHERE id = $1");
        let job = sqlx::query_as::<_, RenderJob>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Self::attach_one(pool, job).await
    }

    /// Jobs of a project, newest first.
    pub async fn list_by_project(
        pool: &PgPool,
        project_id: DbId,
    ) -> Result<Vec<RenderJob>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM render_jobs WHERE project_id = $1 ORDER BY id DESC"
        );
        let jobs = sqlx::query_as::<_, RenderJob>(&query)
            .bind(project_id)
            .fetch_all(pool)
            .await?;
        Self::attach(pool, jobs).await
    }

    /// Every non-terminal job, oldest first.
    pub async fn list_active(pool: &PgPool) -> Result<Vec<RenderJob>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM render_jobs WHERE status_id = ANY($1) ORDER BY id ASC"
        );
        let jobs = sqlx::query_as::<_, RenderJob>(&query)
            .bind(status_ids(&ACTIVE_JOB_STATUSES))
            .fetch_all(pool)
            .await?;
        Self::attach(pool, jobs).await
    }

    /// Non-terminal jobs whose snapshot still awaits `(segment_id, fingerprint)`.
    pub async fn list_awaiting(
        pool: &PgPool,
        segment_id: DbId,
        fingerprint: &str,
    ) -> Result<Vec<RenderJob>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM render_jobs \
             WHERE status_id = ANY($3) AND id IN ( \
                 SELECT job_id FROM render_job_segments \
                 WHERE segment_id = $1 AND fingerprint = $2 AND completed = FALSE \
             ) \
             ORDER BY id ASC"
        );
        let jobs = sqlx::query_as::<_, RenderJob>(&query)
            .bind(segment_id)
            .bind(fingerprint)
            .bind(status_ids(&ACTIVE_JOB_STATUSES))
            .fetch_all(pool)
            .await?;
        Self::attach(pool, jobs).await
    }

    /// Non-terminal jobs whose snapshot includes `segment_id`.
    pub async fn list_active_for_segment(
        pool: &PgPool,
        segment_id: DbId,
    ) -> Result<Vec<RenderJob>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM render_jobs \
             WHERE status_id = ANY($2) AND id IN ( \
                 SELECT job_id FROM render_job_segments WHERE segment_id = $1 \
             ) \
             ORDER BY id ASC"
        );
        let jobs = sqlx::query_as::<_, RenderJob>(&query)
            .bind(segment_id)
            .bind(status_ids(&ACTIVE_JOB_STATUSES))
            .fetch_all(pool)
            .await?;
        Self::attach(pool, jobs).await
    }

    /// CAS `from -> to`. The caller has checked the state machine allows it.
    pub async fn transition(
        pool: &PgPool,
        id: DbId,
        from: &[RenderJobStatus],
        to: RenderJobStatus,
    ) -> Result<Option<RenderJob>, sqlx::Error> {
        let query = format!(
            "UPDATE render_jobs \
             SET status_id = $2, updated_at = NOW(), \
                 completed_at = CASE WHEN $3 THEN NOW() ELSE completed_at END \
             WHERE id = $1 AND status_id = ANY($4) \
             RETURNING {COLUMNS}"
        );
        let job = sqlx::query_as::<_, RenderJob>(&query)
            .bind(id)
            .bind(to.id())
            .bind(to.is_terminal())
            .bind(status_ids(from))
            .fetch_optional(pool)
            .await?;
        Self::attach_one(pool, job).await
    }

    /// CAS `from -> compositing` with `composition_dispatched` set, only
    /// when every snapshot entry is completed.
    pub async fn begin_composition(
        pool: &PgPool,
        id: DbId,
        from: &[RenderJobStatus],
    ) -> Result<Option<RenderJob>, sqlx::Error> {
        let query = format!(
            "UPDATE render_jobs \
             SET status_id = $2, composition_dispatched = TRUE, updated_at = NOW() \
             WHERE id = $1 AND status_id = ANY($3) \
               AND composition_dispatched = FALSE \
               AND segments_completed = segments_total \
             RETURNING {COLUMNS}"
        );
        let job = sqlx::query_as::<_, RenderJob>(&query)
            .bind(id)
            .bind(RenderJobStatus::Compositing.id())
            .bind(status_ids(from))
            .fetch_optional(pool)
            .await?;
        Self::attach_one(pool, job).await
    }

    /// Flip one snapshot entry and bump the counter under a row lock on the
    /// job. Returns `None` if the job does not exist.
    pub async fn record_completion(
        pool: &PgPool,
        job_id: DbId,
        segment_id: DbId,
        fingerprint: &str,
    ) -> Result<Option<CompletionOutcome>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!("SELECT {COLUMNS} FROM render_jobs WHERE id = $1 FOR UPDATE");
        let Some(job) = sqlx::query_as::<_, RenderJob>(&query)
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        if job.is_terminal() {
            return Ok(Some(CompletionOutcome::Unchanged));
        }

        let flipped = sqlx::query(
            "UPDATE render_job_segments SET completed = TRUE \
             WHERE job_id = $1 AND segment_id = $2 AND fingerprint = $3 AND completed = FALSE",
        )
        .bind(job_id)
        .bind(segment_id)
        .bind(fingerprint)
        .execute(&mut *tx)
        .await?;
        if flipped.rows_affected() == 0 {
            return Ok(Some(CompletionOutcome::Unchanged));
        }

        let query = format!(
            "UPDATE render_jobs \
             SET segments_completed = LEAST(segments_completed + 1, segments_total), \
                 updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        let mut job = sqlx::query_as::<_, RenderJob>(&query)
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;

        let ready = job.segments_completed == job.segments_total
            && !job.composition_dispatched
            && job.status.can_transition_to(RenderJobStatus::Compositing);
        if ready {
            let query = format!(
                "UPDATE render_jobs \
                 SET status_id = $2, composition_dispatched = TRUE, updated_at = NOW() \
                 WHERE id = $1 \
                 RETURNING {COLUMNS}"
            );
            job = sqlx::query_as::<_, RenderJob>(&query)
                .bind(job_id)
                .bind(RenderJobStatus::Compositing.id())
                .fetch_one(&mut *tx)
                .await?;
        }

        job.segments = Self::load_segments(&mut *tx, job_id).await?;
        tx.commit().await?;

        Ok(Some(if ready {
            CompletionOutcome::ReadyForComposition(job)
        } else {
            CompletionOutcome::Progressed(job)
        }))
    }

    /// CAS any non-terminal status `-> failed`.
    pub async fn fail(
        pool: &PgPool,
        id: DbId,
        code: Option<ErrorCode>,
        message: &str,
    ) -> Result<Option<RenderJob>, sqlx::Error> {
        let query = format!(
            "UPDATE render_jobs \
             SET status_id = $2, error_code = $3, error_message = $4, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = ANY($5) \
             RETURNING {COLUMNS}"
        );
        let job = sqlx::query_as::<_, RenderJob>(&query)
            .bind(id)
            .bind(RenderJobStatus::Failed.id())
            .bind(code.map(ErrorCode::as_str))
            .bind(message)
            .bind(status_ids(&ACTIVE_JOB_STATUSES))
            .fetch_optional(pool)
            .await?;
        Self::attach_one(pool, job).await
    }

    /// CAS `compositing -> completed`.
    pub async fn complete(
        pool: &PgPool,
        id: DbId,
        final_output_ref: &str,
    ) -> Result<Option<RenderJob>, sqlx::Error> {
        let query = format!(
            "UPDATE render_jobs \
             SET status_id = $2, final_output_ref = $3, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $4 \
             RETURNING {COLUMNS}"
        );
        let job = sqlx::query_as::<_, RenderJob>(&query)
            .bind(id)
            .bind(RenderJobStatus::Completed.id())
            .bind(final_output_ref)
            .bind(RenderJobStatus::Compositing.id())
            .fetch_optional(pool)
            .await?;
        Self::attach_one(pool, job).await
    }

    async fn load_segments(
        conn: &mut PgConnection,
        job_id: DbId,
    ) -> Result<Vec<JobSegment>, sqlx::Error> {
        sqlx::query_as::<_, JobSegment>(
            "SELECT segment_id, order_index, fingerprint, completed \
             FROM render_job_segments WHERE job_id = $1 ORDER BY order_index ASC",
        )
        .bind(job_id)
        .fetch_all(conn)
        .await
    }

    async fn attach_one(
        pool: &PgPool,
        job: Option<RenderJob>,
    ) -> Result<Option<RenderJob>, sqlx::Error> {
        match job {
            Some(job) => Ok(Self::attach(pool, vec![job]).await?.pop()),
            None => Ok(None),
        }
    }

    /// Load the snapshot of every job in one query.
    async fn attach(pool: &PgPool, mut jobs: Vec<RenderJob>) -> Result<Vec<RenderJob>, sqlx::Error> {
        if jobs.is_empty() {
            return Ok(jobs);
        }
        let ids: Vec<DbId> = jobs.iter().map(|j| j.id).collect();
        let rows: Vec<(DbId, DbId, i32, String, bool)> = sqlx::query_as(
            "SELECT job_id, segment_id, order_index, fingerprint, completed \
             FROM render_job_segments WHERE job_id = ANY($1) \
             ORDER BY job_id, order_index ASC",
        )
        .bind(&ids)
        .fetch_all(pool)
        .await?;

        let mut by_job: HashMap<DbId, Vec<JobSegment>> = HashMap::new();
        for (job_id, segment_id, order_index, fingerprint, completed) in rows {
            by_job.entry(job_id).or_default().push(JobSegment {
                segment_id,
                order_index,
                fingerprint,
                completed,
            });
        }
        for job in &mut jobs {
            job.segments = by_job.remove(&job.id).unwrap_or_default();
        }
        Ok(jobs)
    }
}
