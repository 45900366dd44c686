//! Repository for the `projects` table.

use foundry_core::types::DbId;
use sqlx::PgPool;

use crate::models::project::{CreateProject, Project};
use crate::models::status::{status_ids, ACTIVE_JOB_STATUSES};

/// Column list for `projects` queries.
const COLUMNS: &str = "id, name, created_at, updated_at";

/// Outcome of [`ProjectRepo::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectDelete {
    Deleted,
    NotFound,
    ActiveJob,
}

/// Provides CRUD operations for projects.
pub struct ProjectRepo;

impl ProjectRepo {
    pub async fn create(pool: &PgPool, input: &CreateProject) -> Result<Project, sqlx::Error> {
        let query = format!("INSERT INTO projects (name) VALUES ($1) RETURNING {COLUMNS}");
        sqlx::query_as::<_, Project>(&query)
            .bind(&input.name)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Project>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM projects WHERE id = $1");
        sqlx::query_as::<_, Project>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn exists(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let row: (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM projects WHERE id = $1)")
            .bind(id)
            .fetch_one(pool)
            .await?;
        Ok(row.0)
    }

    /// Delete a project unless it has an active render job.
    ///
    /// Segments, generations and jobs go with it via `ON DELETE CASCADE`.
    pub async fn delete(pool: &PgPool, id: DbId) -> Result<ProjectDelete, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let locked: Option<(DbId,)> =
            sqlx::query_as("SELECT id FROM projects WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Ok(ProjectDelete::NotFound);
        }

        let active: (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM render_jobs WHERE project_id = $1 AND status_id = ANY($2))",
        )
        .bind(id)
        .bind(status_ids(&ACTIVE_JOB_STATUSES))
        .fetch_one(&mut *tx)
        .await?;
        if active.0 {
            return Ok(ProjectDelete::ActiveJob);
        }

        sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(ProjectDelete::Deleted)
    }

    /// Bump `updated_at` after a segment change.
    pub async fn touch(pool: &PgPool, id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE projects SET updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
