//! Entity persistence for the render engine.
//!
//! [`EntityStore`] is the seam the orchestrator, workers and composition
//! stage share. [`MemoryStore`] keeps everything in process; [`PgStore`]
//! persists to Postgres through the zero-sized repositories in
//! [`repositories`].

pub mod memory;
pub mod models;
pub mod pg;
pub mod repositories;
pub mod store;

use sqlx::postgres::PgPoolOptions;

pub use memory::MemoryStore;
pub use pg::PgStore;
pub use store::{EntityStore, GenerationRecord, StoreError, StoreResult};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Run a trivial query to confirm the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the embedded migrations in `crates/db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
