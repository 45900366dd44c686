//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument. Multi-statement operations run
//! in a transaction and lock the rows they guard.

pub mod generation_repo;
pub mod project_repo;
pub mod render_job_repo;
pub mod segment_repo;

pub use generation_repo::GenerationRepo;
pub use project_repo::ProjectRepo;
pub use render_job_repo::RenderJobRepo;
pub use segment_repo::SegmentRepo;
