//! Entity models and DTOs.

pub mod generation;
pub mod project;
pub mod render_job;
pub mod segment;
pub mod status;
