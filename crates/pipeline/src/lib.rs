//! Render orchestration and composition.
//!
//! - [`orchestrator`]: dispatch, event folding, retry, cancel, reconcile.
//! - [`composition`]: the serial composition-task consumer.
//! - [`compositor`]: clip joining (byte concat or ffmpeg).

pub mod composition;
pub mod compositor;
pub mod error;
pub mod orchestrator;

pub use composition::CompositionStage;
pub use compositor::{build_compositor, Compositor, ConcatCompositor, FfmpegCompositor};
pub use error::{CompositionError, OrchestratorError};
pub use orchestrator::{JobProgress, Orchestrator, OrchestratorResult, ReconcileReport};
