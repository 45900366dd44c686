//! Generation workers and engine runtime.
//!
//! - [`generation`]: the per-slot generation task loop.
//! - [`pool`]: a fixed number of worker slots.
//! - [`runtime`]: [`Engine`] assembly, start-up reconciliation and shutdown.

pub mod error;
pub mod generation;
pub mod pool;
pub mod runtime;

pub use error::{EngineError, WorkerError};
pub use generation::{GenerationWorker, TaskOutcome, WorkerSettings};
pub use pool::WorkerPool;
pub use runtime::{Engine, EngineComponents};
