//! Generation backends.
//!
//! A [`GenerationAdapter`] translates the engine's generation contract
//! (initiate, poll, cancel, fetch) onto one external service. The
//! [`AdapterFactory`] picks the adapter for a segment from its
//! `model_params`.

pub mod adapter;
pub mod comfyui;
pub mod error;
pub mod factory;
pub mod mock;
pub mod vetting;

pub use adapter::{ExternalJobId, GenerationAdapter, PollStatus};
pub use comfyui::ComfyUIAdapter;
pub use error::{AdapterError, FactoryError};
pub use factory::AdapterFactory;
pub use mock::{MockAdapter, MockOutcome};
pub use vetting::{AllowlistError, WorkflowAllowlist, WorkflowVetting};
