//! Subdivision layout generation core.
//!
//! Takes a land description, asks an external text model for a lot / road /
//! amenity layout, checks the answer against the business rules, ranks
//! competing variants, and carries each candidate through its approval
//! lifecycle.

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod progress;
pub mod prompt;
pub mod rank;
pub mod rate_limit;
pub mod retry;
pub mod stream;
pub mod validate;
pub mod variants;

pub use config::PipelineConfig;
pub use error::GenerationError;
pub use lifecycle::{LifecycleError, LifecycleManager};
pub use pipeline::{BatchOutcome, Pipeline, PipelineError};
