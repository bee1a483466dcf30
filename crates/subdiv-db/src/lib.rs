//! Data model and persistence boundary for subdivision plan candidates.
//!
//! The core pipeline owns all state transitions; this crate only defines
//! the shapes that get stored and the [`store::CandidateStore`] trait the
//! pipeline writes through.

pub mod models;
pub mod store;
