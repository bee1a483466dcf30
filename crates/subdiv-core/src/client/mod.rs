//! Generation backends.
//!
//! ```text
//! Pipeline --generate(call)--> &dyn GenerationClient
//!                                  |
//!                   +--------------+--------------+
//!                   |                             |
//!             GeminiClient                   DemoClient
//!   (SSE over streamGenerateContent)   (offline, deterministic)
//! ```

pub mod demo;
pub mod gemini;
pub mod trait_def;

pub use demo::DemoClient;
pub use gemini::{GeminiClient, GeminiConfig};
pub use trait_def::{ChunkStream, GenerationCall, GenerationClient, ModelResponse};
