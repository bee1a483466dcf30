//! The `GenerationClient` trait, the seam to external generation services.
//!
//! The trait is object-safe so the pipeline can hold an
//! `Arc<dyn GenerationClient>` chosen at runtime.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use subdiv_db::models::{GenerationRequest, TokenUsage};

use crate::error::GenerationError;
use crate::stream::ModelChunk;

/// Incremental output of a streaming call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, GenerationError>> + Send>>;

/// Everything a backend needs for one call.
#[derive(Debug, Clone)]
pub struct GenerationCall {
    /// Exact instruction text.
    pub prompt: String,
    /// JSON schema the response must follow.
    pub schema: Value,
    /// The structured request the prompt was built from. Backends that
    /// cannot use the prompt text (offline synthesis) read this instead.
    pub request: GenerationRequest,
}

/// Shape of a backend's answer. The accumulator treats both identically
/// once the text has arrived.
pub enum ModelResponse {
    Streaming(ChunkStream),
    Complete { text: String, usage: TokenUsage },
}

impl std::fmt::Debug for ModelResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming(_) => f.write_str("ModelResponse::Streaming(..)"),
            Self::Complete { text, usage } => f
                .debug_struct("ModelResponse::Complete")
                .field("len", &text.len())
                .field("usage", usage)
                .finish(),
        }
    }
}

/// Adapter interface for a structured-output text model.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Service name, also the rate limiter key (e.g. "gemini").
    fn name(&self) -> &str;

    /// Start one generation call.
    ///
    /// Errors returned here happen before any output arrived (connection,
    /// HTTP status). Errors during streaming arrive as stream items.
    async fn generate(&self, call: &GenerationCall) -> Result<ModelResponse, GenerationError>;

    /// Estimated cost in USD of a call with the given usage.
    fn estimate_cost(&self, usage: &TokenUsage) -> f64;
}

// Compile-time assertion: GenerationClient must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn GenerationClient) {}
};

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct EchoClient;

    #[async_trait]
    impl GenerationClient for EchoClient {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, call: &GenerationCall) -> Result<ModelResponse, GenerationError> {
            let text = call.prompt.clone();
            Ok(ModelResponse::Streaming(Box::pin(futures::stream::once(
                async move { Ok(ModelChunk::Text(text)) },
            ))))
        }

        fn estimate_cost(&self, usage: &TokenUsage) -> f64 {
            usage.total() as f64 * 0.001
        }
    }

    #[tokio::test]
    async fn client_is_object_safe() {
        let client: Box<dyn GenerationClient> = Box::new(EchoClient);
        assert_eq!(client.name(), "echo");

        let call = GenerationCall {
            prompt: "{}".into(),
            schema: Value::Null,
            request: GenerationRequest::new(10.0, 10.0, 0.0),
        };
        let ModelResponse::Streaming(stream) = client.generate(&call).await.unwrap() else {
            panic!("expected a stream");
        };
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks, vec![Ok(ModelChunk::Text("{}".into()))]);
        assert!((client.estimate_cost(&TokenUsage {
            input_tokens: 10,
            output_tokens: 0
        }) - 0.01)
            .abs()
            < 1e-12);
    }
}
