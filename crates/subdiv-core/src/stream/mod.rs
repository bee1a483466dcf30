//! Assembly of the model's (possibly streamed, possibly truncated) output.
//!
//! Chunks are applied strictly one at a time in arrival order. Nothing is
//! parsed until the stream ends; at that point the buffer must hold one
//! complete JSON document or the attempt fails with
//! [`GenerationError::Truncated`] instead of a partial parse.

mod decode;

use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::Value;
use subdiv_db::models::{GeneratedPlan, TokenUsage};
use tokio::time::Instant;

use crate::error::GenerationError;

pub use decode::decode_plan;

/// Bytes of model output kept on each side for diagnostics.
const DIAGNOSTIC_CHARS: usize = 80;

/// One item of a generation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    Text(String),
    /// Usage counters; backends may report these more than once, the last
    /// report wins.
    Usage(TokenUsage),
}

/// Accumulated output of one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct RawModelResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub duration: Duration,
    pub chunks: usize,
}

type ProgressFn<'a> = Box<dyn FnMut(&str, &str) + Send + 'a>;

/// Sequential single-consumer buffer for model output.
pub struct StreamAccumulator<'a> {
    buffer: String,
    usage: TokenUsage,
    chunks: usize,
    started: Instant,
    on_progress: Option<ProgressFn<'a>>,
}

impl std::fmt::Debug for StreamAccumulator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAccumulator")
            .field("len", &self.buffer.len())
            .field("chunks", &self.chunks)
            .field("usage", &self.usage)
            .finish()
    }
}

impl Default for StreamAccumulator<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> StreamAccumulator<'a> {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            usage: TokenUsage::default(),
            chunks: 0,
            started: Instant::now(),
            on_progress: None,
        }
    }

    /// Invoke `f(chunk, accumulated_so_far)` after every text chunk.
    pub fn with_progress(mut self, f: impl FnMut(&str, &str) + Send + 'a) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn push(&mut self, chunk: ModelChunk) {
        match chunk {
            ModelChunk::Text(text) => self.push_text(&text),
            ModelChunk::Usage(usage) => self.usage = usage,
        }
    }

    pub fn push_text(&mut self, text: &str) {
        self.buffer.push_str(text);
        self.chunks += 1;
        if let Some(f) = self.on_progress.as_mut() {
            f(text, &self.buffer);
        }
    }

    /// Drain `stream` into the buffer. Stops at the first stream error.
    pub async fn consume<S>(&mut self, stream: S) -> Result<(), GenerationError>
    where
        S: Stream<Item = Result<ModelChunk, GenerationError>>,
    {
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            self.push(item?);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn finish(self) -> RawModelResponse {
        RawModelResponse {
            text: self.buffer,
            usage: self.usage,
            duration: self.started.elapsed(),
            chunks: self.chunks,
        }
    }
}

impl RawModelResponse {
    /// Wrap a response that arrived in one piece (non-streaming mode).
    pub fn complete(text: impl Into<String>, usage: TokenUsage, duration: Duration) -> Self {
        Self {
            text: text.into(),
            usage,
            duration,
            chunks: 1,
        }
    }

    /// Parse the buffer as an untyped JSON document after checking it is
    /// complete.
    pub fn document(&self) -> Result<Value, GenerationError> {
        parse_document(&self.text)
    }

    /// Parse and coerce the buffer into a [`GeneratedPlan`].
    pub fn plan(&self) -> Result<GeneratedPlan, GenerationError> {
        let doc = self.document()?;
        decode_plan(doc).map_err(|reason| malformed(&self.text, reason))
    }
}

/// Locate the complete top-level JSON document in `text` and parse it.
///
/// Leading prose and markdown fences before the document are skipped, as
/// is anything after its closing bracket.
pub fn parse_document(text: &str) -> Result<Value, GenerationError> {
    let span = document_span(text)?;
    serde_json::from_str(&text[span.0..span.1]).map_err(|e| malformed(text, e.to_string()))
}

/// Byte range `[start, end)` of the first complete top-level object/array.
fn document_span(text: &str) -> Result<(usize, usize), GenerationError> {
    let Some(start) = text.find(['{', '[']) else {
        return Err(if text.trim().is_empty() {
            truncated(text)
        } else {
            malformed(text, "no JSON document in response".to_string())
        });
    };

    let mut expected: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in text.as_bytes()[start..].iter().copied().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => expected.push(b'}'),
            b'[' => expected.push(b']'),
            b'}' | b']' => {
                if expected.pop() != Some(byte) {
                    return Err(malformed(
                        text,
                        format!("unbalanced '{}' at byte {}", byte as char, start + offset),
                    ));
                }
                if expected.is_empty() {
                    return Ok((start, start + offset + 1));
                }
            }
            _ => {}
        }
    }

    tracing::warn!(
        len = text.len(),
        open_brackets = expected.len(),
        in_string,
        "model response ended before the document closed"
    );
    Err(truncated(text))
}

fn truncated(text: &str) -> GenerationError {
    GenerationError::Truncated {
        len: text.len(),
        suffix: suffix(text),
    }
}

fn malformed(text: &str, reason: String) -> GenerationError {
    tracing::warn!(len = text.len(), reason = %reason, "malformed model response");
    GenerationError::Malformed {
        len: text.len(),
        reason,
        prefix: text.chars().take(DIAGNOSTIC_CHARS).collect(),
        suffix: suffix(text),
    }
}

fn suffix(text: &str) -> String {
    let mut tail: Vec<char> = text.chars().rev().take(DIAGNOSTIC_CHARS).collect();
    tail.reverse();
    tail.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn accumulate(chunks: &[&str]) -> RawModelResponse {
        let mut acc = StreamAccumulator::new();
        for c in chunks {
            acc.push_text(c);
        }
        acc.finish()
    }

    #[test]
    fn split_chunks_parse_like_single_chunk() {
        let split = accumulate(&["{\"a\":1", "}"]);
        let whole = accumulate(&["{\"a\":1}"]);
        assert_eq!(split.document().unwrap(), whole.document().unwrap());
        assert_eq!(split.document().unwrap(), json!({"a": 1}));
        assert_eq!(split.chunks, 2);
    }

    #[test]
    fn progress_callback_sees_chunk_and_accumulation() {
        let mut seen = Vec::new();
        {
            let mut acc = StreamAccumulator::new()
                .with_progress(|chunk, so_far| seen.push((chunk.to_string(), so_far.len())));
            acc.push_text("{\"a\"");
            acc.push(ModelChunk::Usage(TokenUsage {
                input_tokens: 3,
                output_tokens: 4,
            }));
            acc.push_text(":1}");
        }
        assert_eq!(seen, vec![("{\"a\"".to_string(), 4), (":1}".to_string(), 7)]);
    }

    #[test]
    fn missing_closing_brace_is_truncated() {
        let err = accumulate(&["{\"lots\": [{\"number\": 1}", ", {\"number\": 2"])
            .document()
            .unwrap_err();
        assert!(matches!(err, GenerationError::Truncated { .. }), "{err:?}");
    }

    #[test]
    fn open_string_is_truncated() {
        let err = parse_document("{\"description\": \"a long te").unwrap_err();
        assert!(matches!(err, GenerationError::Truncated { .. }));
    }

    #[test]
    fn empty_response_is_truncated() {
        let err = parse_document("  \n").unwrap_err();
        assert!(matches!(err, GenerationError::Truncated { len: 3, .. }));
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let doc = parse_document(r#"{"description": "a } tricky \" { value"}"#).unwrap();
        assert_eq!(doc["description"], "a } tricky \" { value");
    }

    #[test]
    fn fenced_document_with_trailing_prose() {
        let doc = parse_document("```json\n{\"a\": [1, 2]}\n```\nHope this helps!").unwrap();
        assert_eq!(doc, json!({"a": [1, 2]}));
    }

    #[test]
    fn prose_without_json_is_malformed() {
        let err = parse_document("I cannot produce that layout.").unwrap_err();
        match err {
            GenerationError::Malformed { len, prefix, .. } => {
                assert_eq!(len, 29);
                assert!(prefix.starts_with("I cannot"));
            }
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_bracket_is_malformed() {
        let err = parse_document("{\"a\": [1, 2}").unwrap_err();
        assert!(matches!(err, GenerationError::Malformed { .. }));
    }

    #[test]
    fn malformed_diagnostics_are_bounded() {
        let long = format!("{{\"a\": {}}}", "x".repeat(10_000));
        let err = parse_document(&long).unwrap_err();
        match err {
            GenerationError::Malformed {
                len,
                prefix,
                suffix,
                ..
            } => {
                assert_eq!(len, long.len());
                assert_eq!(prefix.chars().count(), DIAGNOSTIC_CHARS);
                assert_eq!(suffix.chars().count(), DIAGNOSTIC_CHARS);
            }
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn non_streaming_response_behaves_identically() {
        let whole = RawModelResponse::complete("{\"a\":1}", TokenUsage::default(), Duration::ZERO);
        assert_eq!(whole.document().unwrap(), accumulate(&["{\"a\":", "1}"]).document().unwrap());
    }

    #[tokio::test]
    async fn consume_applies_chunks_in_order() {
        let chunks = vec![
            Ok(ModelChunk::Text("{\"seq\": [".into())),
            Ok(ModelChunk::Text("1, 2".into())),
            Ok(ModelChunk::Text(", 3]}".into())),
            Ok(ModelChunk::Usage(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            })),
        ];
        let mut acc = StreamAccumulator::new();
        acc.consume(futures::stream::iter(chunks)).await.unwrap();
        let raw = acc.finish();
        assert_eq!(raw.document().unwrap(), json!({"seq": [1, 2, 3]}));
        assert_eq!(raw.usage.total(), 15);
    }

    #[tokio::test]
    async fn consume_stops_on_stream_error() {
        let chunks = vec![
            Ok(ModelChunk::Text("{\"a\":".into())),
            Err(GenerationError::TransientCall("connection reset".into())),
            Ok(ModelChunk::Text("1}".into())),
        ];
        let mut acc = StreamAccumulator::new();
        let err = acc.consume(futures::stream::iter(chunks)).await.unwrap_err();
        assert_eq!(err, GenerationError::TransientCall("connection reset".into()));
        assert_eq!(acc.len(), 5);
    }
}
