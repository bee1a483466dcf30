//! End-to-end generation: rate limiter, prompt, external call, stream
//! accumulation, validation and lifecycle bookkeeping.
//!
//! ```text
//! generate_batch
//!     |  build_variations
//!     v
//! run_one (x N, at most fan_out concurrently)
//!     |  create_pending
//!     |  with_retry( acquire -> generate -> accumulate -> parse )
//!     |  validate
//!     v
//! complete | fail          --> rank (batch only)
//! ```

use std::sync::Arc;

use futures::StreamExt;
use subdiv_db::models::{
    Candidate, FailureInfo, FailureKind, GeneratedPlan, GenerationRequest, GenerationStatus,
    Strategy, TokenUsage,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{GenerationCall, GenerationClient, ModelResponse};
use crate::config::PipelineConfig;
use crate::error::GenerationError;
use crate::lifecycle::{CompletedGeneration, LifecycleError, LifecycleManager, Selection};
use crate::progress::{ProgressEvent, ProgressSink, ProgressStatus};
use crate::prompt::{build_prompt, prompt_fingerprint, response_schema};
use crate::rank::{RankError, Ranking, rank};
use crate::rate_limit::RateLimiter;
use crate::retry::{Retried, with_retry};
use crate::stream::{RawModelResponse, StreamAccumulator};
use crate::validate::validate_with;
use crate::variants::build_variations;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("generation for candidate {candidate_id} failed after {attempts} attempt(s): {message}")]
    GenerationFailed {
        candidate_id: Uuid,
        kind: FailureKind,
        message: String,
        attempts: u32,
    },

    #[error("generation for candidate {candidate_id} was cancelled")]
    Cancelled { candidate_id: Uuid },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Rank(#[from] RankError),
}

/// Result of one variant in a batch.
#[derive(Debug)]
pub struct VariantOutcome {
    pub index: u32,
    pub request: GenerationRequest,
    pub result: Result<Candidate, PipelineError>,
}

/// Result of [`Pipeline::generate_batch`]. Variants are ordered by index,
/// never by completion order.
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch_id: Uuid,
    pub variants: Vec<VariantOutcome>,
    /// Rankings of the variants that completed.
    pub rankings: Vec<Ranking>,
}

impl BatchOutcome {
    pub fn completed(&self) -> impl Iterator<Item = &Candidate> {
        self.variants.iter().filter_map(|v| v.result.as_ref().ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = (u32, &PipelineError)> {
        self.variants
            .iter()
            .filter_map(|v| v.result.as_ref().err().map(|e| (v.index, e)))
    }
}

/// Where a run sits within a batch.
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    batch_id: Option<Uuid>,
    variant_index: Option<u32>,
}

pub struct Pipeline {
    client: Arc<dyn GenerationClient>,
    limiter: Arc<RateLimiter>,
    lifecycle: Arc<LifecycleManager>,
    config: PipelineConfig,
    progress: ProgressSink,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("client", &self.client.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Pipeline {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        lifecycle: Arc<LifecycleManager>,
        config: PipelineConfig,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        Self {
            client,
            limiter,
            lifecycle,
            config,
            progress: ProgressSink::disabled(),
        }
    }

    /// Share a limiter with other pipelines calling the same service.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Generate one candidate.
    ///
    /// On success the candidate is `completed`; its validation outcome is
    /// data on the candidate, never an error. On failure or cancellation
    /// the candidate is `failed` and the error names it.
    pub async fn generate(
        &self,
        project_id: &str,
        request: GenerationRequest,
        strategy: Option<Strategy>,
        cancel: &CancellationToken,
    ) -> Result<Candidate, PipelineError> {
        self.run_one(project_id, request, strategy, Slot::default(), cancel)
            .await
    }

    /// Generate `count` variants of `base`, at most `fan_out` at a time, and
    /// rank the ones that complete. A failed variant does not fail the
    /// batch.
    pub async fn generate_batch(
        &self,
        project_id: &str,
        base: GenerationRequest,
        count: u32,
        strategy: Option<Strategy>,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, PipelineError> {
        validate_request(&base)?;
        if count == 0 {
            return Err(PipelineError::InvalidRequest(
                "variant count must be at least 1".to_string(),
            ));
        }

        let batch_id = Uuid::new_v4();
        let fan_out = self.config.fan_out.max(1);
        info!(batch_id = %batch_id, project_id, count, fan_out, "starting batch");

        let variants = build_variations(&base, count, &self.config.variation);
        let mut outcomes: Vec<VariantOutcome> = futures::stream::iter(variants)
            .map(|v| async move {
                let slot = Slot {
                    batch_id: Some(batch_id),
                    variant_index: Some(v.index),
                };
                let result = self
                    .run_one(project_id, v.request.clone(), strategy, slot, cancel)
                    .await;
                VariantOutcome {
                    index: v.index,
                    request: v.request,
                    result,
                }
            })
            .buffer_unordered(fan_out)
            .collect()
            .await;
        outcomes.sort_by_key(|o| o.index);

        let completed: Vec<Candidate> = outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .cloned()
            .collect();
        let rankings = rank(&completed, base.land_area, self.config.price_per_area)?;

        info!(
            batch_id = %batch_id,
            completed = completed.len(),
            failed = outcomes.len() - completed.len(),
            "batch finished"
        );
        Ok(BatchOutcome {
            batch_id,
            variants: outcomes,
            rankings,
        })
    }

    /// Issue a fresh generation from an existing candidate's stored
    /// parameters. The source candidate is not modified.
    pub async fn regenerate(
        &self,
        candidate_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Candidate, PipelineError> {
        let source = self.lifecycle.get(candidate_id).await?;

        let fingerprint = prompt_fingerprint(&build_prompt(&source.request, None));
        match &source.prompt_fingerprint {
            Some(stored) if *stored != fingerprint => {
                warn!(
                    candidate_id = %candidate_id,
                    stored = %stored,
                    current = %fingerprint,
                    "prompt changed since the source candidate was generated"
                );
            }
            _ => {}
        }

        info!(candidate_id = %candidate_id, project_id = %source.project_id, "regenerating");
        self.run_one(
            &source.project_id,
            source.request.clone(),
            None,
            Slot::default(),
            cancel,
        )
        .await
    }

    /// Rank every completed candidate of a project against the land area
    /// of its first candidate.
    pub async fn rank_project(&self, project_id: &str) -> Result<Vec<Ranking>, PipelineError> {
        self.rank_project_priced(project_id, self.config.price_per_area)
            .await
    }

    /// [`Pipeline::rank_project`] with an explicit sale price instead of the
    /// configured one.
    pub async fn rank_project_priced(
        &self,
        project_id: &str,
        price_per_area: Option<f64>,
    ) -> Result<Vec<Ranking>, PipelineError> {
        let candidates: Vec<Candidate> = self
            .lifecycle
            .list(project_id)
            .await?
            .into_iter()
            .filter(|c| c.generation_status == GenerationStatus::Completed && c.plan.is_some())
            .collect();
        let Some(first) = candidates.first() else {
            return Ok(Vec::new());
        };
        let input_area = first.request.land_area;
        Ok(rank(&candidates, input_area, price_per_area)?)
    }

    /// Approve and activate a candidate, archiving its batch siblings.
    pub async fn select(&self, candidate_id: Uuid) -> Result<Selection, PipelineError> {
        Ok(self.lifecycle.select(candidate_id).await?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn run_one(
        &self,
        project_id: &str,
        mut request: GenerationRequest,
        strategy: Option<Strategy>,
        slot: Slot,
        cancel: &CancellationToken,
    ) -> Result<Candidate, PipelineError> {
        validate_request(&request)?;

        // Fold the strategy into the stored request so regeneration rebuilds
        // the same prompt.
        request.strategy = strategy.or(request.strategy);
        let prompt = build_prompt(&request, None);

        let mut pending = Candidate::pending(project_id, request.clone());
        pending.batch_id = slot.batch_id;
        pending.variant_index = slot.variant_index;
        pending.prompt_fingerprint = Some(prompt_fingerprint(&prompt));
        let id = self.lifecycle.create_pending(pending).await?.id;

        self.emit(
            ProgressEvent::new(ProgressStatus::Started, "generation started")
                .variant(slot.variant_index)
                .candidate(id),
        );

        let call = GenerationCall {
            prompt,
            schema: response_schema(),
            request,
        };
        let started = Instant::now();
        let result = with_retry(
            &self.config.retry,
            cancel,
            GenerationError::disposition,
            |attempt| self.attempt(&call, id, slot.variant_index, attempt, cancel),
        )
        .await;

        match result {
            Ok(Retried {
                value: (plan, usage),
                attempts,
                possibly_duplicated,
                ..
            }) => {
                self.emit(
                    ProgressEvent::new(ProgressStatus::Validating, "validating plan")
                        .attempt(attempts)
                        .variant(slot.variant_index)
                        .candidate(id),
                );
                let report = validate_with(
                    &plan,
                    call.request.land_area,
                    call.request.amenity_percent,
                    &self.config.validation,
                );
                let outcome = CompletedGeneration {
                    plan,
                    report,
                    usage,
                    estimated_cost: Some(self.client.estimate_cost(&usage)),
                    duration: started.elapsed(),
                    attempts,
                    possibly_duplicated,
                };
                let candidate = self.lifecycle.complete(id, outcome).await?;

                let status = candidate
                    .validation_status
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                self.emit(
                    ProgressEvent::new(ProgressStatus::Completed, format!("plan {status}"))
                        .attempt(attempts)
                        .variant(slot.variant_index)
                        .candidate(id),
                );
                Ok(candidate)
            }
            Err(e) => {
                let attempts = e.attempts();
                let (kind, message) = match e.last_error() {
                    Some(err) => (err.kind(), err.to_string()),
                    None => (FailureKind::Cancelled, GenerationError::Cancelled.to_string()),
                };
                for failure in e.history() {
                    debug!(
                        candidate_id = %id,
                        attempt = failure.attempt,
                        "attempt failed: {}",
                        failure.message
                    );
                }

                self.lifecycle
                    .fail(
                        id,
                        FailureInfo {
                            kind,
                            message: message.clone(),
                            attempts,
                        },
                        e.possibly_duplicated(),
                    )
                    .await?;
                self.emit(
                    ProgressEvent::new(ProgressStatus::Failed, message.clone())
                        .attempt(attempts)
                        .variant(slot.variant_index)
                        .candidate(id),
                );

                if kind == FailureKind::Cancelled {
                    Err(PipelineError::Cancelled { candidate_id: id })
                } else {
                    Err(PipelineError::GenerationFailed {
                        candidate_id: id,
                        kind,
                        message,
                        attempts,
                    })
                }
            }
        }
    }

    /// One attempt: take a rate-limit slot, call the backend, accumulate
    /// the output and parse it. Bounded by the attempt timeout and
    /// interruptible by `cancel`.
    async fn attempt(
        &self,
        call: &GenerationCall,
        candidate_id: Uuid,
        variant_index: Option<u32>,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<(GeneratedPlan, TokenUsage), GenerationError> {
        let service = self.client.name();
        tokio::select! {
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            permit = self.limiter.acquire(service) => {
                let permit = permit?;
                debug!(service, sequence = permit.sequence, attempt, "rate limit slot granted");
            }
        }

        info!(candidate_id = %candidate_id, service, attempt, "calling generation service");
        self.emit(
            ProgressEvent::new(ProgressStatus::Processing, format!("calling {service}"))
                .attempt(attempt)
                .variant(variant_index)
                .candidate(candidate_id),
        );

        let timeout = self.config.attempt_timeout();
        let started = Instant::now();
        let work = async {
            let raw = match self.client.generate(call).await? {
                ModelResponse::Streaming(stream) => {
                    let progress = self.progress.clone();
                    let mut acc = StreamAccumulator::new().with_progress(move |_chunk, so_far| {
                        progress.emit(
                            ProgressEvent::new(
                                ProgressStatus::Processing,
                                format!("received {} bytes", so_far.len()),
                            )
                            .attempt(attempt)
                            .variant(variant_index)
                            .candidate(candidate_id),
                        );
                    });
                    if let Err(e) = acc.consume(stream).await {
                        return Err(e.after_output(acc.len()));
                    }
                    acc.finish()
                }
                ModelResponse::Complete { text, usage } => {
                    RawModelResponse::complete(text, usage, started.elapsed())
                }
            };
            debug!(
                candidate_id = %candidate_id,
                len = raw.text.len(),
                chunks = raw.chunks,
                elapsed_ms = raw.duration.as_millis() as u64,
                "model response received"
            );
            let plan = raw.plan()?;
            Ok::<_, GenerationError>((plan, raw.usage))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            res = tokio::time::timeout(timeout, work) => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(GenerationError::Timeout(timeout)),
            },
        }
    }

    fn emit(&self, event: ProgressEvent) {
        self.progress.emit(event);
    }
}

/// Largest lot count a single request may ask for.
pub const MAX_TARGET_LOTS: u32 = 10_000;

/// Reject requests no backend could satisfy before creating a candidate.
fn validate_request(request: &GenerationRequest) -> Result<(), PipelineError> {
    let positive = |name: &str, v: f64| {
        if v.is_finite() && v > 0.0 {
            Ok(())
        } else {
            Err(PipelineError::InvalidRequest(format!(
                "{name} must be a positive number, got {v}"
            )))
        }
    };
    positive("land width", request.land_width)?;
    positive("land length", request.land_length)?;
    positive("land area", request.land_area)?;

    if !(0.0..100.0).contains(&request.amenity_percent) {
        return Err(PipelineError::InvalidRequest(format!(
            "amenity percent must be in [0, 100), got {}",
            request.amenity_percent
        )));
    }
    match request.target_lots {
        Some(0) => {
            return Err(PipelineError::InvalidRequest(
                "target lot count must be at least 1".to_string(),
            ));
        }
        Some(n) if n > MAX_TARGET_LOTS => {
            return Err(PipelineError::InvalidRequest(format!(
                "target lot count must be at most {MAX_TARGET_LOTS}, got {n}"
            )));
        }
        _ => {}
    }
    if let Some(ratio) = request.lot_aspect_ratio {
        positive("lot aspect ratio", ratio)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_validation() {
        assert!(validate_request(&GenerationRequest::new(20.0, 50.0, 20.0)).is_ok());
        assert!(validate_request(&GenerationRequest::new(0.0, 50.0, 20.0)).is_err());
        assert!(validate_request(&GenerationRequest::new(20.0, f64::NAN, 20.0)).is_err());
        assert!(validate_request(&GenerationRequest::new(20.0, 50.0, 100.0)).is_err());
        assert!(validate_request(&GenerationRequest::new(20.0, 50.0, -1.0)).is_err());

        let zero_target = GenerationRequest {
            target_lots: Some(0),
            ..GenerationRequest::new(20.0, 50.0, 20.0)
        };
        assert!(matches!(
            validate_request(&zero_target),
            Err(PipelineError::InvalidRequest(m)) if m.contains("target")
        ));
    }

    #[test]
    fn target_lot_count_is_bounded() {
        let at_cap = GenerationRequest {
            target_lots: Some(MAX_TARGET_LOTS),
            ..GenerationRequest::new(20.0, 50.0, 20.0)
        };
        assert!(validate_request(&at_cap).is_ok());

        let huge = GenerationRequest {
            target_lots: Some(4_000_000_000),
            ..GenerationRequest::new(20.0, 50.0, 20.0)
        };
        assert!(matches!(
            validate_request(&huge),
            Err(PipelineError::InvalidRequest(m)) if m.contains("at most 10000")
        ));
    }
}
