//! End-to-end tests for the generation pipeline.
//!
//! Uses a ScriptedClient that replays canned model output, so every path
//! (retry, timeout, cancellation, batch fan-out) runs without a network.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use subdiv_core::client::GenerationClient;
use subdiv_core::error::GenerationError;
use subdiv_core::progress::{ProgressSink, ProgressStatus};
use subdiv_core::rate_limit::{AcquireMode, RateLimitConfig, RateLimiter};
use subdiv_core::retry::RetryPolicy;
use subdiv_core::{LifecycleManager, Pipeline, PipelineConfig, PipelineError};
use subdiv_db::models::{
    FailureKind, GenerationRequest, GenerationStatus, LayoutKind, Strategy, ValidationStatus,
};
use subdiv_db::store::MemoryStore;
use subdiv_test_utils::{PlanBuilder, Script, ScriptedClient, chunked};

// ===========================================================================
// Helpers
// ===========================================================================

const PROJECT: &str = "riverside";

fn request() -> GenerationRequest {
    GenerationRequest::new(20.0, 50.0, 20.0)
}

fn config() -> PipelineConfig {
    PipelineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            multiplier: 2.0,
            max_jitter_ms: 0,
            max_delay_ms: 100,
        },
        rate_limit: RateLimitConfig {
            max_requests: 100,
            ..RateLimitConfig::default()
        },
        ..PipelineConfig::default()
    }
}

fn pipeline(client: Arc<ScriptedClient>, config: PipelineConfig) -> Pipeline {
    let lifecycle = Arc::new(LifecycleManager::new(Arc::new(MemoryStore::new())));
    Pipeline::new(client as Arc<dyn GenerationClient>, lifecycle, config)
}

fn truncated_plan() -> Script {
    let json = PlanBuilder::new().to_json();
    Script::Stream(vec![json[..json.len() / 2].to_string()])
}

// ===========================================================================
// Single generation
// ===========================================================================

#[tokio::test]
async fn successful_generation_completes_candidate() {
    let client = Arc::new(ScriptedClient::new(vec![Script::plan(PlanBuilder::new())]));
    let pipeline = pipeline(client.clone(), config());

    let candidate = pipeline
        .generate(PROJECT, request(), None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(candidate.generation_status, GenerationStatus::Completed);
    assert_eq!(candidate.validation_status, Some(ValidationStatus::Valid));
    assert_eq!(candidate.plan.as_ref().unwrap().lots.len(), 6);
    assert_eq!(candidate.retry_count, 0);
    assert!(!candidate.possibly_duplicated);
    assert_eq!(candidate.usage.total(), 3_000);
    assert!(candidate.estimated_cost.unwrap() > 0.0);
    assert!(candidate.prompt_fingerprint.is_some());
    assert_eq!(client.call_count(), 1);

    let stored = pipeline.lifecycle().get(candidate.id).await.unwrap();
    assert_eq!(stored, candidate);
}

#[tokio::test]
async fn non_streaming_response_is_accepted() {
    let client = Arc::new(ScriptedClient::new(vec![Script::Complete(format!(
        "Here is the layout:\n```json\n{}\n```",
        PlanBuilder::new().to_json()
    ))]));
    let pipeline = pipeline(client, config());

    let candidate = pipeline
        .generate(PROJECT, request(), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(candidate.generation_status, GenerationStatus::Completed);
}

#[tokio::test]
async fn validation_errors_are_data_not_failures() {
    let undersized = PlanBuilder::new().lots(&[85.0, 120.0, 120.0, 120.0, 120.0, 120.0]);
    let client = Arc::new(ScriptedClient::new(vec![Script::plan(undersized)]));
    let pipeline = pipeline(client, config());

    let candidate = pipeline
        .generate(PROJECT, request(), None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(candidate.generation_status, GenerationStatus::Completed);
    assert_eq!(candidate.validation_status, Some(ValidationStatus::Invalid));
    assert!(
        candidate
            .validation_errors
            .iter()
            .any(|e| e.contains("min_lot_area"))
    );
}

#[tokio::test]
async fn strategy_is_folded_into_stored_request_and_prompt() {
    let client = Arc::new(ScriptedClient::new(vec![Script::plan(PlanBuilder::new())]));
    let pipeline = pipeline(client.clone(), config());

    let candidate = pipeline
        .generate(
            PROJECT,
            request(),
            Some(Strategy::MaximizeLots),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(candidate.request.strategy, Some(Strategy::MaximizeLots));
    assert_eq!(
        client.calls()[0].request.strategy,
        Some(Strategy::MaximizeLots)
    );
}

#[tokio::test]
async fn invalid_request_creates_no_candidate() {
    let client = Arc::new(ScriptedClient::new(vec![]));
    let pipeline = pipeline(client.clone(), config());

    let err = pipeline
        .generate(
            PROJECT,
            GenerationRequest::new(0.0, 50.0, 20.0),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::InvalidRequest(_)), "{err:?}");
    assert!(pipeline.lifecycle().list(PROJECT).await.unwrap().is_empty());
    assert_eq!(client.call_count(), 0);
}

// ===========================================================================
// Retry
// ===========================================================================

#[tokio::test]
async fn truncated_stream_is_retried_and_flagged_as_possible_duplicate() {
    let client = Arc::new(ScriptedClient::new(vec![
        truncated_plan(),
        Script::plan(PlanBuilder::new()),
    ]));
    let pipeline = pipeline(client.clone(), config());

    let candidate = pipeline
        .generate(PROJECT, request(), None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(candidate.generation_status, GenerationStatus::Completed);
    assert_eq!(candidate.retry_count, 1);
    assert!(candidate.possibly_duplicated);
    assert_eq!(client.call_count(), 2);
}

#[tokio::test]
async fn transient_failures_retry_without_duplicate_flag() {
    let client = Arc::new(ScriptedClient::new(vec![
        Script::Fail(GenerationError::TransientCall("HTTP 503".into())),
        Script::StreamThenFail(
            Vec::new(),
            GenerationError::TransientCall("connection reset".into()),
        ),
        Script::plan(PlanBuilder::new()),
    ]));
    let pipeline = pipeline(client.clone(), config());

    let candidate = pipeline
        .generate(PROJECT, request(), None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(candidate.retry_count, 2);
    assert!(!candidate.possibly_duplicated);
}

#[tokio::test]
async fn stream_reset_after_output_marks_duplicate() {
    let client = Arc::new(ScriptedClient::new(vec![
        Script::StreamThenFail(
            chunked(&PlanBuilder::new().to_json(), 4)[..3].to_vec(),
            GenerationError::TransientCall("stream interrupted: connection reset".into()),
        ),
        Script::plan(PlanBuilder::new()),
    ]));
    let pipeline = pipeline(client.clone(), config());

    let candidate = pipeline
        .generate(PROJECT, request(), None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(client.call_count(), 2);
    assert_eq!(candidate.generation_status, GenerationStatus::Completed);
    assert_eq!(candidate.retry_count, 1);
    assert!(candidate.possibly_duplicated);
}

#[tokio::test]
async fn repeated_stream_resets_fail_as_interrupted() {
    let partial = chunked(&PlanBuilder::new().to_json(), 4)[..1].to_vec();
    let client = Arc::new(ScriptedClient::from_fn(move |_, _| {
        Script::StreamThenFail(
            partial.clone(),
            GenerationError::TransientCall("connection reset".into()),
        )
    }));
    let pipeline = pipeline(client.clone(), config());

    let err = pipeline
        .generate(PROJECT, request(), None, &CancellationToken::new())
        .await
        .unwrap_err();

    let PipelineError::GenerationFailed { kind, attempts, .. } = err else {
        panic!("expected generation failure, got {err:?}");
    };
    assert_eq!(kind, FailureKind::Interrupted);
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn fatal_error_fails_without_retry() {
    let client = Arc::new(ScriptedClient::new(vec![
        Script::Fail(GenerationError::FatalCall("HTTP 401: bad key".into())),
        Script::plan(PlanBuilder::new()),
    ]));
    let pipeline = pipeline(client.clone(), config());

    let err = pipeline
        .generate(PROJECT, request(), None, &CancellationToken::new())
        .await
        .unwrap_err();

    let PipelineError::GenerationFailed {
        candidate_id,
        kind,
        attempts,
        ..
    } = err
    else {
        panic!("expected GenerationFailed, got {err:?}");
    };
    assert_eq!(kind, FailureKind::FatalCall);
    assert_eq!(attempts, 1);
    assert_eq!(client.call_count(), 1);

    let stored = pipeline.lifecycle().get(candidate_id).await.unwrap();
    assert_eq!(stored.generation_status, GenerationStatus::Failed);
    let failure = stored.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::FatalCall);
    assert!(failure.message.contains("401"));
}

#[tokio::test]
async fn exhausted_retries_record_last_error() {
    let client = Arc::new(ScriptedClient::new(vec![
        truncated_plan(),
        truncated_plan(),
        Script::Complete("I cannot produce a layout for this land.".into()),
    ]));
    let pipeline = pipeline(client.clone(), config());

    let err = pipeline
        .generate(PROJECT, request(), None, &CancellationToken::new())
        .await
        .unwrap_err();

    let PipelineError::GenerationFailed {
        candidate_id,
        kind,
        attempts,
        ..
    } = err
    else {
        panic!("expected GenerationFailed, got {err:?}");
    };
    assert_eq!(kind, FailureKind::Malformed);
    assert_eq!(attempts, 3);

    let stored = pipeline.lifecycle().get(candidate_id).await.unwrap();
    assert_eq!(stored.retry_count, 2);
    assert!(stored.possibly_duplicated);
}

// ===========================================================================
// Timeout and cancellation
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn hung_call_times_out() {
    let client = Arc::new(ScriptedClient::new(vec![Script::Hang]));
    let pipeline = pipeline(
        client,
        PipelineConfig {
            attempt_timeout_secs: 5,
            retry: RetryPolicy {
                max_attempts: 1,
                ..config().retry
            },
            ..config()
        },
    );

    let err = pipeline
        .generate(PROJECT, request(), None, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            PipelineError::GenerationFailed {
                kind: FailureKind::Timeout,
                ..
            }
        ),
        "{err:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn timeout_is_retried_then_succeeds() {
    let client = Arc::new(ScriptedClient::new(vec![
        Script::Hang,
        Script::plan(PlanBuilder::new()),
    ]));
    let pipeline = pipeline(
        client,
        PipelineConfig {
            attempt_timeout_secs: 5,
            ..config()
        },
    );

    let candidate = pipeline
        .generate(PROJECT, request(), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(candidate.retry_count, 1);
    assert!(candidate.possibly_duplicated);
}

#[tokio::test(start_paused = true)]
async fn cancellation_marks_candidate_failed() {
    let client = Arc::new(ScriptedClient::new(vec![Script::Hang]));
    let pipeline = pipeline(client, config());
    let cancel = CancellationToken::new();

    let (result, ()) = tokio::join!(
        pipeline.generate(PROJECT, request(), None, &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    );

    let Err(PipelineError::Cancelled { candidate_id }) = result else {
        panic!("expected Cancelled, got {result:?}");
    };
    let stored = pipeline.lifecycle().get(candidate_id).await.unwrap();
    assert_eq!(stored.generation_status, GenerationStatus::Failed);
    assert_eq!(stored.failure.unwrap().kind, FailureKind::Cancelled);
}

#[tokio::test]
async fn cancelled_before_start_makes_no_call() {
    let client = Arc::new(ScriptedClient::new(vec![Script::plan(PlanBuilder::new())]));
    let pipeline = pipeline(client.clone(), config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = pipeline
        .generate(PROJECT, request(), None, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled { .. }), "{err:?}");
    assert_eq!(client.call_count(), 0);
    let pending = pipeline
        .lifecycle()
        .list(PROJECT)
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.generation_status == GenerationStatus::Pending)
        .count();
    assert_eq!(pending, 0);
}

// ===========================================================================
// Progress
// ===========================================================================

#[tokio::test]
async fn progress_events_follow_generation() {
    let client = Arc::new(ScriptedClient::new(vec![Script::plan(PlanBuilder::new())]));
    let (sink, mut rx) = ProgressSink::channel();
    let pipeline = pipeline(client, config()).with_progress(sink);

    let candidate = pipeline
        .generate(PROJECT, request(), None, &CancellationToken::new())
        .await
        .unwrap();

    let mut statuses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.candidate_id, Some(candidate.id));
        statuses.push(event.status);
    }
    assert_eq!(statuses.first(), Some(&ProgressStatus::Started));
    assert_eq!(statuses.last(), Some(&ProgressStatus::Completed));
    assert!(statuses.contains(&ProgressStatus::Processing));
    assert!(statuses.contains(&ProgressStatus::Validating));
}

// ===========================================================================
// Batch
// ===========================================================================

#[tokio::test]
async fn batch_keeps_index_order_and_survives_partial_failure() {
    let client = Arc::new(ScriptedClient::from_fn(|call, _| {
        if call.request.road_layout == Some(LayoutKind::Perimeter) {
            Script::Fail(GenerationError::FatalCall("HTTP 400".into()))
        } else {
            Script::plan(PlanBuilder::new().layout(call.request.road_layout.unwrap_or(LayoutKind::Grid)))
        }
    }));
    let pipeline = pipeline(client, config());

    let batch = pipeline
        .generate_batch(PROJECT, request(), 4, None, &CancellationToken::new())
        .await
        .unwrap();

    let indices: Vec<u32> = batch.variants.iter().map(|v| v.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(batch.completed().count(), 3);
    let failed: Vec<u32> = batch.failed().map(|(i, _)| i).collect();
    assert_eq!(failed, vec![1]);

    for c in batch.completed() {
        assert_eq!(c.batch_id, Some(batch.batch_id));
    }
    assert_eq!(batch.rankings.len(), 3);
    let ranks: Vec<u32> = batch.rankings.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);
}

#[tokio::test]
async fn batch_variants_differ_in_layout() {
    let client = Arc::new(ScriptedClient::always(PlanBuilder::new()));
    let pipeline = pipeline(client.clone(), config());

    pipeline
        .generate_batch(PROJECT, request(), 4, None, &CancellationToken::new())
        .await
        .unwrap();

    let mut layouts: Vec<_> = client
        .calls()
        .iter()
        .map(|c| c.request.road_layout)
        .collect();
    layouts.sort_by_key(|l| l.map(|l| l.to_string()));
    layouts.dedup();
    assert_eq!(layouts.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn batch_fan_out_is_bounded() {
    let client = Arc::new(
        ScriptedClient::always(PlanBuilder::new()).with_delay(Duration::from_millis(100)),
    );
    let pipeline = pipeline(
        client.clone(),
        PipelineConfig {
            fan_out: 2,
            ..config()
        },
    );

    let batch = pipeline
        .generate_batch(PROJECT, request(), 5, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(batch.completed().count(), 5);
    assert_eq!(client.max_in_flight(), 2);
}

#[tokio::test(start_paused = true)]
async fn batch_shares_one_rate_limit_budget() {
    let client = Arc::new(ScriptedClient::always(PlanBuilder::new()));
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        max_requests: 2,
        window_secs: 60,
        daily_quota: None,
        mode: AcquireMode::Block,
    }));
    let pipeline = pipeline(
        client.clone(),
        PipelineConfig {
            fan_out: 4,
            ..config()
        },
    )
    .with_limiter(limiter.clone());

    let started = tokio::time::Instant::now();
    let batch = pipeline
        .generate_batch(PROJECT, request(), 4, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(batch.completed().count(), 4);
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(limiter.in_window("scripted") <= 2);
}

#[tokio::test(start_paused = true)]
async fn zero_request_budget_fails_the_candidate() {
    let client = Arc::new(ScriptedClient::always(PlanBuilder::new()));
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        max_requests: 0,
        window_secs: 60,
        daily_quota: None,
        mode: AcquireMode::Block,
    }));
    let pipeline = pipeline(client.clone(), config()).with_limiter(limiter);

    let err = tokio::time::timeout(
        Duration::from_secs(3600),
        pipeline.generate(PROJECT, request(), None, &CancellationToken::new()),
    )
    .await
    .expect("generation must not wait on an empty budget")
    .unwrap_err();

    let PipelineError::GenerationFailed {
        candidate_id, kind, ..
    } = err
    else {
        panic!("expected GenerationFailed, got {err:?}");
    };
    assert_eq!(kind, FailureKind::FatalCall);
    assert_eq!(client.call_count(), 0);
    let stored = pipeline.lifecycle().get(candidate_id).await.unwrap();
    assert_eq!(stored.generation_status, GenerationStatus::Failed);
}

#[tokio::test]
async fn zero_variant_batch_is_rejected() {
    let client = Arc::new(ScriptedClient::new(vec![]));
    let pipeline = pipeline(client, config());

    let err = pipeline
        .generate_batch(PROJECT, request(), 0, None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));
}

// ===========================================================================
// Regenerate
// ===========================================================================

#[tokio::test]
async fn regenerate_reuses_stored_parameters() {
    let client = Arc::new(ScriptedClient::always(PlanBuilder::new()));
    let pipeline = pipeline(client.clone(), config());
    let request = GenerationRequest {
        target_lots: Some(6),
        road_layout: Some(LayoutKind::Loop),
        ..request()
    };

    let source = pipeline
        .generate(
            PROJECT,
            request,
            Some(Strategy::LargerLots),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let again = pipeline
        .regenerate(source.id, &CancellationToken::new())
        .await
        .unwrap();

    assert_ne!(again.id, source.id);
    assert_eq!(again.request, source.request);
    assert_eq!(again.prompt_fingerprint, source.prompt_fingerprint);

    let calls = client.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].prompt, calls[1].prompt);

    let unchanged = pipeline.lifecycle().get(source.id).await.unwrap();
    assert_eq!(unchanged, source);
}

#[tokio::test]
async fn regenerate_unknown_candidate_is_not_found() {
    let client = Arc::new(ScriptedClient::new(vec![]));
    let pipeline = pipeline(client, config());

    let err = pipeline
        .regenerate(uuid::Uuid::new_v4(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Lifecycle(_)), "{err:?}");
}
