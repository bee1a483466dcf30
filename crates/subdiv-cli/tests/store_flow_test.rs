//! The command-line flow across separate invocations: each step reopens the
//! JSON candidate store, as the `subdiv` binary does, and drives the
//! offline demo backend.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use subdiv_core::client::DemoClient;
use subdiv_core::{LifecycleManager, Pipeline, PipelineConfig};
use subdiv_db::models::{Activation, GenerationRequest, GenerationStatus, ValidationStatus};
use subdiv_db::store::JsonFileStore;

async fn open(path: &Path) -> Pipeline {
    let store = JsonFileStore::open(path).await.unwrap();
    let lifecycle = Arc::new(LifecycleManager::new(Arc::new(store)));
    Pipeline::new(
        Arc::new(DemoClient::new()),
        lifecycle,
        PipelineConfig::default(),
    )
}

#[tokio::test]
async fn generate_then_select_in_later_invocation() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("candidates.json");
    let request = GenerationRequest::new(40.0, 60.0, 10.0);

    // `subdiv generate lakeside --variants 3`
    let batch = {
        let pipeline = open(&path).await;
        pipeline
            .generate_batch("lakeside", request, 3, None, &CancellationToken::new())
            .await
            .unwrap()
    };
    assert_eq!(batch.completed().count(), 3);
    for c in batch.completed() {
        assert_eq!(c.validation_status, Some(ValidationStatus::Valid));
    }

    // `subdiv rank lakeside`
    let winner = {
        let pipeline = open(&path).await;
        let rankings = pipeline.rank_project("lakeside").await.unwrap();
        assert_eq!(rankings.len(), 3);
        rankings[0].candidate_id
    };

    // `subdiv select <winner>`
    {
        let pipeline = open(&path).await;
        let selection = pipeline.select(winner).await.unwrap();
        assert_eq!(selection.archived_siblings.len(), 2);
    }

    // `subdiv list lakeside`
    let pipeline = open(&path).await;
    let lifecycle = pipeline.lifecycle();
    let active = lifecycle.active("lakeside").await.unwrap().unwrap();
    assert_eq!(active.id, winner);
    assert!(active.approved);

    let archived = lifecycle
        .list("lakeside")
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.activation == Activation::Archived)
        .count();
    assert_eq!(archived, 2);
}

#[tokio::test]
async fn regenerate_after_reopen_keeps_source() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("nested").join("candidates.json");

    let source = {
        let pipeline = open(&path).await;
        pipeline
            .generate(
                "hilltop",
                GenerationRequest::new(30.0, 45.0, 12.0),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    };

    let pipeline = open(&path).await;
    let fresh = pipeline
        .regenerate(source.id, &CancellationToken::new())
        .await
        .unwrap();

    assert_ne!(fresh.id, source.id);
    assert_eq!(fresh.request, source.request);
    assert_eq!(fresh.generation_status, GenerationStatus::Completed);
    // Demo output is deterministic for the same parameters.
    assert_eq!(fresh.plan, source.plan);
    assert_eq!(pipeline.lifecycle().list("hilltop").await.unwrap().len(), 2);
}

#[tokio::test]
async fn rejection_reason_survives_reopen() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("candidates.json");

    let id = {
        let pipeline = open(&path).await;
        let c = pipeline
            .generate(
                "meadow",
                GenerationRequest::new(40.0, 60.0, 10.0),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        pipeline
            .lifecycle()
            .reject(c.id, Some("access road on the wrong side".into()))
            .await
            .unwrap();
        c.id
    };

    let pipeline = open(&path).await;
    let c = pipeline.lifecycle().get(id).await.unwrap();
    assert_eq!(c.generation_status, GenerationStatus::Rejected);
    assert_eq!(
        c.rejection_reason.as_deref(),
        Some("access road on the wrong side")
    );
}
