//! `subdiv prompt`, `subdiv generate` and `subdiv regenerate`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use subdiv_core::PipelineError;
use subdiv_core::progress::{ProgressEvent, ProgressSink, ProgressStatus};
use subdiv_core::prompt::{build_prompt, prompt_fingerprint};

use crate::LandArgs;
use crate::candidate_cmds::{print_rankings, print_summary};
use crate::config::SubdivConfig;

/// Print the exact prompt and its fingerprint.
pub fn run_prompt(land: &LandArgs) -> Result<()> {
    let request = land.to_request()?;
    let prompt = build_prompt(&request, None);
    println!("{prompt}");
    println!();
    println!("fingerprint: {}", prompt_fingerprint(&prompt));
    Ok(())
}

pub async fn run_generate(
    resolved: &SubdivConfig,
    project: &str,
    land: &LandArgs,
    variants: u32,
) -> Result<()> {
    let request = land.to_request()?;
    let (sink, drain) = spawn_progress_drain();
    let pipeline = crate::build_pipeline(resolved, sink).await?;
    let cancel = cancel_on_ctrl_c();

    if variants <= 1 {
        let result = pipeline.generate(project, request, None, &cancel).await;
        drop(pipeline);
        drain.await.ok();
        let candidate = result.map_err(explain)?;
        print_summary(&candidate);
        return Ok(());
    }

    let result = pipeline
        .generate_batch(project, request, variants, None, &cancel)
        .await;
    drop(pipeline);
    drain.await.ok();
    let batch = result.map_err(explain)?;

    println!("Batch {}", batch.batch_id);
    for variant in &batch.variants {
        let layout = variant
            .request
            .road_layout
            .map(|l| l.to_string())
            .unwrap_or_else(|| "-".to_string());
        match &variant.result {
            Ok(c) => println!(
                "  [{}] {} {:<14} {} ({} lots)",
                variant.index,
                c.id,
                layout,
                c.validation_status
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
                c.plan.as_ref().map_or(0, |p| p.lots.len()),
            ),
            Err(e) => println!("  [{}] {layout:<14} failed: {e}", variant.index),
        }
    }
    println!();
    print_rankings(&batch.rankings);

    if batch.completed().next().is_none() {
        bail!("every variant in batch {} failed", batch.batch_id);
    }
    Ok(())
}

pub async fn run_regenerate(resolved: &SubdivConfig, candidate_id: Uuid) -> Result<()> {
    let (sink, drain) = spawn_progress_drain();
    let pipeline = crate::build_pipeline(resolved, sink).await?;
    let cancel = cancel_on_ctrl_c();

    let result = pipeline.regenerate(candidate_id, &cancel).await;
    drop(pipeline);
    drain.await.ok();

    let candidate = result.map_err(explain)?;
    println!("Regenerated from {candidate_id}:");
    print_summary(&candidate);
    Ok(())
}

// -----------------------------------------------------------------------
// Plumbing
// -----------------------------------------------------------------------

/// First Ctrl+C cancels in-flight generation, second force-exits.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nCancelling generation (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });
    cancel
}

/// Log progress events until every sender is dropped.
fn spawn_progress_drain() -> (ProgressSink, JoinHandle<()>) {
    let (sink, rx) = ProgressSink::channel();
    let handle = tokio::spawn(async move {
        let mut events = UnboundedReceiverStream::new(rx);
        while let Some(event) = events.next().await {
            log_event(&event);
        }
    });
    (sink, handle)
}

fn log_event(event: &ProgressEvent) {
    let candidate = event.candidate_id.map(|id| id.to_string());
    match event.status {
        // One per received chunk; too chatty for info.
        ProgressStatus::Processing if event.message.starts_with("received") => {
            tracing::debug!(
                candidate_id = candidate.as_deref(),
                variant = event.variant_index,
                attempt = event.attempt,
                "{}",
                event.message
            );
        }
        ProgressStatus::Failed => {
            tracing::warn!(
                status = %event.status,
                candidate_id = candidate.as_deref(),
                variant = event.variant_index,
                attempt = event.attempt,
                "{}",
                event.message
            );
        }
        _ => {
            tracing::info!(
                status = %event.status,
                candidate_id = candidate.as_deref(),
                variant = event.variant_index,
                attempt = event.attempt,
                "{}",
                event.message
            );
        }
    }
}

fn explain(e: PipelineError) -> anyhow::Error {
    match e {
        PipelineError::Cancelled { candidate_id } => {
            anyhow::anyhow!("generation cancelled; candidate {candidate_id} marked failed")
        }
        other => other.into(),
    }
}
