//! `subdiv list`, `subdiv show` and `subdiv rank`.

use anyhow::{Context, Result};
use uuid::Uuid;

use subdiv_core::Pipeline;
use subdiv_core::rank::Ranking;
use subdiv_db::models::{Activation, Candidate, GenerationStatus, ValidationStatus};

pub async fn run_list(pipeline: &Pipeline, project: &str) -> Result<()> {
    let mut candidates = pipeline.lifecycle().list(project).await?;
    if candidates.is_empty() {
        println!("No candidates for project {project}.");
        return Ok(());
    }
    candidates.sort_by_key(|c| c.created_at);

    println!(
        "{:<3} {:<36} {:<10} {:<9} {:>5} {:<8} {:<19}",
        "", "ID", "STATUS", "CHECK", "LOTS", "STATE", "CREATED"
    );
    println!("{}", "-".repeat(96));
    for c in &candidates {
        println!("{}", list_line(c));
    }
    Ok(())
}

pub async fn run_show(pipeline: &Pipeline, id: Uuid, json: bool) -> Result<()> {
    let candidate = pipeline.lifecycle().get(id).await?;
    if json {
        let out =
            serde_json::to_string_pretty(&candidate).context("failed to encode candidate")?;
        println!("{out}");
        return Ok(());
    }

    print_summary(&candidate);
    println!("Created: {}", candidate.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(batch) = candidate.batch_id {
        let index = candidate
            .variant_index
            .map(|i| format!(" (variant {i})"))
            .unwrap_or_default();
        println!("Batch: {batch}{index}");
    }

    let r = &candidate.request;
    println!();
    println!(
        "Land: {} x {} m, {} sqm, {}% amenities",
        r.land_width, r.land_length, r.land_area, r.amenity_percent
    );
    if let Some(strategy) = r.strategy {
        println!("Strategy: {strategy}");
    }
    if let Some(layout) = r.road_layout {
        println!("Requested layout: {layout}");
    }

    if let Some(plan) = &candidate.plan {
        println!();
        println!(
            "Lots: {} ({} viable), average {:.1} sqm, utilization {:.1}%",
            plan.lots.len(),
            plan.computed_viable_lots(),
            plan.metrics.average_lot_area,
            plan.metrics.land_utilization_percent
        );
        println!(
            "Road: {} layout, {} m wide, {:.1} sqm",
            plan.road_network.layout, plan.road_network.width, plan.road_network.total_area
        );
        for amenity in &plan.amenities {
            println!("Amenity: {} {:.1} sqm", amenity.kind, amenity.area);
        }
    }

    print_messages("Errors", &candidate.validation_errors);
    print_messages("Warnings", &candidate.validation_warnings);

    println!();
    println!(
        "Usage: {} in / {} out tokens, retries {}, {}",
        candidate.usage.input_tokens,
        candidate.usage.output_tokens,
        candidate.retry_count,
        candidate
            .duration_ms
            .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string())
    );
    if let Some(cost) = candidate.estimated_cost {
        println!("Estimated cost: ${cost:.4}");
    }
    if candidate.possibly_duplicated {
        println!("Note: a retried attempt may also have been billed.");
    }
    Ok(())
}

pub async fn run_rank(
    pipeline: &Pipeline,
    project: &str,
    price_per_area: Option<f64>,
    json: bool,
) -> Result<()> {
    let price = price_per_area.or(pipeline.config().price_per_area);
    let rankings = pipeline.rank_project_priced(project, price).await?;
    if json {
        let out = serde_json::to_string_pretty(&rankings).context("failed to encode rankings")?;
        println!("{out}");
        return Ok(());
    }
    if rankings.is_empty() {
        println!("No completed candidates for project {project}.");
        return Ok(());
    }
    print_rankings(&rankings);
    Ok(())
}

// -----------------------------------------------------------------------
// Formatting
// -----------------------------------------------------------------------

/// Short multi-line description printed after generation and by `show`.
pub fn print_summary(c: &Candidate) {
    println!("Candidate: {} ({})", c.id, c.project_id);
    println!("Status: {}", c.generation_status);
    if let Some(status) = c.validation_status {
        println!("Validation: {status}");
    }
    if c.approved {
        let at = c
            .approved_at
            .map(|t| format!(" at {}", t.format("%Y-%m-%d %H:%M:%S UTC")))
            .unwrap_or_default();
        println!("Approved{at}");
    }
    if c.activation != Activation::Inactive {
        println!("Activation: {}", c.activation);
    }
    if let Some(reason) = &c.rejection_reason {
        println!("Rejection reason: {reason}");
    }
    if let Some(failure) = &c.failure {
        println!(
            "Failure: {} after {} attempt(s): {}",
            failure.kind, failure.attempts, failure.message
        );
    }
    if let Some(plan) = &c.plan {
        println!(
            "Lots: {} ({} viable)",
            plan.lots.len(),
            plan.computed_viable_lots()
        );
    }
}

pub fn print_rankings(rankings: &[Ranking]) {
    println!(
        "{:<4} {:<36} {:>7} {:>5} {:>7} {:>6}  NOTES",
        "RANK", "CANDIDATE", "SCORE", "LOTS", "UTIL%", "ROAD%"
    );
    println!("{}", "-".repeat(96));
    for r in rankings {
        println!("{}", ranking_line(r));
        if let Some(revenue) = r.estimated_revenue {
            println!("{:<41} est. revenue {revenue:.0}", "");
        }
    }
}

fn list_line(c: &Candidate) -> String {
    format!(
        "[{}] {:<36} {:<10} {:<9} {:>5} {:<8} {}",
        status_icon(c),
        c.id,
        c.generation_status.to_string(),
        c.validation_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string()),
        c.plan
            .as_ref()
            .map(|p| p.lots.len().to_string())
            .unwrap_or_else(|| "-".to_string()),
        c.activation.to_string(),
        c.created_at.format("%Y-%m-%d %H:%M:%S"),
    )
}

fn ranking_line(r: &Ranking) -> String {
    let mut notes: Vec<String> = r.highlights.iter().map(|h| format!("+ {h}")).collect();
    notes.extend(r.concerns.iter().map(|c| format!("- {c}")));
    format!(
        "{:<4} {:<36} {:>7.2} {:>5} {:>7.1} {:>6.1}  {}",
        r.rank,
        r.candidate_id,
        r.score,
        r.metrics.viable_lots,
        r.metrics.land_utilization_percent,
        r.metrics.road_area_percent,
        notes.join(", ")
    )
}

fn status_icon(c: &Candidate) -> char {
    match (c.generation_status, c.activation) {
        (_, Activation::Active) => '*',
        (_, Activation::Archived) => '~',
        (GenerationStatus::Pending, _) => '.',
        (GenerationStatus::Failed, _) => '!',
        (GenerationStatus::Rejected, _) => 'x',
        (GenerationStatus::Completed, _) if c.approved => '+',
        (GenerationStatus::Completed, _) => match c.validation_status {
            Some(ValidationStatus::Invalid) => '?',
            _ => ' ',
        },
    }
}

fn print_messages(title: &str, messages: &[String]) {
    if messages.is_empty() {
        return;
    }
    println!();
    println!("{title}:");
    for m in messages {
        println!("  - {m}");
    }
}
