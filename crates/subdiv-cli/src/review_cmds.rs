//! Review commands: approve, reject, activate, select, archive.

use anyhow::Result;
use uuid::Uuid;

use subdiv_core::Pipeline;

pub async fn run_approve(pipeline: &Pipeline, id: Uuid) -> Result<()> {
    let c = pipeline.lifecycle().approve(id).await?;
    println!("Candidate {} approved.", c.id);
    if !c.validation_warnings.is_empty() {
        println!("  with {} warning(s):", c.validation_warnings.len());
        for w in &c.validation_warnings {
            println!("  - {w}");
        }
    }
    Ok(())
}

pub async fn run_reject(pipeline: &Pipeline, id: Uuid, reason: Option<String>) -> Result<()> {
    let c = pipeline.lifecycle().reject(id, reason).await?;
    match &c.rejection_reason {
        Some(reason) => println!("Candidate {} rejected: {reason}", c.id),
        None => println!("Candidate {} rejected.", c.id),
    }
    Ok(())
}

pub async fn run_activate(pipeline: &Pipeline, id: Uuid) -> Result<()> {
    let c = pipeline.lifecycle().activate(id).await?;
    println!(
        "Candidate {} is now the active plan for project {}.",
        c.id, c.project_id
    );
    Ok(())
}

pub async fn run_select(pipeline: &Pipeline, id: Uuid) -> Result<()> {
    let selection = pipeline.select(id).await?;
    let c = &selection.selected;
    println!(
        "Candidate {} selected for project {}.",
        c.id, c.project_id
    );
    if let Some(prev) = selection.previously_active {
        println!("  previously active {prev} archived");
    }
    for sibling in &selection.archived_siblings {
        println!("  batch sibling {sibling} archived");
    }
    Ok(())
}

pub async fn run_archive(pipeline: &Pipeline, id: Uuid) -> Result<()> {
    let c = pipeline.lifecycle().archive(id).await?;
    println!("Candidate {} archived.", c.id);
    Ok(())
}
