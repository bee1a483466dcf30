//! Persistence boundary for candidates.
//!
//! The pipeline assumes nothing about the storage engine beyond the
//! [`CandidateStore`] trait. Two implementations ship with the crate:
//! [`MemoryStore`] for in-process use and tests, and [`JsonFileStore`]
//! which keeps the whole dataset in one JSON document on disk.

mod json_file;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Candidate;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

/// Errors surfaced by a [`CandidateStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("candidate {0} not found")]
    NotFound(Uuid),

    #[error("candidate {candidate_id} belongs to project {actual:?}, not {expected:?}")]
    ProjectMismatch {
        candidate_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Row store for candidates plus the per-project active pointer.
///
/// Implementations must be safe to share between tasks. They are not
/// responsible for enforcing lifecycle rules; that is the lifecycle
/// manager's job.
#[async_trait]
pub trait CandidateStore: Send + Sync {
    /// Insert or replace a candidate by id.
    async fn save(&self, candidate: &Candidate) -> Result<(), StoreError>;

    async fn load_by_id(&self, id: Uuid) -> Result<Option<Candidate>, StoreError>;

    /// All candidates of a project, in insertion order.
    async fn list_by_project(&self, project_id: &str) -> Result<Vec<Candidate>, StoreError>;

    /// Point the project's active pointer at `candidate_id`, or clear it.
    async fn set_active(
        &self,
        project_id: &str,
        candidate_id: Option<Uuid>,
    ) -> Result<(), StoreError>;

    async fn active_for_project(&self, project_id: &str) -> Result<Option<Uuid>, StoreError>;
}

/// Serializable contents shared by the bundled stores.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Snapshot {
    /// Insertion-ordered candidate rows.
    candidates: Vec<Candidate>,
    /// project id -> active candidate id
    active: BTreeMap<String, Uuid>,
}

impl Snapshot {
    fn save(&mut self, candidate: &Candidate) {
        match self.candidates.iter_mut().find(|c| c.id == candidate.id) {
            Some(existing) => *existing = candidate.clone(),
            None => self.candidates.push(candidate.clone()),
        }
    }

    fn load(&self, id: Uuid) -> Option<Candidate> {
        self.candidates.iter().find(|c| c.id == id).cloned()
    }

    fn list(&self, project_id: &str) -> Vec<Candidate> {
        self.candidates
            .iter()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect()
    }

    fn set_active(&mut self, project_id: &str, candidate_id: Option<Uuid>) -> Result<(), StoreError> {
        match candidate_id {
            Some(id) => {
                let candidate = self
                    .candidates
                    .iter()
                    .find(|c| c.id == id)
                    .ok_or(StoreError::NotFound(id))?;
                if candidate.project_id != project_id {
                    return Err(StoreError::ProjectMismatch {
                        candidate_id: id,
                        expected: project_id.to_owned(),
                        actual: candidate.project_id.clone(),
                    });
                }
                self.active.insert(project_id.to_owned(), id);
            }
            None => {
                self.active.remove(project_id);
            }
        }
        Ok(())
    }
}
