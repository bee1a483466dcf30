//! Candidate lifecycle: the only writer of status, approval and activation
//! fields.
//!
//! ```text
//! pending   -> completed
//! pending   -> failed
//! completed -> rejected          (unapproved only; terminal)
//! completed + approve            (guarded by validation errors)
//! approved  -> active            (previous active -> archived)
//! archived  -> active            (restore; approved candidates only)
//! any non-pending -> archived
//! ```
//!
//! Transitions for one project are serialized by a per-project lock, so the
//! "at most one active candidate" rule holds under concurrent callers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use subdiv_db::models::{
    Activation, Candidate, FailureInfo, GeneratedPlan, GenerationStatus, TokenUsage,
    ValidationStatus,
};
use subdiv_db::store::{CandidateStore, StoreError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::validate::ValidationReport;

/// Maximum length (chars) of a rejection reason.
pub const MAX_REASON_CHARS: usize = 500;

/// A lifecycle operation, named in transition errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Complete,
    Fail,
    Approve,
    Reject,
    Activate,
    Archive,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Activate => "activate",
            Self::Archive => "archive",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("candidate {0} not found")]
    NotFound(Uuid),

    #[error("cannot approve candidate {candidate_id}: {}", .errors.join("; "))]
    CannotApprove {
        candidate_id: Uuid,
        /// The validation errors blocking approval.
        errors: Vec<String>,
    },

    #[error("cannot {action} candidate {candidate_id} in state {state}")]
    InvalidTransition {
        candidate_id: Uuid,
        action: Action,
        state: String,
    },

    #[error("rejection reason is {len} characters (max {max})")]
    ReasonTooLong { len: usize, max: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Check whether `from -> to` is an edge of the generation status graph.
pub fn is_valid_transition(from: GenerationStatus, to: GenerationStatus) -> bool {
    matches!(
        (from, to),
        (GenerationStatus::Pending, GenerationStatus::Completed)
            | (GenerationStatus::Pending, GenerationStatus::Failed)
            | (GenerationStatus::Completed, GenerationStatus::Rejected)
    )
}

/// Everything recorded on a candidate when its generation succeeds.
#[derive(Debug, Clone)]
pub struct CompletedGeneration {
    pub plan: GeneratedPlan,
    pub report: ValidationReport,
    pub usage: TokenUsage,
    pub estimated_cost: Option<f64>,
    pub duration: Duration,
    pub attempts: u32,
    pub possibly_duplicated: bool,
}

/// Outcome of [`LifecycleManager::select`].
#[derive(Debug, Clone)]
pub struct Selection {
    pub selected: Candidate,
    /// The candidate that was active before, now archived.
    pub previously_active: Option<Uuid>,
    /// Batch siblings archived by the selection.
    pub archived_siblings: Vec<Uuid>,
}

pub struct LifecycleManager {
    store: Arc<dyn CandidateStore>,
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("projects_locked", &self.locks.lock().len())
            .finish()
    }
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn CandidateStore>) -> Self {
        Self {
            store,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CandidateStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: Uuid) -> Result<Candidate, LifecycleError> {
        self.store
            .load_by_id(id)
            .await?
            .ok_or(LifecycleError::NotFound(id))
    }

    pub async fn list(&self, project_id: &str) -> Result<Vec<Candidate>, LifecycleError> {
        Ok(self.store.list_by_project(project_id).await?)
    }

    pub async fn active(&self, project_id: &str) -> Result<Option<Candidate>, LifecycleError> {
        match self.store.active_for_project(project_id).await? {
            Some(id) => Ok(self.store.load_by_id(id).await?),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Generation outcome
    // -----------------------------------------------------------------------

    /// Persist a freshly built `pending` candidate.
    pub async fn create_pending(&self, candidate: Candidate) -> Result<Candidate, LifecycleError> {
        if candidate.generation_status != GenerationStatus::Pending {
            return Err(invalid(&candidate, Action::Create));
        }
        self.store.save(&candidate).await?;
        tracing::debug!(
            candidate_id = %candidate.id,
            project_id = %candidate.project_id,
            "pending candidate created"
        );
        Ok(candidate)
    }

    /// `pending -> completed`, attaching the plan and its validation report.
    pub async fn complete(
        &self,
        id: Uuid,
        outcome: CompletedGeneration,
    ) -> Result<Candidate, LifecycleError> {
        let (mut c, _guard) = self.load_locked(id).await?;
        if !is_valid_transition(c.generation_status, GenerationStatus::Completed) {
            return Err(invalid(&c, Action::Complete));
        }

        let status = outcome.report.status();
        c.generation_status = GenerationStatus::Completed;
        c.validation_status = Some(status);
        c.validation_errors = outcome.report.error_messages();
        c.validation_warnings = outcome.report.warning_messages();
        c.plan = Some(outcome.plan);
        c.usage = outcome.usage;
        c.estimated_cost = outcome.estimated_cost;
        c.duration_ms = Some(outcome.duration.as_millis() as u64);
        c.retry_count = outcome.attempts.saturating_sub(1);
        c.possibly_duplicated = outcome.possibly_duplicated;
        c.updated_at = Utc::now();
        self.store.save(&c).await?;

        tracing::info!(
            candidate_id = %c.id,
            validation = %status,
            errors = c.validation_errors.len(),
            warnings = c.validation_warnings.len(),
            "candidate completed"
        );
        Ok(c)
    }

    /// `pending -> failed`. Used for cancellation too, so no pending
    /// candidate is ever left without a future transition.
    pub async fn fail(
        &self,
        id: Uuid,
        failure: FailureInfo,
        possibly_duplicated: bool,
    ) -> Result<Candidate, LifecycleError> {
        let (mut c, _guard) = self.load_locked(id).await?;
        if !is_valid_transition(c.generation_status, GenerationStatus::Failed) {
            return Err(invalid(&c, Action::Fail));
        }

        c.generation_status = GenerationStatus::Failed;
        c.retry_count = failure.attempts.saturating_sub(1);
        c.possibly_duplicated = possibly_duplicated;
        c.failure = Some(failure);
        c.updated_at = Utc::now();
        self.store.save(&c).await?;

        if let Some(f) = &c.failure {
            tracing::warn!(
                candidate_id = %c.id,
                kind = %f.kind,
                attempts = f.attempts,
                "candidate failed: {}",
                f.message
            );
        }
        Ok(c)
    }

    // -----------------------------------------------------------------------
    // Review
    // -----------------------------------------------------------------------

    /// Approve a completed candidate. Blocked by validation errors; the
    /// candidate is left untouched when the guard trips.
    pub async fn approve(&self, id: Uuid) -> Result<Candidate, LifecycleError> {
        let (c, _guard) = self.load_locked(id).await?;
        self.approve_locked(c).await
    }

    pub async fn reject(
        &self,
        id: Uuid,
        reason: Option<String>,
    ) -> Result<Candidate, LifecycleError> {
        if let Some(r) = &reason {
            let len = r.chars().count();
            if len > MAX_REASON_CHARS {
                return Err(LifecycleError::ReasonTooLong {
                    len,
                    max: MAX_REASON_CHARS,
                });
            }
        }

        let (mut c, _guard) = self.load_locked(id).await?;
        if c.approved || !is_valid_transition(c.generation_status, GenerationStatus::Rejected) {
            return Err(invalid(&c, Action::Reject));
        }

        c.generation_status = GenerationStatus::Rejected;
        c.rejection_reason = reason;
        c.updated_at = Utc::now();
        self.store.save(&c).await?;

        tracing::info!(candidate_id = %c.id, "candidate rejected");
        Ok(c)
    }

    // -----------------------------------------------------------------------
    // Activation
    // -----------------------------------------------------------------------

    /// Make an approved candidate the project's active plan, archiving the
    /// previously active one. Also restores archived candidates.
    pub async fn activate(&self, id: Uuid) -> Result<Candidate, LifecycleError> {
        let (c, _guard) = self.load_locked(id).await?;
        let (activated, _) = self.activate_locked(c).await?;
        Ok(activated)
    }

    /// Take a candidate out of service without deleting it.
    pub async fn archive(&self, id: Uuid) -> Result<Candidate, LifecycleError> {
        let (mut c, _guard) = self.load_locked(id).await?;
        match (c.generation_status, c.activation) {
            (GenerationStatus::Pending, _) => return Err(invalid(&c, Action::Archive)),
            (_, Activation::Archived) => return Ok(c),
            (_, Activation::Active) => {
                self.store.set_active(&c.project_id, None).await?;
            }
            (_, Activation::Inactive) => {}
        }

        c.activation = Activation::Archived;
        c.updated_at = Utc::now();
        self.store.save(&c).await?;

        tracing::info!(candidate_id = %c.id, project_id = %c.project_id, "candidate archived");
        Ok(c)
    }

    /// Approve (if needed) and activate a candidate, then archive every
    /// other completed, unrejected, inactive member of its batch.
    pub async fn select(&self, id: Uuid) -> Result<Selection, LifecycleError> {
        let (c, _guard) = self.load_locked(id).await?;
        let c = if c.approved {
            c
        } else {
            self.approve_locked(c).await?
        };
        let (selected, previously_active) = self.activate_locked(c).await?;

        let mut archived_siblings = Vec::new();
        if let Some(batch_id) = selected.batch_id {
            for mut sibling in self.store.list_by_project(&selected.project_id).await? {
                if sibling.id == selected.id
                    || sibling.batch_id != Some(batch_id)
                    || sibling.generation_status != GenerationStatus::Completed
                    || sibling.activation != Activation::Inactive
                {
                    continue;
                }
                sibling.activation = Activation::Archived;
                sibling.updated_at = Utc::now();
                self.store.save(&sibling).await?;
                archived_siblings.push(sibling.id);
            }
        }

        tracing::info!(
            candidate_id = %selected.id,
            archived = archived_siblings.len(),
            "candidate selected"
        );
        Ok(Selection {
            selected,
            previously_active,
            archived_siblings,
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Per-project activation lock. Entries nobody holds or waits on are
    /// dropped here, so the map tracks only projects in use.
    fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(project_id.to_owned()).or_default().clone()
    }

    /// Take the candidate's project lock, then load the current row under it.
    async fn load_locked(&self, id: Uuid) -> Result<(Candidate, OwnedMutexGuard<()>), LifecycleError> {
        let project_id = self.get(id).await?.project_id;
        let guard = self.project_lock(&project_id).lock_owned().await;
        let c = self.get(id).await?;
        Ok((c, guard))
    }

    async fn approve_locked(&self, mut c: Candidate) -> Result<Candidate, LifecycleError> {
        if c.generation_status != GenerationStatus::Completed || c.approved {
            return Err(invalid(&c, Action::Approve));
        }
        match c.validation_status {
            Some(ValidationStatus::Valid | ValidationStatus::Warnings) => {}
            Some(ValidationStatus::Invalid) | None => {
                tracing::info!(
                    candidate_id = %c.id,
                    errors = c.validation_errors.len(),
                    "approval blocked by validation errors"
                );
                return Err(LifecycleError::CannotApprove {
                    candidate_id: c.id,
                    errors: c.validation_errors.clone(),
                });
            }
        }

        let now = Utc::now();
        c.approved = true;
        c.approved_at = Some(now);
        c.updated_at = now;
        self.store.save(&c).await?;

        tracing::info!(candidate_id = %c.id, "candidate approved");
        Ok(c)
    }

    /// Returns the activated candidate and the id of the one it displaced.
    async fn activate_locked(
        &self,
        mut c: Candidate,
    ) -> Result<(Candidate, Option<Uuid>), LifecycleError> {
        if c.generation_status != GenerationStatus::Completed || !c.approved {
            return Err(invalid(&c, Action::Activate));
        }
        if c.activation == Activation::Active {
            return Ok((c, None));
        }

        // The pointer must never name an archived row: move it first,
        // archive the displaced candidate last.
        let prev_id = self
            .store
            .active_for_project(&c.project_id)
            .await?
            .filter(|prev| *prev != c.id);
        self.store.set_active(&c.project_id, Some(c.id)).await?;

        let restored = c.activation == Activation::Archived;
        c.activation = Activation::Active;
        c.updated_at = Utc::now();
        if let Err(e) = self.store.save(&c).await {
            self.store.set_active(&c.project_id, prev_id).await?;
            return Err(e.into());
        }

        let mut displaced = None;
        if let Some(prev_id) = prev_id {
            if let Some(mut prev) = self.store.load_by_id(prev_id).await? {
                prev.activation = Activation::Archived;
                prev.updated_at = Utc::now();
                self.store.save(&prev).await?;
                displaced = Some(prev_id);
            }
        }

        tracing::info!(
            candidate_id = %c.id,
            project_id = %c.project_id,
            restored,
            archived = ?displaced,
            "candidate activated"
        );
        Ok((c, displaced))
    }
}

fn invalid(c: &Candidate, action: Action) -> LifecycleError {
    LifecycleError::InvalidTransition {
        candidate_id: c.id,
        action,
        state: describe_state(c),
    }
}

fn describe_state(c: &Candidate) -> String {
    let mut state = c.generation_status.to_string();
    if c.approved {
        state.push_str(", approved");
    }
    if c.activation != Activation::Inactive {
        state.push_str(&format!(", {}", c.activation));
    }
    state
}
