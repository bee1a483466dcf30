use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{CandidateStore, Snapshot, StoreError};
use crate::models::Candidate;

/// [`CandidateStore`] backed by a single JSON document.
///
/// The document is loaded once on [`JsonFileStore::open`] and rewritten
/// after every mutation (temp file + rename, so a crash never leaves a
/// half-written store behind). A mutation only reaches memory once the
/// write succeeded.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<Snapshot>,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Snapshot::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(
            path = %path.display(),
            candidates = state.candidates.len(),
            "opened candidate store"
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &Snapshot) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CandidateStore for JsonFileStore {
    async fn save(&self, candidate: &Candidate) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.save(candidate);
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    async fn load_by_id(&self, id: Uuid) -> Result<Option<Candidate>, StoreError> {
        Ok(self.state.lock().await.load(id))
    }

    async fn list_by_project(&self, project_id: &str) -> Result<Vec<Candidate>, StoreError> {
        Ok(self.state.lock().await.list(project_id))
    }

    async fn set_active(
        &self,
        project_id: &str,
        candidate_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.set_active(project_id, candidate_id)?;
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    async fn active_for_project(&self, project_id: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self.state.lock().await.active.get(project_id).copied())
    }
}
