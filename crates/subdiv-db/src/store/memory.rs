use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CandidateStore, Snapshot, StoreError};
use crate::models::Candidate;

/// In-process [`CandidateStore`]. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored candidates across all projects.
    pub async fn len(&self) -> usize {
        self.inner.read().await.candidates.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.candidates.is_empty()
    }
}

#[async_trait]
impl CandidateStore for MemoryStore {
    async fn save(&self, candidate: &Candidate) -> Result<(), StoreError> {
        self.inner.write().await.save(candidate);
        Ok(())
    }

    async fn load_by_id(&self, id: Uuid) -> Result<Option<Candidate>, StoreError> {
        Ok(self.inner.read().await.load(id))
    }

    async fn list_by_project(&self, project_id: &str) -> Result<Vec<Candidate>, StoreError> {
        Ok(self.inner.read().await.list(project_id))
    }

    async fn set_active(
        &self,
        project_id: &str,
        candidate_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        self.inner.write().await.set_active(project_id, candidate_id)
    }

    async fn active_for_project(&self, project_id: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self.inner.read().await.active.get(project_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GenerationRequest;

    fn candidate(project: &str) -> Candidate {
        Candidate::pending(project, GenerationRequest::new(20.0, 50.0, 20.0))
    }

    #[tokio::test]
    async fn save_replaces_existing_row() {
        let store = MemoryStore::new();
        let mut c = candidate("p1");
        store.save(&c).await.unwrap();
        c.retry_count = 2;
        store.save(&c).await.unwrap();

        assert_eq!(store.len().await, 1);
        let loaded = store.load_by_id(c.id).await.unwrap().unwrap();
        assert_eq!(loaded.retry_count, 2);
    }

    #[tokio::test]
    async fn list_is_scoped_and_ordered() {
        let store = MemoryStore::new();
        let a = candidate("p1");
        let b = candidate("p2");
        let c = candidate("p1");
        for x in [&a, &b, &c] {
            store.save(x).await.unwrap();
        }

        let ids: Vec<Uuid> = store
            .list_by_project("p1")
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[tokio::test]
    async fn set_active_rejects_foreign_candidate() {
        let store = MemoryStore::new();
        let c = candidate("p1");
        store.save(&c).await.unwrap();

        let err = store.set_active("p2", Some(c.id)).await.unwrap_err();
        assert!(matches!(err, StoreError::ProjectMismatch { .. }));
        assert_eq!(store.active_for_project("p2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_active_unknown_candidate_is_not_found() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let err = store.set_active("p1", Some(id)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(x) if x == id));
    }

    #[tokio::test]
    async fn clearing_active_pointer() {
        let store = MemoryStore::new();
        let c = candidate("p1");
        store.save(&c).await.unwrap();
        store.set_active("p1", Some(c.id)).await.unwrap();
        assert_eq!(store.active_for_project("p1").await.unwrap(), Some(c.id));

        store.set_active("p1", None).await.unwrap();
        assert_eq!(store.active_for_project("p1").await.unwrap(), None);
    }
}
