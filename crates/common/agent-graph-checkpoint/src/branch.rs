//! Branch manager: named, switchable pointers into the checkpoint tree.
//!
//! Every `(thread_id, namespace)` is either without branches (no checkpoints
//! yet) or has exactly one active branch. The root branch is created together
//! with the first checkpoint, so callers never see a conversation with
//! history but no active branch.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::backend::{CheckpointBackend, bounded, retrying};
use crate::config::CheckpointConfig;
use crate::error::Result;
use crate::types::{Branch, NewBranch};

#[derive(Clone)]
pub struct BranchManager {
    backend: Arc<dyn CheckpointBackend>,
    config: CheckpointConfig,
}

impl BranchManager {
    pub fn new(backend: Arc<dyn CheckpointBackend>, config: CheckpointConfig) -> Self {
        Self { backend, config }
    }

    /// Head of the active branch, `None` before the first checkpoint.
    #[instrument(skip(self), level = "debug")]
    pub async fn current_head(&self, thread_id: &str, namespace: &str) -> Result<Option<String>> {
        let active = self.active_branch(thread_id, namespace).await?;
        Ok(active.map(|b| b.head_checkpoint_id))
    }

    pub async fn active_branch(&self, thread_id: &str, namespace: &str) -> Result<Option<Branch>> {
        bounded(
            "active_branch",
            thread_id,
            self.config.operation_timeout,
            self.backend.active_branch(thread_id, namespace),
        )
        .await
    }

    /// Move the active branch's head forward onto `checkpoint_id`.
    ///
    /// The checkpoint must descend from the current head; heads never move
    /// behind their fork point.
    #[instrument(skip(self))]
    pub async fn advance_active(
        &self,
        thread_id: &str,
        namespace: &str,
        checkpoint_id: &str,
    ) -> Result<Branch> {
        let branch = retrying("advance_active", thread_id, &self.config, || {
            self.backend.advance_head(thread_id, namespace, checkpoint_id)
        })
        .await?;

        debug!(branch_id = %branch.branch_id, "Advanced active head");
        Ok(branch)
    }

    /// Create an inactive branch rooted at an existing checkpoint.
    ///
    /// Existing checkpoints and branches are left untouched.
    #[instrument(skip(self))]
    pub async fn fork(
        &self,
        thread_id: &str,
        namespace: &str,
        source_checkpoint_id: &str,
        name: Option<&str>,
    ) -> Result<Branch> {
        let branch = self
            .create(thread_id, namespace, source_checkpoint_id, name, false)
            .await?;

        info!(
            branch_id = %branch.branch_id,
            name = %branch.name,
            "Forked branch from checkpoint {}",
            source_checkpoint_id
        );
        Ok(branch)
    }

    /// Deactivate the current active branch and activate `branch_id`.
    #[instrument(skip(self))]
    pub async fn switch_active(
        &self,
        thread_id: &str,
        namespace: &str,
        branch_id: &str,
    ) -> Result<Branch> {
        let branch = retrying("switch_active", thread_id, &self.config, || {
            self.backend.activate_branch(thread_id, namespace, branch_id)
        })
        .await?;

        info!(
            name = %branch.name,
            head = %branch.head_checkpoint_id,
            "Switched active branch"
        );
        Ok(branch)
    }

    /// Fork from `source_checkpoint_id` and activate the new branch in one
    /// transaction.
    ///
    /// Nothing after the target is deleted: it stays reachable from the
    /// branch it was written on.
    #[instrument(skip(self))]
    pub async fn time_travel(
        &self,
        thread_id: &str,
        namespace: &str,
        source_checkpoint_id: &str,
        name: Option<&str>,
    ) -> Result<Branch> {
        let branch = self
            .create(thread_id, namespace, source_checkpoint_id, name, true)
            .await?;

        info!(
            branch_id = %branch.branch_id,
            name = %branch.name,
            "Time travelled to checkpoint {}",
            source_checkpoint_id
        );
        Ok(branch)
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn list_branches(&self, thread_id: &str, namespace: &str) -> Result<Vec<Branch>> {
        bounded(
            "list_branches",
            thread_id,
            self.config.operation_timeout,
            self.backend.list_branches(thread_id, namespace),
        )
        .await
    }

    async fn create(
        &self,
        thread_id: &str,
        namespace: &str,
        source_checkpoint_id: &str,
        name: Option<&str>,
        activate: bool,
    ) -> Result<Branch> {
        let new = NewBranch {
            thread_id: thread_id.to_string(),
            namespace: namespace.to_string(),
            source_checkpoint_id: source_checkpoint_id.to_string(),
            name: name.map(str::to_string),
        };

        let operation = if activate { "time_travel" } else { "fork" };
        retrying(operation, thread_id, &self.config, || {
            self.backend.create_branch(new.clone(), activate)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySaver;
    use crate::store::CheckpointStore;
    use crate::types::{CheckpointSource, Metadata, Payload, ROOT_BRANCH_NAME};

    fn components() -> (CheckpointStore, BranchManager) {
        let backend: Arc<dyn CheckpointBackend> = Arc::new(InMemorySaver::new());
        let config = CheckpointConfig::default();
        (
            CheckpointStore::new(backend.clone(), config.clone()),
            BranchManager::new(backend, config),
        )
    }

    async fn append(store: &CheckpointStore, thread_id: &str) -> String {
        store
            .append_to_active(thread_id, "", CheckpointSource::Loop, Payload::new(), Metadata::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_current_head_of_empty_thread() {
        let (_, branches) = components();
        assert_eq!(branches.current_head("t1", "").await.unwrap(), None);
        assert!(branches.list_branches("t1", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fork_generates_name_and_stays_inactive() {
        let (store, branches) = components();
        let c0 = append(&store, "t1").await;
        let c1 = append(&store, "t1").await;

        let fork = branches.fork("t1", "", &c0, None).await.unwrap();
        let sibling = branches.fork("t1", "", &c0, None).await.unwrap();
        assert!(fork.name.starts_with("fork-"));
        assert_eq!(fork.name.len(), "fork-".len() + 8);
        assert_ne!(fork.name, sibling.name);
        assert!(!fork.is_active);
        assert_eq!(fork.fork_point_id.as_deref(), Some(c0.as_str()));
        assert_eq!(fork.head_checkpoint_id, c0);

        assert_eq!(branches.current_head("t1", "").await.unwrap(), Some(c1));
    }

    #[tokio::test]
    async fn test_fork_from_other_namespace_is_invalid() {
        let (store, branches) = components();
        let c0 = store
            .append_to_active("t1", "sub", CheckpointSource::Input, Payload::new(), Metadata::new())
            .await
            .unwrap();

        let err = branches.fork("t1", "", &c0, None).await.unwrap_err();
        assert!(err.is_invalid_state());

        let err = branches.fork("t1", "", "missing", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_switch_to_foreign_branch_is_invalid() {
        let (store, branches) = components();
        let t1 = append(&store, "t1").await;
        append(&store, "t2").await;
        let fork = branches.fork("t1", "", &t1, Some("alt")).await.unwrap();

        let err = branches.switch_active("t2", "", &fork.branch_id).await.unwrap_err();
        assert!(err.is_invalid_state());

        let err = branches.switch_active("t1", "", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_advance_active_only_moves_forward() {
        let (store, branches) = components();
        let c0 = append(&store, "t1").await;
        let c1 = append(&store, "t1").await;

        // Park the active head back on c0 through a time travel, then move it
        // forward again onto the original continuation.
        let travelled = branches.time_travel("t1", "", &c0, None).await.unwrap();
        assert_eq!(branches.current_head("t1", "").await.unwrap(), Some(c0.clone()));

        let advanced = branches.advance_active("t1", "", &c1).await.unwrap();
        assert_eq!(advanced.branch_id, travelled.branch_id);
        assert_eq!(advanced.head_checkpoint_id, c1);

        let err = branches.advance_active("t1", "", &c0).await.unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn test_time_travel_keeps_original_branch_intact() {
        let (store, branches) = components();
        let c0 = append(&store, "t1").await;
        let c1 = append(&store, "t1").await;

        let branch = branches.time_travel("t1", "", &c0, Some("retry")).await.unwrap();
        assert!(branch.is_active);
        assert_eq!(branch.name, "retry");

        let all = branches.list_branches("t1", "").await.unwrap();
        assert_eq!(all.len(), 2);
        let main = all.iter().find(|b| b.name == ROOT_BRANCH_NAME).unwrap();
        assert!(!main.is_active);
        assert_eq!(main.head_checkpoint_id, c1);
        assert_eq!(all.iter().filter(|b| b.is_active).count(), 1);
    }
}
