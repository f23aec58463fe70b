//! In-memory checkpoint backend.
//!
//! Stores every conversation's checkpoint forest and branch pointers behind a
//! single lock. Single-write operations validate first and then mutate the
//! chain in place; time travel stages its branch changes on a copy of the
//! chain's branch list and swaps it in only once every step has succeeded.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::backend::{CheckpointBackend, default_branch_name, new_id};
use crate::error::{CheckpointError, Result};
use crate::types::{
    Branch, Checkpoint, NewBranch, NewCheckpoint, ROOT_BRANCH_NAME, ThreadSnapshot, ThreadSummary,
};

/// In-memory checkpoint backend.
///
/// Each thread owns one [`ThreadSnapshot`] per namespace. Nothing survives the
/// process; use it for tests, embedding, or as a reference for durable
/// backends.
///
/// # Example
///
/// ```ignore
/// use agent_graph_checkpoint::{Checkpointer, InMemorySaver};
///
/// let checkpointer = Checkpointer::new(InMemorySaver::new());
/// let id = checkpointer
///     .store()
///     .append_to_active("thread-1", "", CheckpointSource::Input, payload, Metadata::new())
///     .await?;
/// ```
#[derive(Clone, Default)]
pub struct InMemorySaver {
    storage: Arc<RwLock<HashMap<String, ThreadState>>>,
}

#[derive(Debug, Clone)]
struct ThreadState {
    namespaces: HashMap<String, ThreadSnapshot>,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            namespaces: HashMap::new(),
        }
    }

    fn find_checkpoint(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.namespaces
            .values()
            .find_map(|chain| chain.checkpoint(checkpoint_id))
    }

    fn summary(&self, thread_id: &str) -> Option<ThreadSummary> {
        let mut created_at: Option<DateTime<Utc>> = None;
        let mut last_activity: Option<DateTime<Utc>> = None;
        let mut checkpoint_count = 0u64;

        for checkpoint in self.namespaces.values().flat_map(|c| c.checkpoints.values()) {
            checkpoint_count += 1;
            created_at = Some(created_at.map_or(checkpoint.created_at, |t| t.min(checkpoint.created_at)));
            last_activity =
                Some(last_activity.map_or(checkpoint.created_at, |t| t.max(checkpoint.created_at)));
        }

        Some(ThreadSummary {
            thread_id: thread_id.to_string(),
            created_at: created_at?,
            last_activity,
            checkpoint_count,
        })
    }
}

/// Staged copy of one chain's branch pointers; dropped without `commit` it
/// changes nothing. Checkpoints are only read, so they are never copied.
struct BranchTxn<'a> {
    chain: &'a mut ThreadSnapshot,
    branches: Vec<Branch>,
}

impl<'a> BranchTxn<'a> {
    fn begin(chain: &'a mut ThreadSnapshot) -> Self {
        let branches = chain.branches.clone();
        Self { chain, branches }
    }

    fn insert_branch(&mut self, branch: Branch) {
        self.branches.push(branch);
    }

    fn set_active(&mut self, branch_id: &str) -> Result<()> {
        if !self.branches.iter().any(|b| b.branch_id == branch_id) {
            return Err(CheckpointError::not_found_with_id("branch", branch_id));
        }
        for branch in &mut self.branches {
            branch.is_active = branch.branch_id == branch_id;
        }
        Ok(())
    }

    fn set_head(&mut self, branch_id: &str, checkpoint_id: &str) -> Result<()> {
        if self.chain.checkpoint(checkpoint_id).is_none() {
            return Err(CheckpointError::not_found_with_id("checkpoint", checkpoint_id));
        }
        let branch = self
            .branches
            .iter_mut()
            .find(|b| b.branch_id == branch_id)
            .ok_or_else(|| CheckpointError::not_found_with_id("branch", branch_id))?;
        branch.head_checkpoint_id = checkpoint_id.to_string();
        Ok(())
    }

    fn branch(&self, branch_id: &str) -> Result<Branch> {
        self.branches
            .iter()
            .find(|b| b.branch_id == branch_id)
            .cloned()
            .ok_or_else(|| CheckpointError::not_found_with_id("branch", branch_id))
    }

    fn commit(self) {
        self.chain.branches = self.branches;
    }
}

impl InMemorySaver {
    /// Create a new, empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// The chain of `(thread_id, namespace)`, created empty if missing.
    fn chain_mut<'s>(
        storage: &'s mut HashMap<String, ThreadState>,
        thread_id: &str,
        namespace: &str,
    ) -> &'s mut ThreadSnapshot {
        storage
            .entry(thread_id.to_string())
            .or_insert_with(ThreadState::new)
            .namespaces
            .entry(namespace.to_string())
            .or_default()
    }

    /// Resolve a checkpoint that must live in `(thread_id, namespace)`.
    fn resolve_in_chain<'s>(
        storage: &'s HashMap<String, ThreadState>,
        thread_id: &str,
        namespace: &str,
        checkpoint_id: &str,
    ) -> Result<&'s Checkpoint> {
        let thread = storage.get(thread_id);
        if let Some(checkpoint) = thread
            .and_then(|t| t.namespaces.get(namespace))
            .and_then(|chain| chain.checkpoint(checkpoint_id))
        {
            return Ok(checkpoint);
        }
        match thread.and_then(|t| t.find_checkpoint(checkpoint_id)) {
            Some(other) => Err(CheckpointError::invalid_state(format!(
                "checkpoint {checkpoint_id} belongs to namespace '{}', not '{namespace}'",
                other.namespace
            ))),
            None => Err(CheckpointError::not_found_with_id("checkpoint", checkpoint_id)),
        }
    }
}

#[async_trait]
impl CheckpointBackend for InMemorySaver {
    async fn append(&self, new: NewCheckpoint) -> Result<Checkpoint> {
        let mut storage = self.storage.write();

        let active_head = storage
            .get(&new.thread_id)
            .and_then(|t| t.namespaces.get(&new.namespace))
            .and_then(|chain| chain.active_branch())
            .map(|b| b.head_checkpoint_id.clone());

        match &new.parent_checkpoint_id {
            Some(parent_id) => {
                let parent =
                    Self::resolve_in_chain(&storage, &new.thread_id, &new.namespace, parent_id)?;
                if new.step <= parent.step {
                    return Err(CheckpointError::invalid_state(format!(
                        "step {} does not follow parent step {}",
                        new.step, parent.step
                    )));
                }
                if active_head.as_deref() != Some(parent_id.as_str()) {
                    return Err(CheckpointError::conflict(
                        "append",
                        &new.thread_id,
                        format!(
                            "expected head {parent_id}, active head is {}",
                            active_head.as_deref().unwrap_or("<none>")
                        ),
                    ));
                }
            }
            None => {
                if let Some(head) = active_head {
                    return Err(CheckpointError::conflict(
                        "append",
                        &new.thread_id,
                        format!("chain already started, active head is {head}"),
                    ));
                }
                if new.step < 0 {
                    return Err(CheckpointError::invalid_state(format!(
                        "first step must be non-negative, got {}",
                        new.step
                    )));
                }
            }
        }

        let checkpoint = Checkpoint {
            thread_id: new.thread_id.clone(),
            namespace: new.namespace.clone(),
            checkpoint_id: new_id(),
            parent_checkpoint_id: new.parent_checkpoint_id,
            step: new.step,
            source: new.source,
            payload: new.payload,
            metadata: new.metadata,
            created_at: Utc::now(),
        };

        // Everything above validated; the writes below cannot fail.
        let chain = Self::chain_mut(&mut storage, &checkpoint.thread_id, &checkpoint.namespace);
        match chain.branches.iter_mut().find(|b| b.is_active) {
            Some(active) => active.head_checkpoint_id = checkpoint.checkpoint_id.clone(),
            None => chain.branches.push(Branch {
                branch_id: new_id(),
                thread_id: checkpoint.thread_id.clone(),
                namespace: checkpoint.namespace.clone(),
                name: ROOT_BRANCH_NAME.to_string(),
                fork_point_id: None,
                head_checkpoint_id: checkpoint.checkpoint_id.clone(),
                is_active: true,
                created_at: checkpoint.created_at,
            }),
        }
        chain
            .checkpoints
            .insert(checkpoint.checkpoint_id.clone(), checkpoint.clone());

        Ok(checkpoint)
    }

    async fn find_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>> {
        let storage = self.storage.read();
        Ok(storage
            .get(thread_id)
            .and_then(|t| t.find_checkpoint(checkpoint_id))
            .cloned())
    }

    async fn active_branch(&self, thread_id: &str, namespace: &str) -> Result<Option<Branch>> {
        let storage = self.storage.read();
        Ok(storage
            .get(thread_id)
            .and_then(|t| t.namespaces.get(namespace))
            .and_then(|chain| chain.active_branch())
            .cloned())
    }

    async fn list_branches(&self, thread_id: &str, namespace: &str) -> Result<Vec<Branch>> {
        let storage = self.storage.read();
        Ok(storage
            .get(thread_id)
            .and_then(|t| t.namespaces.get(namespace))
            .map(|chain| chain.branches.clone())
            .unwrap_or_default())
    }

    async fn create_branch(&self, new: NewBranch, activate: bool) -> Result<Branch> {
        let mut storage = self.storage.write();
        Self::resolve_in_chain(
            &storage,
            &new.thread_id,
            &new.namespace,
            &new.source_checkpoint_id,
        )?;

        let branch_id = new_id();
        let name = new
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_branch_name(&branch_id));

        let branch = Branch {
            branch_id: branch_id.clone(),
            thread_id: new.thread_id.clone(),
            namespace: new.namespace.clone(),
            name,
            fork_point_id: Some(new.source_checkpoint_id.clone()),
            head_checkpoint_id: new.source_checkpoint_id.clone(),
            is_active: false,
            created_at: Utc::now(),
        };
        let chain = Self::chain_mut(&mut storage, &new.thread_id, &new.namespace);
        if !activate {
            chain.branches.push(branch.clone());
            return Ok(branch);
        }

        let mut txn = BranchTxn::begin(chain);
        txn.insert_branch(branch);
        txn.set_active(&branch_id)?;
        txn.set_head(&branch_id, &new.source_checkpoint_id)?;
        let branch = txn.branch(&branch_id)?;
        txn.commit();

        Ok(branch)
    }

    async fn activate_branch(
        &self,
        thread_id: &str,
        namespace: &str,
        branch_id: &str,
    ) -> Result<Branch> {
        let mut storage = self.storage.write();

        let owner = storage
            .values()
            .flat_map(|t| t.namespaces.values())
            .find_map(|chain| chain.branch(branch_id))
            .ok_or_else(|| CheckpointError::not_found_with_id("branch", branch_id))?;
        if !owner.belongs_to(thread_id, namespace) {
            return Err(CheckpointError::invalid_state(format!(
                "branch {branch_id} does not belong to thread {thread_id} namespace '{namespace}'"
            )));
        }

        let chain = Self::chain_mut(&mut storage, thread_id, namespace);
        let mut activated = None;
        for branch in &mut chain.branches {
            branch.is_active = branch.branch_id == branch_id;
            if branch.is_active {
                activated = Some(branch.clone());
            }
        }
        activated.ok_or_else(|| CheckpointError::not_found_with_id("branch", branch_id))
    }

    async fn advance_head(
        &self,
        thread_id: &str,
        namespace: &str,
        checkpoint_id: &str,
    ) -> Result<Branch> {
        let mut storage = self.storage.write();
        Self::resolve_in_chain(&storage, thread_id, namespace, checkpoint_id)?;

        let chain = Self::chain_mut(&mut storage, thread_id, namespace);
        let head = chain
            .active_branch()
            .map(|b| b.head_checkpoint_id.clone())
            .ok_or_else(|| CheckpointError::invalid_state("no active branch to advance"))?;
        if !chain.is_ancestor(&head, checkpoint_id)? {
            return Err(CheckpointError::invalid_state(format!(
                "checkpoint {checkpoint_id} does not descend from head {head}"
            )));
        }

        let active = chain
            .branches
            .iter_mut()
            .find(|b| b.is_active)
            .ok_or_else(|| CheckpointError::invalid_state("no active branch to advance"))?;
        active.head_checkpoint_id = checkpoint_id.to_string();
        Ok(active.clone())
    }

    async fn snapshot(&self, thread_id: &str, namespace: &str) -> Result<ThreadSnapshot> {
        let storage = self.storage.read();
        Ok(storage
            .get(thread_id)
            .and_then(|t| t.namespaces.get(namespace))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        let mut storage = self.storage.write();
        Ok(storage.remove(thread_id).is_some())
    }

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        let storage = self.storage.read();
        let mut threads: Vec<ThreadSummary> = storage
            .iter()
            .filter_map(|(thread_id, state)| state.summary(thread_id))
            .collect();
        threads.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(threads)
    }

    async fn thread_summary(&self, thread_id: &str) -> Result<Option<ThreadSummary>> {
        let storage = self.storage.read();
        Ok(storage
            .get(thread_id)
            .and_then(|state| state.summary(thread_id)))
    }
}

impl std::fmt::Debug for InMemorySaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let storage = self.storage.read();
        f.debug_struct("InMemorySaver")
            .field("threads", &storage.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::{CheckpointSource, Payload};

    async fn append(
        saver: &InMemorySaver,
        thread_id: &str,
        parent: Option<&Checkpoint>,
    ) -> Checkpoint {
        saver
            .append(
                NewCheckpoint::builder()
                    .thread_id(thread_id)
                    .maybe_parent_checkpoint_id(parent.map(|p| p.checkpoint_id.clone()))
                    .step(parent.map_or(0, |p| p.step + 1))
                    .source(CheckpointSource::Loop)
                    .payload(Payload::new().with_channel("messages", json!([])))
                    .build(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_append_materializes_root_branch() {
        let saver = InMemorySaver::new();
        let c0 = append(&saver, "t1", None).await;

        let branches = saver.list_branches("t1", "").await.unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].name, ROOT_BRANCH_NAME);
        assert!(branches[0].is_active);
        assert!(branches[0].is_root());
        assert_eq!(branches[0].head_checkpoint_id, c0.checkpoint_id);
    }

    #[tokio::test]
    async fn test_append_rejects_stale_parent() {
        let saver = InMemorySaver::new();
        let c0 = append(&saver, "t1", None).await;
        let _c1 = append(&saver, "t1", Some(&c0)).await;

        let err = saver
            .append(
                NewCheckpoint::builder()
                    .thread_id("t1")
                    .parent_checkpoint_id(c0.checkpoint_id.clone())
                    .step(1)
                    .source(CheckpointSource::Loop)
                    .build(),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_append_rejects_non_increasing_step() {
        let saver = InMemorySaver::new();
        let c0 = append(&saver, "t1", None).await;

        let err = saver
            .append(
                NewCheckpoint::builder()
                    .thread_id("t1")
                    .parent_checkpoint_id(c0.checkpoint_id.clone())
                    .step(0)
                    .source(CheckpointSource::Loop)
                    .build(),
            )
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn test_append_writes_in_place_after_validation() {
        let saver = InMemorySaver::new();
        let c0 = append(&saver, "t1", None).await;
        let c1 = append(&saver, "t1", Some(&c0)).await;
        let before = saver.snapshot("t1", "").await.unwrap();

        // A rejected append touches nothing, so in-place writes stay safe.
        let err = saver
            .append(
                NewCheckpoint::builder()
                    .thread_id("t1")
                    .parent_checkpoint_id(c0.checkpoint_id.clone())
                    .step(1)
                    .source(CheckpointSource::Loop)
                    .build(),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(saver.snapshot("t1", "").await.unwrap(), before);

        let c2 = append(&saver, "t1", Some(&c1)).await;
        let after = saver.snapshot("t1", "").await.unwrap();
        assert_eq!(after.checkpoints.len(), 3);
        assert_eq!(after.branches.len(), 1);
        assert_eq!(after.branches[0].branch_id, before.branches[0].branch_id);
        assert_eq!(after.branches[0].head_checkpoint_id, c2.checkpoint_id);
        assert_eq!(after.checkpoint(&c0.checkpoint_id), before.checkpoint(&c0.checkpoint_id));
    }

    #[tokio::test]
    async fn test_staged_time_travel_rolls_back_on_failure() {
        let saver = InMemorySaver::new();
        let c0 = append(&saver, "t1", None).await;
        let c1 = append(&saver, "t1", Some(&c0)).await;
        let before = saver.snapshot("t1", "").await.unwrap();

        {
            let mut storage = saver.storage.write();
            let chain = InMemorySaver::chain_mut(&mut storage, "t1", "");
            let mut txn = BranchTxn::begin(chain);
            let branch_id = new_id();
            txn.insert_branch(Branch {
                branch_id: branch_id.clone(),
                thread_id: "t1".to_string(),
                namespace: String::new(),
                name: default_branch_name(&branch_id),
                fork_point_id: Some(c0.checkpoint_id.clone()),
                head_checkpoint_id: c0.checkpoint_id.clone(),
                is_active: false,
                created_at: Utc::now(),
            });
            txn.set_active(&branch_id).unwrap();
            // Third sub-write fails; the transaction is dropped uncommitted.
            assert!(txn.set_head(&branch_id, "missing").is_err());
        }

        let after = saver.snapshot("t1", "").await.unwrap();
        assert_eq!(before, after);
        let active = saver.active_branch("t1", "").await.unwrap().unwrap();
        assert_eq!(active.head_checkpoint_id, c1.checkpoint_id);
        assert_eq!(active.name, ROOT_BRANCH_NAME);
    }

    #[tokio::test]
    async fn test_delete_thread_removes_everything() {
        let saver = InMemorySaver::new();
        let c0 = append(&saver, "t1", None).await;
        append(&saver, "t2", None).await;

        assert!(saver.delete_thread("t1").await.unwrap());
        assert!(!saver.delete_thread("t1").await.unwrap());
        assert!(saver.find_checkpoint("t1", &c0.checkpoint_id).await.unwrap().is_none());
        assert!(saver.list_branches("t1", "").await.unwrap().is_empty());

        let threads = saver.list_threads().await.unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].thread_id, "t2");
    }

    #[test]
    fn test_debug_reports_thread_count() {
        let saver = InMemorySaver::new();
        assert_eq!(format!("{saver:?}"), "InMemorySaver { threads: 0 }");
    }
}
