//! Read-only history queries: listings, checkpoint details, tree rebuilds and
//! thread rollups.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::backend::{CheckpointBackend, bounded};
use crate::branch::BranchManager;
use crate::config::CheckpointConfig;
use crate::error::{CheckpointError, Result};
use crate::messages::{MessageView, extract_messages};
use crate::store::CheckpointStore;
use crate::types::{Branch, Checkpoint, CheckpointSource, ThreadSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub step: i64,
    pub source: CheckpointSource,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            step: checkpoint.step,
            source: checkpoint.source,
            created_at: checkpoint.created_at,
            message_count: checkpoint.payload.message_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDetail {
    pub checkpoint: Checkpoint,
    pub parent_checkpoint_id: Option<String>,
    pub messages: Vec<MessageView>,
}

/// A branch whose fork point is a given checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkLabel {
    pub branch_id: String,
    pub name: String,
}

/// One checkpoint in the rendered forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub checkpoint_id: String,
    pub parent_id: Option<String>,
    /// Every branch forked from this checkpoint, oldest first.
    pub forks: Vec<ForkLabel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointTree {
    pub nodes: Vec<TreeNode>,
    pub branches: Vec<Branch>,
}

/// History query engine.
#[derive(Clone)]
pub struct HistoryQuery {
    backend: Arc<dyn CheckpointBackend>,
    config: CheckpointConfig,
    store: CheckpointStore,
    branches: BranchManager,
}

impl HistoryQuery {
    pub fn new(backend: Arc<dyn CheckpointBackend>, config: CheckpointConfig) -> Self {
        Self {
            store: CheckpointStore::new(backend.clone(), config.clone()),
            branches: BranchManager::new(backend.clone(), config.clone()),
            backend,
            config,
        }
    }

    /// Summaries along the active chain, most recent first.
    #[instrument(skip(self), level = "debug")]
    pub async fn checkpoint_summaries(
        &self,
        thread_id: &str,
        namespace: &str,
    ) -> Result<Vec<CheckpointSummary>> {
        let chain = self.store.list_chain(thread_id, namespace, None).await?;
        Ok(chain.iter().map(CheckpointSummary::from).collect())
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn checkpoint_detail(
        &self,
        thread_id: &str,
        namespace: &str,
        checkpoint_id: &str,
    ) -> Result<CheckpointDetail> {
        let checkpoint = self
            .store
            .get(thread_id, namespace, Some(checkpoint_id))
            .await?;

        Ok(CheckpointDetail {
            parent_checkpoint_id: checkpoint.parent_checkpoint_id.clone(),
            messages: extract_messages(&checkpoint.payload),
            checkpoint,
        })
    }

    /// Every checkpoint of the conversation, whichever branch reaches it,
    /// plus every branch pointer.
    #[instrument(skip(self), level = "debug")]
    pub async fn full_tree(&self, thread_id: &str, namespace: &str) -> Result<CheckpointTree> {
        let snapshot = bounded(
            "full_tree",
            thread_id,
            self.config.operation_timeout,
            self.backend.snapshot(thread_id, namespace),
        )
        .await?;

        let mut forked_at: HashMap<&str, Vec<ForkLabel>> = HashMap::new();
        for branch in &snapshot.branches {
            if let Some(fork_point) = branch.fork_point_id.as_deref() {
                forked_at.entry(fork_point).or_default().push(ForkLabel {
                    branch_id: branch.branch_id.clone(),
                    name: branch.name.clone(),
                });
            }
        }

        let nodes: Vec<TreeNode> = snapshot
            .checkpoints
            .values()
            .map(|checkpoint| TreeNode {
                checkpoint_id: checkpoint.checkpoint_id.clone(),
                parent_id: checkpoint.parent_checkpoint_id.clone(),
                forks: forked_at
                    .remove(checkpoint.checkpoint_id.as_str())
                    .unwrap_or_default(),
            })
            .collect();

        debug!(
            nodes = nodes.len(),
            branches = snapshot.branches.len(),
            "Rebuilt checkpoint tree"
        );

        Ok(CheckpointTree {
            nodes,
            branches: snapshot.branches,
        })
    }

    /// Messages at the active head, empty for a conversation with no history.
    pub async fn head_messages(&self, thread_id: &str, namespace: &str) -> Result<Vec<MessageView>> {
        match self.store.get(thread_id, namespace, None).await {
            Ok(head) => Ok(extract_messages(&head.payload)),
            Err(CheckpointError::NotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Switch the active branch and load the messages at its head.
    pub async fn switch_and_load(
        &self,
        thread_id: &str,
        namespace: &str,
        branch_id: &str,
    ) -> Result<(Branch, Vec<MessageView>)> {
        let branch = self
            .branches
            .switch_active(thread_id, namespace, branch_id)
            .await?;
        let head = self
            .store
            .get(thread_id, namespace, Some(&branch.head_checkpoint_id))
            .await?;
        Ok((branch, extract_messages(&head.payload)))
    }

    /// Conversations with history, most recently active first.
    pub async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        bounded(
            "list_threads",
            "*",
            self.config.operation_timeout,
            self.backend.list_threads(),
        )
        .await
    }

    /// Rollup for one conversation; a thread with no checkpoints yet is
    /// reported as empty rather than missing.
    pub async fn thread_summary(&self, thread_id: &str) -> Result<ThreadSummary> {
        let summary = bounded(
            "thread_summary",
            thread_id,
            self.config.operation_timeout,
            self.backend.thread_summary(thread_id),
        )
        .await?;
        Ok(summary.unwrap_or_else(|| ThreadSummary::empty(thread_id)))
    }
}
