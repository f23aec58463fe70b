//! Checkpoint store: append, lookup, chain listing and thread deletion.

use std::sync::Arc;

use bon::bon;
use tracing::{debug, info, instrument};

use crate::backend::{CheckpointBackend, bounded, retrying};
use crate::config::CheckpointConfig;
use crate::error::{CheckpointError, Result};
use crate::types::{Checkpoint, CheckpointSource, Metadata, NewCheckpoint, Payload};

/// Append-only record of immutable checkpoints.
#[derive(Clone)]
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
    config: CheckpointConfig,
}

#[bon]
impl CheckpointStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>, config: CheckpointConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Append a checkpoint after an explicit parent.
    ///
    /// The parent must be the active branch's head when the write commits.
    /// A lost race is returned as `Conflict` without retrying, since the
    /// caller picked the parent.
    #[builder]
    pub async fn append(
        &self,
        #[builder(into)] thread_id: String,
        #[builder(into, default)] namespace: String,
        #[builder(into)] parent_checkpoint_id: Option<String>,
        step: i64,
        source: CheckpointSource,
        #[builder(default)] payload: Payload,
        #[builder(default)] metadata: Metadata,
    ) -> Result<String> {
        let new = NewCheckpoint {
            thread_id: thread_id.clone(),
            namespace,
            parent_checkpoint_id,
            step,
            source,
            payload,
            metadata,
        };

        let checkpoint = bounded(
            "append",
            &thread_id,
            self.config.operation_timeout,
            self.backend.append(new),
        )
        .await?;

        debug!(
            thread_id = %checkpoint.thread_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            step = checkpoint.step,
            "Appended checkpoint"
        );
        Ok(checkpoint.checkpoint_id)
    }

    /// Append after whatever the active head is, replaying lost races.
    pub async fn append_to_active(
        &self,
        thread_id: &str,
        namespace: &str,
        source: CheckpointSource,
        payload: Payload,
        metadata: Metadata,
    ) -> Result<String> {
        self.append_checkpoint_to_active(thread_id, namespace, source, payload, metadata)
            .await
            .map(|checkpoint| checkpoint.checkpoint_id)
    }

    /// Same as [`Self::append_to_active`] but returns the stored checkpoint.
    #[instrument(skip(self, payload, metadata))]
    pub async fn append_checkpoint_to_active(
        &self,
        thread_id: &str,
        namespace: &str,
        source: CheckpointSource,
        payload: Payload,
        metadata: Metadata,
    ) -> Result<Checkpoint> {
        let checkpoint = retrying("append", thread_id, &self.config, || {
            self.append_once(thread_id, namespace, source, &payload, &metadata)
        })
        .await?;

        debug!(
            checkpoint_id = %checkpoint.checkpoint_id,
            step = checkpoint.step,
            "Appended checkpoint to active branch"
        );
        Ok(checkpoint)
    }

    /// One read-head-then-write attempt.
    async fn append_once(
        &self,
        thread_id: &str,
        namespace: &str,
        source: CheckpointSource,
        payload: &Payload,
        metadata: &Metadata,
    ) -> Result<Checkpoint> {
        let (parent, step) = match self.backend.active_branch(thread_id, namespace).await? {
            Some(branch) => {
                let head = self
                    .backend
                    .find_checkpoint(thread_id, &branch.head_checkpoint_id)
                    .await?
                    .ok_or_else(|| CheckpointError::thread_deleted(thread_id))?;
                (Some(head.checkpoint_id), head.step + 1)
            }
            None => (None, 0),
        };
        let had_parent = parent.is_some();

        let new = NewCheckpoint {
            thread_id: thread_id.to_string(),
            namespace: namespace.to_string(),
            parent_checkpoint_id: parent,
            step,
            source,
            payload: payload.clone(),
            metadata: metadata.clone(),
        };

        // The parent was the head a moment ago; only a thread delete can
        // make it vanish.
        self.backend.append(new).await.map_err(|e| match e {
            CheckpointError::NotFound { .. } if had_parent => {
                CheckpointError::thread_deleted(thread_id)
            }
            other => other,
        })
    }

    /// Fetch a checkpoint by id, or the active head when no id is given.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(
        &self,
        thread_id: &str,
        namespace: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Checkpoint> {
        bounded("get", thread_id, self.config.operation_timeout, async {
            let checkpoint_id = match checkpoint_id {
                Some(id) => id.to_string(),
                None => self
                    .backend
                    .active_branch(thread_id, namespace)
                    .await?
                    .map(|b| b.head_checkpoint_id)
                    .ok_or_else(|| CheckpointError::not_found_with_id("thread head", thread_id))?,
            };

            self.backend
                .find_checkpoint(thread_id, &checkpoint_id)
                .await?
                .filter(|c| c.namespace == namespace)
                .ok_or_else(|| CheckpointError::not_found_with_id("checkpoint", checkpoint_id))
        })
        .await
    }

    /// Walk parent links back to the root, most recent first.
    ///
    /// Starts at the active head unless `from_checkpoint_id` is given. An
    /// unknown or empty conversation yields an empty chain.
    #[instrument(skip(self), level = "debug")]
    pub async fn list_chain(
        &self,
        thread_id: &str,
        namespace: &str,
        from_checkpoint_id: Option<&str>,
    ) -> Result<Vec<Checkpoint>> {
        let snapshot = bounded(
            "list_chain",
            thread_id,
            self.config.operation_timeout,
            self.backend.snapshot(thread_id, namespace),
        )
        .await?;

        let from = match from_checkpoint_id {
            Some(id) => {
                if snapshot.checkpoint(id).is_none() {
                    return Err(CheckpointError::not_found_with_id("checkpoint", id));
                }
                id.to_string()
            }
            None => match snapshot.active_branch() {
                Some(branch) => branch.head_checkpoint_id.clone(),
                None => return Ok(Vec::new()),
            },
        };

        Ok(snapshot.chain_from(&from)?.into_iter().cloned().collect())
    }

    /// Irreversibly remove every checkpoint, namespace and branch of a thread.
    #[instrument(skip(self))]
    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let existed = retrying("delete_thread", thread_id, &self.config, || {
            self.backend.delete_thread(thread_id)
        })
        .await?;

        if existed {
            info!("Deleted thread {}", thread_id);
        } else {
            debug!("Delete requested for unknown thread {}", thread_id);
        }
        Ok(())
    }
}
