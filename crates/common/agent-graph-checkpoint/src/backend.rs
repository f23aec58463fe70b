//! Storage contract implemented by every checkpoint backend.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use uuid::Uuid;

use crate::config::CheckpointConfig;
use crate::error::{CheckpointError, Result};
use crate::types::{Branch, Checkpoint, NewBranch, NewCheckpoint, ThreadSnapshot, ThreadSummary};

/// Transactional primitives the store, branch manager and history query are
/// composed from.
///
/// Every method is one atomic unit against the underlying store: either all
/// of its writes become visible or none do.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// Insert a checkpoint after the active head and move the head onto it.
    ///
    /// `new.parent_checkpoint_id` must equal the active branch's head at
    /// commit time; anything else is a `Conflict`. The first checkpoint of a
    /// `(thread_id, namespace)` also materializes the root branch.
    async fn append(&self, new: NewCheckpoint) -> Result<Checkpoint>;

    /// Look a checkpoint up across every namespace of a thread.
    async fn find_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>>;

    async fn active_branch(&self, thread_id: &str, namespace: &str) -> Result<Option<Branch>>;

    /// Branches of one chain, oldest first.
    async fn list_branches(&self, thread_id: &str, namespace: &str) -> Result<Vec<Branch>>;

    /// Create a branch whose fork point and head are the source checkpoint.
    ///
    /// With `activate`, the previous active branch is deactivated in the same
    /// unit of work.
    async fn create_branch(&self, new: NewBranch, activate: bool) -> Result<Branch>;

    async fn activate_branch(
        &self,
        thread_id: &str,
        namespace: &str,
        branch_id: &str,
    ) -> Result<Branch>;

    /// Move the active head forward onto a descendant of the current head.
    async fn advance_head(
        &self,
        thread_id: &str,
        namespace: &str,
        checkpoint_id: &str,
    ) -> Result<Branch>;

    async fn snapshot(&self, thread_id: &str, namespace: &str) -> Result<ThreadSnapshot>;

    /// Remove every checkpoint, namespace and branch of a thread.
    ///
    /// Returns whether anything existed.
    async fn delete_thread(&self, thread_id: &str) -> Result<bool>;

    /// Threads with at least one checkpoint, most recently active first.
    async fn list_threads(&self) -> Result<Vec<ThreadSummary>>;

    async fn thread_summary(&self, thread_id: &str) -> Result<Option<ThreadSummary>>;
}

/// Fresh time-ordered id for checkpoints and branches.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// `fork-<last 8 hex digits of the branch id>`.
///
/// The leading digits of a v7 id are its timestamp, so only the random tail
/// tells forks made in the same minute apart.
pub fn default_branch_name(branch_id: &str) -> String {
    let hex: Vec<char> = branch_id.chars().filter(|c| *c != '-').collect();
    let short: String = hex[hex.len().saturating_sub(8)..].iter().collect();
    format!("fork-{short}")
}

/// Run one store operation under the caller's deadline.
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    thread_id: &str,
    after: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, thread_id, ?after, "checkpoint operation timed out");
            Err(CheckpointError::timeout(operation, thread_id, after))
        }
    }
}

/// Run a write under the caller's deadline, replaying it while it fails with
/// a retryable conflict (a lost head race or a busy database).
pub(crate) async fn retrying<T, F, Fut>(
    operation: &'static str,
    thread_id: &str,
    config: &CheckpointConfig,
    attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let strategy = ConstantBuilder::default()
        .with_delay(config.retry_delay)
        .with_max_times(config.max_conflict_retries);

    bounded(
        operation,
        thread_id,
        config.operation_timeout,
        attempt
            .retry(strategy)
            .when(CheckpointError::is_retryable)
            .notify(|err: &CheckpointError, delay| {
                tracing::warn!(operation, thread_id, ?delay, "Retrying after conflict: {err}");
            }),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_branch_name_uses_random_tail() {
        assert_eq!(
            default_branch_name("0192f0c1-7d2e-7000-8000-00001234abcd"),
            "fork-1234abcd"
        );
        assert_eq!(default_branch_name("abc"), "fork-abc");

        let first = default_branch_name(&new_id());
        let second = default_branch_name(&new_id());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_retrying_replays_conflicts_only() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let config = CheckpointConfig::default().with_retry_delay(Duration::ZERO);
        let calls = AtomicUsize::new(0);
        let value = retrying("fork", "t1", &config, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CheckpointError::conflict("fork", "t1", "database is locked"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicUsize::new(0);
        let err = retrying("fork", "t1", &config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CheckpointError::invalid_state("bad source"))
        })
        .await
        .unwrap_err();
        assert!(err.is_invalid_state());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bounded_surfaces_timeout() {
        let result: Result<()> = bounded("get", "t1", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_not_found());
    }
}
