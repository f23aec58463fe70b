//! Races `append_to_active` against a backend that yields between reading the
//! head and writing, so stale heads actually happen. The same wrapper can
//! delete the thread inside that window or stall reads outright.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use agent_graph_checkpoint::{
    Branch, Checkpoint, CheckpointBackend, CheckpointConfig, CheckpointError, CheckpointSource,
    Checkpointer, InMemorySaver, Metadata, NewBranch, NewCheckpoint, Payload, Result,
    ThreadSnapshot, ThreadSummary,
};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Default)]
struct Racy {
    inner: InMemorySaver,
    conflicts: AtomicUsize,
    /// Delete the thread right before the next append reaches the store.
    delete_before_append: AtomicBool,
    /// Never answer checkpoint lookups.
    stall_reads: AtomicBool,
}

#[async_trait]
impl CheckpointBackend for Racy {
    async fn append(&self, new: NewCheckpoint) -> Result<Checkpoint> {
        tokio::task::yield_now().await;
        if self.delete_before_append.swap(false, Ordering::SeqCst) {
            self.inner.delete_thread(&new.thread_id).await?;
        }
        let result = self.inner.append(new).await;
        if matches!(&result, Err(e) if e.is_conflict()) {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn find_checkpoint(&self, thread_id: &str, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        if self.stall_reads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.find_checkpoint(thread_id, checkpoint_id).await
    }

    async fn active_branch(&self, thread_id: &str, namespace: &str) -> Result<Option<Branch>> {
        let branch = self.inner.active_branch(thread_id, namespace).await;
        tokio::task::yield_now().await;
        branch
    }

    async fn list_branches(&self, thread_id: &str, namespace: &str) -> Result<Vec<Branch>> {
        self.inner.list_branches(thread_id, namespace).await
    }

    async fn create_branch(&self, new: NewBranch, activate: bool) -> Result<Branch> {
        self.inner.create_branch(new, activate).await
    }

    async fn activate_branch(&self, thread_id: &str, namespace: &str, branch_id: &str) -> Result<Branch> {
        self.inner.activate_branch(thread_id, namespace, branch_id).await
    }

    async fn advance_head(&self, thread_id: &str, namespace: &str, checkpoint_id: &str) -> Result<Branch> {
        self.inner.advance_head(thread_id, namespace, checkpoint_id).await
    }

    async fn snapshot(&self, thread_id: &str, namespace: &str) -> Result<ThreadSnapshot> {
        self.inner.snapshot(thread_id, namespace).await
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        self.inner.delete_thread(thread_id).await
    }

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        self.inner.list_threads().await
    }

    async fn thread_summary(&self, thread_id: &str) -> Result<Option<ThreadSummary>> {
        self.inner.thread_summary(thread_id).await
    }
}

fn racy_checkpointer(backend: Arc<Racy>, retries: usize) -> Checkpointer {
    Checkpointer::with_config(
        backend,
        CheckpointConfig::default()
            .with_max_conflict_retries(retries)
            .with_retry_delay(Duration::from_micros(100)),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_appends_form_one_chain() {
    const WRITERS: usize = 32;
    let backend = Arc::new(Racy::default());
    let cp = racy_checkpointer(backend.clone(), 1024);

    let tasks: Vec<_> = (0..WRITERS)
        .map(|_| {
            let cp = cp.clone();
            tokio::spawn(async move {
                cp.store()
                    .append_to_active("t1", "", CheckpointSource::Loop, Payload::new(), Metadata::new())
                    .await
            })
        })
        .collect();

    for joined in futures::future::join_all(tasks).await {
        joined.unwrap().unwrap();
    }

    let chain = cp.store().list_chain("t1", "", None).await.unwrap();
    assert_eq!(chain.len(), WRITERS);
    let steps: Vec<_> = chain.iter().rev().map(|c| c.step).collect();
    assert_eq!(steps, (0..WRITERS as i64).collect::<Vec<_>>());

    let snapshot = backend.snapshot("t1", "").await.unwrap();
    assert_eq!(snapshot.checkpoints.len(), WRITERS);
    assert_eq!(snapshot.branches.len(), 1);
    for checkpoint in snapshot.checkpoints.values() {
        assert!(snapshot.children_of(&checkpoint.checkpoint_id).count() <= 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_surface_conflict() {
    let backend = Arc::new(Racy::default());
    let cp = racy_checkpointer(backend.clone(), 0);
    cp.store()
        .append_to_active("t1", "", CheckpointSource::Input, Payload::new(), Metadata::new())
        .await
        .unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cp = cp.clone();
            tokio::spawn(async move {
                cp.store()
                    .append_to_active("t1", "", CheckpointSource::Loop, Payload::new(), Metadata::new())
                    .await
            })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    // Without retries every lost race is reported, never silently forked.
    let failures = results.iter().filter(|r| r.is_err()).count();
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| e.is_conflict()));
    assert_eq!(failures, backend.conflicts.load(Ordering::Relaxed));

    let chain = cp.store().list_chain("t1", "", None).await.unwrap();
    assert_eq!(chain.len(), 1 + results.len() - failures);
}

#[tokio::test]
async fn delete_between_head_read_and_write_surfaces_thread_deleted() {
    let backend = Arc::new(Racy::default());
    let cp = racy_checkpointer(backend.clone(), 8);
    cp.store()
        .append_to_active("t1", "", CheckpointSource::Input, Payload::new(), Metadata::new())
        .await
        .unwrap();

    backend.delete_before_append.store(true, Ordering::SeqCst);
    let err = cp
        .store()
        .append_to_active("t1", "", CheckpointSource::Loop, Payload::new(), Metadata::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CheckpointError::ThreadDeleted { .. }), "got {err}");
    assert!(err.is_conflict());
    assert!(!err.is_retryable());

    // Nothing of the thread survives, and the failed write did not recreate it.
    assert!(cp.store().list_chain("t1", "", None).await.unwrap().is_empty());
    assert!(cp.branches().list_branches("t1", "").await.unwrap().is_empty());
    assert_eq!(cp.history().thread_summary("t1").await.unwrap().checkpoint_count, 0);
}

#[tokio::test]
async fn stalled_backend_surfaces_timeout() {
    let backend = Arc::new(Racy::default());
    let cp = Checkpointer::with_config(
        backend.clone(),
        CheckpointConfig::default().with_operation_timeout(Duration::from_millis(50)),
    );
    let id = cp
        .store()
        .append_to_active("t1", "", CheckpointSource::Input, Payload::new(), Metadata::new())
        .await
        .unwrap();

    backend.stall_reads.store(true, Ordering::SeqCst);
    let err = cp.store().get("t1", "", Some(&id)).await.unwrap_err();
    assert!(err.is_timeout(), "got {err}");
    assert!(err.is_unavailable());
    assert!(!err.is_not_found());
}
