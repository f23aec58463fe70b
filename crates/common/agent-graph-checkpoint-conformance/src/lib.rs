//! Behavioural suite every [`CheckpointBackend`] must pass.
//!
//! Each check takes a fresh, empty backend and panics on the first violated
//! expectation, so backends run it from their own integration tests:
//!
//! ```ignore
//! #[tokio::test(flavor = "multi_thread")]
//! async fn conformance() {
//!     agent_graph_checkpoint_conformance::run_all(|| async {
//!         Arc::new(InMemorySaver::new()) as Arc<dyn CheckpointBackend>
//!     })
//!     .await;
//! }
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use agent_graph_checkpoint::{
    CheckpointBackend, CheckpointConfig, CheckpointSource, Checkpointer, MESSAGES_CHANNEL,
    Metadata, Payload, ROOT_BRANCH_NAME,
};
use serde_json::json;

/// Number of writers racing in [`concurrent_appends_serialize`].
pub const CONCURRENT_WRITERS: usize = 16;

fn checkpointer(backend: Arc<dyn CheckpointBackend>) -> Checkpointer {
    let config = CheckpointConfig::default()
        .with_max_conflict_retries(256)
        .with_retry_delay(Duration::from_millis(1));
    Checkpointer::with_config(backend, config)
}

fn said(role: &str, content: &str) -> Payload {
    Payload::new().with_channel(MESSAGES_CHANNEL, json!([{"type": role, "content": content}]))
}

async fn append(cp: &Checkpointer, thread_id: &str, namespace: &str, source: CheckpointSource) -> String {
    cp.store()
        .append_to_active(thread_id, namespace, source, said("human", source.as_str()), Metadata::new())
        .await
        .expect("append_to_active")
}

/// Run every check, each against a backend from `factory`.
pub async fn run_all<F, Fut>(factory: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Arc<dyn CheckpointBackend>>,
{
    first_append_materializes_main(factory().await).await;
    parent_integrity(factory().await).await;
    single_active_branch(factory().await).await;
    append_monotonicity(factory().await).await;
    explicit_append_rejects_stale_parent(factory().await).await;
    fork_is_non_destructive(factory().await).await;
    time_travel_is_non_destructive(factory().await).await;
    switch_scenario_builds_tree(factory().await).await;
    tree_lists_sibling_forks(factory().await).await;
    switch_rejects_foreign_branch(factory().await).await;
    advance_active_moves_forward(factory().await).await;
    get_missing_is_not_found(factory().await).await;
    namespaces_are_independent(factory().await).await;
    delete_thread_removes_everything(factory().await).await;
    history_queries(factory().await).await;
    thread_listing(factory().await).await;
    concurrent_appends_serialize(factory().await).await;
    tracing::debug!("checkpoint conformance suite passed");
}

pub async fn first_append_materializes_main(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    assert_eq!(cp.branches().current_head("t1", "").await.unwrap(), None);

    let c0 = append(&cp, "t1", "", CheckpointSource::Input).await;

    let branches = cp.branches().list_branches("t1", "").await.unwrap();
    assert_eq!(branches.len(), 1);
    let main = &branches[0];
    assert_eq!(main.name, ROOT_BRANCH_NAME);
    assert!(main.is_active);
    assert!(main.fork_point_id.is_none());
    assert_eq!(main.head_checkpoint_id, c0);

    let head = cp.store().get("t1", "", None).await.unwrap();
    assert_eq!(head.step, 0);
    assert!(head.parent_checkpoint_id.is_none());
    assert_eq!(head.source, CheckpointSource::Input);
}

pub async fn parent_integrity(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend.clone());
    let c0 = append(&cp, "t1", "", CheckpointSource::Input).await;
    append(&cp, "t1", "", CheckpointSource::Loop).await;
    cp.branches().time_travel("t1", "", &c0, None).await.unwrap();
    append(&cp, "t1", "", CheckpointSource::Update).await;
    append(&cp, "t1", "", CheckpointSource::Loop).await;

    let snapshot = backend.snapshot("t1", "").await.unwrap();
    assert_eq!(snapshot.checkpoints.len(), 4);
    for checkpoint in snapshot.checkpoints.values() {
        if let Some(parent_id) = &checkpoint.parent_checkpoint_id {
            let parent = snapshot
                .checkpoint(parent_id)
                .unwrap_or_else(|| panic!("dangling parent {parent_id}"));
            assert_eq!(parent.namespace, checkpoint.namespace);
            assert!(parent.step < checkpoint.step);
        }
        let chain = snapshot.chain_from(&checkpoint.checkpoint_id).unwrap();
        assert!(chain.last().unwrap().parent_checkpoint_id.is_none());
    }
}

pub async fn single_active_branch(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    let c0 = append(&cp, "t1", "", CheckpointSource::Input).await;
    let c1 = append(&cp, "t1", "", CheckpointSource::Loop).await;

    let alt = cp.branches().fork("t1", "", &c0, Some("alt")).await.unwrap();
    cp.branches().fork("t1", "", &c1, None).await.unwrap();
    cp.branches().switch_active("t1", "", &alt.branch_id).await.unwrap();
    cp.branches().time_travel("t1", "", &c1, None).await.unwrap();

    let branches = cp.branches().list_branches("t1", "").await.unwrap();
    assert_eq!(branches.len(), 4);
    assert_eq!(branches.iter().filter(|b| b.is_active).count(), 1);
}

pub async fn append_monotonicity(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    let mut previous: Option<String> = None;
    for step in 0..5 {
        let id = append(&cp, "t1", "", CheckpointSource::Loop).await;
        assert_eq!(cp.branches().current_head("t1", "").await.unwrap().as_deref(), Some(id.as_str()));

        let checkpoint = cp.store().get("t1", "", Some(&id)).await.unwrap();
        assert_eq!(checkpoint.step, step);
        assert_eq!(checkpoint.parent_checkpoint_id, previous);
        previous = Some(id);
    }

    let chain = cp.store().list_chain("t1", "", None).await.unwrap();
    let steps: Vec<_> = chain.iter().map(|c| c.step).collect();
    assert_eq!(steps, [4, 3, 2, 1, 0]);
}

pub async fn explicit_append_rejects_stale_parent(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    let c0 = cp
        .store()
        .append()
        .thread_id("t1")
        .step(0)
        .source(CheckpointSource::Input)
        .call()
        .await
        .unwrap();
    cp.store()
        .append()
        .thread_id("t1")
        .parent_checkpoint_id(c0.clone())
        .step(1)
        .source(CheckpointSource::Loop)
        .call()
        .await
        .unwrap();

    let stale = cp
        .store()
        .append()
        .thread_id("t1")
        .parent_checkpoint_id(c0)
        .step(1)
        .source(CheckpointSource::Loop)
        .call()
        .await
        .unwrap_err();
    assert!(stale.is_conflict(), "expected conflict, got {stale}");

    let missing = cp
        .store()
        .append()
        .thread_id("t1")
        .parent_checkpoint_id("missing")
        .step(2)
        .source(CheckpointSource::Loop)
        .call()
        .await
        .unwrap_err();
    assert!(missing.is_not_found(), "expected not found, got {missing}");
}

pub async fn fork_is_non_destructive(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend.clone());
    let c0 = append(&cp, "t1", "", CheckpointSource::Input).await;
    let c1 = append(&cp, "t1", "", CheckpointSource::Loop).await;
    let before = backend.snapshot("t1", "").await.unwrap();

    let fork = cp.branches().fork("t1", "", &c0, None).await.unwrap();
    assert!(!fork.is_active);
    assert!(fork.name.starts_with("fork-"));
    assert_eq!(fork.fork_point_id.as_deref(), Some(c0.as_str()));

    let after = backend.snapshot("t1", "").await.unwrap();
    assert_eq!(after.checkpoints, before.checkpoints);
    assert_eq!(after.branches[..before.branches.len()], before.branches[..]);
    assert_eq!(after.branches.len(), before.branches.len() + 1);
    assert_eq!(cp.branches().current_head("t1", "").await.unwrap(), Some(c1));
}

pub async fn time_travel_is_non_destructive(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend.clone());
    let c0 = append(&cp, "t1", "", CheckpointSource::Input).await;
    let c1 = append(&cp, "t1", "", CheckpointSource::Loop).await;
    let before = backend.snapshot("t1", "").await.unwrap();

    let retry = cp.branches().time_travel("t1", "", &c0, Some("retry")).await.unwrap();
    assert!(retry.is_active);
    assert_eq!(retry.name, "retry");
    assert_eq!(retry.head_checkpoint_id, c0);
    assert_eq!(cp.branches().current_head("t1", "").await.unwrap(), Some(c0.clone()));

    let after = backend.snapshot("t1", "").await.unwrap();
    assert_eq!(after.checkpoints, before.checkpoints);
    let main = after.branches.iter().find(|b| b.is_root()).unwrap();
    assert!(!main.is_active);
    assert_eq!(main.head_checkpoint_id, c1);

    let c2 = append(&cp, "t1", "", CheckpointSource::Update).await;
    let c2 = cp.store().get("t1", "", Some(&c2)).await.unwrap();
    assert_eq!(c2.parent_checkpoint_id.as_deref(), Some(c0.as_str()));
    assert_eq!(c2.step, 1);

    let err = cp.branches().time_travel("t1", "", "missing", None).await.unwrap_err();
    assert!(err.is_not_found());
    let still = cp.branches().active_branch("t1", "").await.unwrap().unwrap();
    assert_eq!(still.branch_id, retry.branch_id);
}

pub async fn switch_scenario_builds_tree(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    let c0 = append(&cp, "t1", "", CheckpointSource::Input).await;
    let c1 = append(&cp, "t1", "", CheckpointSource::Loop).await;

    let alt = cp.branches().fork("t1", "", &c0, Some("alt")).await.unwrap();
    assert!(!alt.is_active);

    let switched = cp.branches().switch_active("t1", "", &alt.branch_id).await.unwrap();
    assert!(switched.is_active);
    assert_eq!(cp.branches().current_head("t1", "").await.unwrap(), Some(c0.clone()));

    let c2 = append(&cp, "t1", "", CheckpointSource::Loop).await;
    assert_eq!(
        cp.store().get("t1", "", Some(&c2)).await.unwrap().parent_checkpoint_id,
        Some(c0.clone())
    );

    let tree = cp.history().full_tree("t1", "").await.unwrap();
    let ids: Vec<_> = tree.nodes.iter().map(|n| n.checkpoint_id.as_str()).collect();
    assert_eq!(ids, [c0.as_str(), c1.as_str(), c2.as_str()]);

    let children: HashSet<_> = tree
        .nodes
        .iter()
        .filter(|n| n.parent_id.as_deref() == Some(c0.as_str()))
        .map(|n| n.checkpoint_id.clone())
        .collect();
    assert_eq!(children, HashSet::from([c1, c2]));

    let root = &tree.nodes[0];
    assert_eq!(root.forks.len(), 1);
    assert_eq!(root.forks[0].branch_id, alt.branch_id);
    assert_eq!(root.forks[0].name, "alt");
    assert!(tree.nodes[1..].iter().all(|n| n.forks.is_empty()));
    assert_eq!(tree.branches.len(), 2);
}

pub async fn tree_lists_sibling_forks(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    let c0 = append(&cp, "t1", "", CheckpointSource::Input).await;
    append(&cp, "t1", "", CheckpointSource::Loop).await;

    let a = cp.branches().fork("t1", "", &c0, Some("a")).await.unwrap();
    let b = cp.branches().fork("t1", "", &c0, None).await.unwrap();
    assert_ne!(a.name, b.name);

    let tree = cp.history().full_tree("t1", "").await.unwrap();
    let root = tree
        .nodes
        .iter()
        .find(|n| n.checkpoint_id == c0)
        .expect("root node");
    let forked: Vec<_> = root.forks.iter().map(|f| f.branch_id.clone()).collect();
    assert_eq!(forked, [a.branch_id, b.branch_id]);
    assert_eq!(root.forks[1].name, b.name);
}

pub async fn switch_rejects_foreign_branch(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    let t1 = append(&cp, "t1", "", CheckpointSource::Input).await;
    append(&cp, "t2", "", CheckpointSource::Input).await;
    let fork = cp.branches().fork("t1", "", &t1, None).await.unwrap();

    let err = cp.branches().switch_active("t2", "", &fork.branch_id).await.unwrap_err();
    assert!(err.is_invalid_state(), "expected invalid state, got {err}");
    let err = cp.branches().switch_active("t1", "", "missing").await.unwrap_err();
    assert!(err.is_not_found(), "expected not found, got {err}");

    let active = cp.branches().active_branch("t1", "").await.unwrap().unwrap();
    assert!(active.is_root());
}

pub async fn advance_active_moves_forward(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    let c0 = append(&cp, "t1", "", CheckpointSource::Input).await;
    let c1 = append(&cp, "t1", "", CheckpointSource::Loop).await;
    let c2 = append(&cp, "t1", "", CheckpointSource::Loop).await;

    let travelled = cp.branches().time_travel("t1", "", &c0, None).await.unwrap();
    let advanced = cp.branches().advance_active("t1", "", &c2).await.unwrap();
    assert_eq!(advanced.branch_id, travelled.branch_id);
    assert_eq!(advanced.head_checkpoint_id, c2);

    let err = cp.branches().advance_active("t1", "", &c1).await.unwrap_err();
    assert!(err.is_invalid_state(), "expected invalid state, got {err}");
    assert_eq!(cp.branches().current_head("t1", "").await.unwrap(), Some(c2));
}

pub async fn get_missing_is_not_found(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    let err = cp.store().get("t1", "", Some("missing")).await.unwrap_err();
    assert!(err.is_not_found());
    let err = cp.store().get("t1", "", None).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(cp.store().list_chain("t1", "", None).await.unwrap().is_empty());

    append(&cp, "t1", "", CheckpointSource::Input).await;
    let err = cp.store().get("t1", "", Some("missing")).await.unwrap_err();
    assert!(err.is_not_found());
    let err = cp.branches().fork("t1", "", "missing", None).await.unwrap_err();
    assert!(err.is_not_found());
}

pub async fn namespaces_are_independent(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    let root = append(&cp, "t1", "", CheckpointSource::Input).await;
    let sub = append(&cp, "t1", "tools", CheckpointSource::Input).await;

    let sub_checkpoint = cp.store().get("t1", "tools", None).await.unwrap();
    assert_eq!(sub_checkpoint.checkpoint_id, sub);
    assert!(sub_checkpoint.parent_checkpoint_id.is_none());
    assert_eq!(cp.branches().current_head("t1", "").await.unwrap(), Some(root.clone()));

    let err = cp.branches().fork("t1", "", &sub, None).await.unwrap_err();
    assert!(err.is_invalid_state(), "expected invalid state, got {err}");
    assert_eq!(cp.branches().list_branches("t1", "tools").await.unwrap().len(), 1);
}

pub async fn delete_thread_removes_everything(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    let c0 = append(&cp, "t1", "", CheckpointSource::Input).await;
    append(&cp, "t1", "", CheckpointSource::Loop).await;
    append(&cp, "t1", "tools", CheckpointSource::Input).await;
    cp.branches().fork("t1", "", &c0, None).await.unwrap();
    let other = append(&cp, "t2", "", CheckpointSource::Input).await;

    cp.store().delete_thread("t1").await.unwrap();

    assert!(cp.store().list_chain("t1", "", None).await.unwrap().is_empty());
    assert!(cp.store().get("t1", "", Some(&c0)).await.unwrap_err().is_not_found());
    assert!(cp.branches().list_branches("t1", "").await.unwrap().is_empty());
    assert!(cp.branches().list_branches("t1", "tools").await.unwrap().is_empty());
    assert_eq!(cp.history().thread_summary("t1").await.unwrap().checkpoint_count, 0);
    assert_eq!(cp.branches().current_head("t2", "").await.unwrap(), Some(other));

    cp.store().delete_thread("t1").await.unwrap();

    // A deleted thread starts over from a fresh root.
    let fresh = append(&cp, "t1", "", CheckpointSource::Input).await;
    let fresh = cp.store().get("t1", "", Some(&fresh)).await.unwrap();
    assert!(fresh.parent_checkpoint_id.is_none());
    assert_eq!(fresh.step, 0);
}

pub async fn history_queries(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    let input = Payload::new().with_channel(
        MESSAGES_CHANNEL,
        json!([{"type": "human", "content": "What's the weather?"}]),
    );
    let reply = Payload::new().with_channel(
        MESSAGES_CHANNEL,
        json!([
            {"type": "human", "content": "What's the weather?"},
            {"type": "ai", "content": "", "tool_calls": [{"name": "weather", "args": {}, "id": "call-1"}]},
            {"type": "tool", "content": "sunny", "tool_call_id": "call-1"}
        ]),
    );

    let c0 = cp
        .runner()
        .input("t1", "", input)
        .await
        .unwrap();
    let mut metadata = Metadata::new();
    metadata.insert("writes".into(), json!({"agent": 1}));
    let c1 = cp
        .store()
        .append_to_active("t1", "", CheckpointSource::Loop, reply.clone(), metadata.clone())
        .await
        .unwrap();

    let summaries = cp.history().checkpoint_summaries("t1", "").await.unwrap();
    let rows: Vec<_> = summaries
        .iter()
        .map(|s| (s.checkpoint_id.as_str(), s.step, s.source, s.message_count))
        .collect();
    assert_eq!(
        rows,
        [
            (c1.as_str(), 1, CheckpointSource::Loop, 3),
            (c0.as_str(), 0, CheckpointSource::Input, 1)
        ]
    );

    let detail = cp.history().checkpoint_detail("t1", "", &c1).await.unwrap();
    assert_eq!(detail.parent_checkpoint_id.as_deref(), Some(c0.as_str()));
    assert_eq!(detail.checkpoint.payload, reply);
    assert_eq!(detail.checkpoint.metadata, metadata);
    let roles: Vec<_> = detail.messages.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, ["user", "assistant", "tool"]);
    assert_eq!(detail.messages[1].tool_calls.as_ref().map(Vec::len), Some(1));

    let head = cp.history().head_messages("t1", "").await.unwrap();
    assert_eq!(head, detail.messages);

    let alt = cp.branches().fork("t1", "", &c0, None).await.unwrap();
    let (branch, messages) = cp
        .history()
        .switch_and_load("t1", "", &alt.branch_id)
        .await
        .unwrap();
    assert!(branch.is_active);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "What's the weather?");
}

pub async fn thread_listing(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    assert!(cp.history().list_threads().await.unwrap().is_empty());

    append(&cp, "older", "", CheckpointSource::Input).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    append(&cp, "newer", "", CheckpointSource::Input).await;
    append(&cp, "newer", "", CheckpointSource::Loop).await;

    let threads = cp.history().list_threads().await.unwrap();
    let order: Vec<_> = threads.iter().map(|t| t.thread_id.as_str()).collect();
    assert_eq!(order, ["newer", "older"]);
    assert_eq!(threads[0].checkpoint_count, 2);
    assert!(threads[0].last_activity >= Some(threads[0].created_at));

    let empty = cp.history().thread_summary("unknown").await.unwrap();
    assert_eq!(empty.thread_id, "unknown");
    assert_eq!(empty.checkpoint_count, 0);
    assert!(empty.last_activity.is_none());
}

/// Racing `append_to_active` calls must line up into one linear chain.
pub async fn concurrent_appends_serialize(backend: Arc<dyn CheckpointBackend>) {
    let cp = checkpointer(backend);
    append(&cp, "t1", "", CheckpointSource::Input).await;

    let writers: Vec<_> = (0..CONCURRENT_WRITERS)
        .map(|i| {
            let cp = cp.clone();
            tokio::spawn(async move {
                cp.store()
                    .append_to_active(
                        "t1",
                        "",
                        CheckpointSource::Loop,
                        said("ai", &format!("writer {i}")),
                        Metadata::new(),
                    )
                    .await
            })
        })
        .collect();

    let ids: Vec<String> = futures::future::join_all(writers)
        .await
        .into_iter()
        .map(|joined| joined.expect("writer task").expect("append under contention"))
        .collect();
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), CONCURRENT_WRITERS);

    let chain = cp.store().list_chain("t1", "", None).await.unwrap();
    assert_eq!(chain.len(), CONCURRENT_WRITERS + 1);

    let parents: HashSet<_> = chain
        .iter()
        .filter_map(|c| c.parent_checkpoint_id.as_deref())
        .collect();
    assert_eq!(parents.len(), CONCURRENT_WRITERS);

    let tree = cp.history().full_tree("t1", "").await.unwrap();
    assert_eq!(tree.nodes.len(), CONCURRENT_WRITERS + 1);
    let mut children = HashSet::new();
    for node in &tree.nodes {
        if let Some(parent) = &node.parent_id {
            assert!(children.insert(parent.clone()), "sibling under {parent}");
        }
    }

    let steps: Vec<_> = chain.iter().rev().map(|c| c.step).collect();
    assert_eq!(steps, (0..=CONCURRENT_WRITERS as i64).collect::<Vec<_>>());
}
