use std::sync::Arc;

use agent_graph_checkpoint::{CheckpointBackend, InMemorySaver};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_memory_saver_conformance() {
    agent_graph_checkpoint_conformance::run_all(|| async {
        Arc::new(InMemorySaver::new()) as Arc<dyn CheckpointBackend>
    })
    .await;
}
