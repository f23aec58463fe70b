//! Request layer: one checkpoint operation per subcommand, rendered as JSON.

use agent_graph_checkpoint::Checkpointer;
use anyhow::Result;
use serde_json::{Value, json};
use tracing::debug;

use crate::cli::Command;

pub(crate) async fn run(command: Command, checkpointer: &Checkpointer, namespace: &str) -> Result<Value> {
    debug!(?command, namespace, "Running command");

    let branches = checkpointer.branches();
    let history = checkpointer.history();

    let output = match command {
        Command::Threads => serde_json::to_value(history.list_threads().await?)?,
        Command::Summary { thread } => serde_json::to_value(history.thread_summary(&thread).await?)?,
        Command::History { thread } => {
            serde_json::to_value(history.checkpoint_summaries(&thread, namespace).await?)?
        }
        Command::Show { thread, checkpoint } => serde_json::to_value(
            history
                .checkpoint_detail(&thread, namespace, &checkpoint)
                .await?,
        )?,
        Command::Messages { thread } => {
            serde_json::to_value(history.head_messages(&thread, namespace).await?)?
        }
        Command::Branches { thread } => {
            serde_json::to_value(branches.list_branches(&thread, namespace).await?)?
        }
        Command::Tree { thread } => serde_json::to_value(history.full_tree(&thread, namespace).await?)?,
        Command::Fork {
            thread,
            checkpoint,
            name,
        } => serde_json::to_value(
            branches
                .fork(&thread, namespace, &checkpoint, name.as_deref())
                .await?,
        )?,
        Command::Switch { thread, branch } => {
            let (branch, messages) = history.switch_and_load(&thread, namespace, &branch).await?;
            json!({ "branch": branch, "messages": messages })
        }
        Command::TimeTravel {
            thread,
            checkpoint,
            name,
        } => serde_json::to_value(
            branches
                .time_travel(&thread, namespace, &checkpoint, name.as_deref())
                .await?,
        )?,
        Command::Delete { thread } => {
            checkpointer.store().delete_thread(&thread).await?;
            json!({ "deleted": thread })
        }
    };

    Ok(output)
}
