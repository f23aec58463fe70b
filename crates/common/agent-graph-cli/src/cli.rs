use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "agent-graph")]
#[command(about = "Inspect and rewind agent-graph conversation checkpoints. Output is JSON on stdout.")]
pub(crate) struct Cli {
    /// Path to the SQLite checkpoint database.
    #[arg(long, global = true, env = "AGENT_GRAPH_DATABASE", default_value = "agent-graph.db")]
    pub(crate) database: PathBuf,

    /// Checkpoint namespace within each thread (default: root namespace).
    #[arg(long, global = true, default_value = "")]
    pub(crate) namespace: String,

    /// Per-operation timeout, e.g. `500ms` or `10s`.
    #[arg(long, global = true, value_parser = parse_duration)]
    pub(crate) timeout: Option<Duration>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub(crate) enum Command {
    /// List threads, most recently active first.
    Threads,
    /// Rollup for one thread.
    Summary { thread: String },
    /// Checkpoint summaries along the active branch, newest first.
    History { thread: String },
    /// Full checkpoint with its messages.
    Show { thread: String, checkpoint: String },
    /// Messages at the active head.
    Messages { thread: String },
    /// Branches of a thread.
    Branches { thread: String },
    /// Every checkpoint and branch of a thread.
    Tree { thread: String },
    /// Create an inactive branch at a checkpoint.
    Fork {
        thread: String,
        checkpoint: String,
        /// Branch name (default: fork-<id prefix>).
        #[arg(long)]
        name: Option<String>,
    },
    /// Make a branch active and print its head messages.
    Switch { thread: String, branch: String },
    /// Fork at a checkpoint and make the new branch active.
    TimeTravel {
        thread: String,
        checkpoint: String,
        /// Branch name (default: fork-<id prefix>).
        #[arg(long)]
        name: Option<String>,
    },
    /// Irreversibly delete a thread and all of its history.
    Delete { thread: String },
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(raw).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "agent-graph",
            "time-travel",
            "t1",
            "c0",
            "--name",
            "retry",
            "--namespace",
            "tools",
            "--timeout",
            "250ms",
            "--database",
            "/tmp/cp.db",
        ])
        .unwrap();

        assert_eq!(cli.namespace, "tools");
        assert_eq!(cli.timeout, Some(Duration::from_millis(250)));
        assert_eq!(cli.database, PathBuf::from("/tmp/cp.db"));
        assert_eq!(
            cli.command,
            Command::TimeTravel {
                thread: "t1".into(),
                checkpoint: "c0".into(),
                name: Some("retry".into()),
            }
        );
    }

    #[test]
    fn test_rejects_bad_timeout() {
        assert!(Cli::try_parse_from(["agent-graph", "threads", "--timeout", "soon"]).is_err());
    }
}
