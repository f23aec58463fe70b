//! `agent-graph`: command-line access to a SQLite checkpoint database.
//!
//! Logs go to stderr: `agent_graph*` targets at debug in debug builds and
//! info in release, everything else at warn. Settings may also come from a
//! `.env` file (`AGENT_GRAPH_DATABASE`, `CHECKPOINT_OPERATION_TIMEOUT`).

mod cli;
mod commands;

use std::sync::Arc;

use agent_graph_checkpoint::{CheckpointConfig, Checkpointer};
use agent_graph_checkpoint_sqlite::{SqliteConfig, SqliteSaver};
use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let app_level = if cfg!(debug_assertions) {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let global_filter = Targets::new()
        .with_default(LevelFilter::WARN)
        .with_target("agent_graph", app_level)
        .with_target("sqlx", LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(global_filter)
        .try_init()
        .context("failed to initialize logging")?;

    let mut config = CheckpointConfig::from_env()?;
    if let Some(timeout) = cli.timeout {
        config = config.with_operation_timeout(timeout);
    }

    let saver = SqliteSaver::connect(&SqliteConfig::new(&cli.database))
        .await
        .with_context(|| format!("failed to open {}", cli.database.display()))?;
    let checkpointer = Checkpointer::with_config(Arc::new(saver.clone()), config);

    let result = commands::run(cli.command, &checkpointer, &cli.namespace).await;
    saver.close().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
