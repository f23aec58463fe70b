//! SQLite backend for the agent-graph checkpoint store.
//!
//! ```ignore
//! use agent_graph_checkpoint::Checkpointer;
//! use agent_graph_checkpoint_sqlite::{SqliteConfig, SqliteSaver};
//!
//! let saver = SqliteSaver::connect(&SqliteConfig::new("./data/checkpoints.db")).await?;
//! let checkpointer = Checkpointer::new(saver);
//! let threads = checkpointer.history().list_threads().await?;
//! ```

mod config;
mod error;
mod saver;

pub use config::SqliteConfig;
pub use error::SqliteError;
pub use saver::SqliteSaver;
