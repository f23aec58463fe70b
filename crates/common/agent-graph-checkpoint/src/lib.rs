//! Branchable checkpoint store for long-running agent conversations.
//!
//! Every step of a conversation is persisted as an immutable [`Checkpoint`]
//! whose parent is the previous step. Checkpoints of one
//! `(thread_id, namespace)` form a tree; named [`Branch`] pointers select a
//! path through it, and exactly one branch is active at a time.
//!
//! ```ignore
//! use agent_graph_checkpoint::{Checkpointer, CheckpointSource, InMemorySaver, Metadata, Payload};
//!
//! let checkpointer = Checkpointer::new(InMemorySaver::new());
//! let store = checkpointer.store();
//!
//! let c0 = store
//!     .append_to_active("t1", "", CheckpointSource::Input, Payload::new(), Metadata::new())
//!     .await?;
//! store
//!     .append_to_active("t1", "", CheckpointSource::Loop, Payload::new(), Metadata::new())
//!     .await?;
//!
//! // Rewind without losing anything: the old continuation stays on `main`.
//! let retry = checkpointer.branches().time_travel("t1", "", &c0, Some("retry")).await?;
//! let tree = checkpointer.history().full_tree("t1", "").await?;
//! ```

pub mod backend;
pub mod branch;
pub mod checkpointer;
pub mod config;
pub mod error;
pub mod history;
pub mod memory;
pub mod messages;
pub mod runner;
mod snapshot;
pub mod store;
pub mod types;

pub use backend::{CheckpointBackend, default_branch_name, new_id};
pub use branch::BranchManager;
pub use checkpointer::Checkpointer;
pub use config::CheckpointConfig;
pub use error::{CheckpointError, ErrorKind, Result};
pub use history::{
    CheckpointDetail, CheckpointSummary, CheckpointTree, ForkLabel, HistoryQuery, TreeNode,
};
pub use memory::InMemorySaver;
pub use messages::{MessageView, extract_messages};
pub use runner::{Produced, StateProducer, StepRunner};
pub use store::CheckpointStore;
pub use types::{
    Branch, Checkpoint, CheckpointSource, MESSAGES_CHANNEL, Metadata, NewBranch, NewCheckpoint,
    PAYLOAD_VERSION, Payload, ROOT_BRANCH_NAME, ThreadSnapshot, ThreadSummary,
};
