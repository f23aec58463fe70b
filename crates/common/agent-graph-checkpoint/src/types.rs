//! Data model shared by every backend and component.

use std::str::FromStr;

use bon::Builder;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CheckpointError;

/// Name of the branch materialized with a conversation's first checkpoint.
pub const ROOT_BRANCH_NAME: &str = "main";

/// Channel the presentation layer reads messages from.
pub const MESSAGES_CHANNEL: &str = "messages";

pub const PAYLOAD_VERSION: u32 = 1;

/// Free-form producer metadata attached to a checkpoint.
pub type Metadata = IndexMap<String, Value>;

/// How the step that produced a checkpoint came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Client input recorded before the producer ran.
    Input,
    /// Output of one producer step.
    Loop,
    /// Manual state edit.
    Update,
}

impl CheckpointSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointSource::Input => "input",
            CheckpointSource::Loop => "loop",
            CheckpointSource::Update => "update",
        }
    }
}

impl std::fmt::Display for CheckpointSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointSource {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(CheckpointSource::Input),
            "loop" => Ok(CheckpointSource::Loop),
            "update" => Ok(CheckpointSource::Update),
            other => Err(CheckpointError::invalid_state(format!(
                "unknown checkpoint source '{other}'"
            ))),
        }
    }
}

/// Opaque producer state.
///
/// The store only ever looks at `channel_values` as an ordered key/value
/// document; the shape of each channel belongs to the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub v: u32,
    #[serde(default)]
    pub channel_values: IndexMap<String, Value>,
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}

impl Payload {
    pub fn new() -> Self {
        Self {
            v: PAYLOAD_VERSION,
            channel_values: IndexMap::new(),
        }
    }

    pub fn with_channel(mut self, name: impl Into<String>, value: Value) -> Self {
        self.channel_values.insert(name.into(), value);
        self
    }

    pub fn channel(&self, name: &str) -> Option<&Value> {
        self.channel_values.get(name)
    }

    /// Raw entries of the `messages` channel, empty when absent or not a list.
    pub fn messages(&self) -> &[Value] {
        self.channel(MESSAGES_CHANNEL)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn message_count(&self) -> usize {
        self.messages().len()
    }
}

/// Immutable snapshot of a conversation at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub namespace: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    pub step: i64,
    pub source: CheckpointSource,
    pub payload: Payload,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// Named, movable pointer into a conversation's checkpoint tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub branch_id: String,
    pub thread_id: String,
    pub namespace: String,
    pub name: String,
    /// `None` only for the root branch.
    pub fork_point_id: Option<String>,
    pub head_checkpoint_id: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub fn is_root(&self) -> bool {
        self.fork_point_id.is_none()
    }

    pub fn belongs_to(&self, thread_id: &str, namespace: &str) -> bool {
        self.thread_id == thread_id && self.namespace == namespace
    }
}

/// Write request handed to a backend's `append`.
#[derive(Debug, Clone, Builder)]
pub struct NewCheckpoint {
    #[builder(into)]
    pub thread_id: String,
    #[builder(into, default)]
    pub namespace: String,
    /// The caller's view of the active head; `None` starts a new chain.
    #[builder(into)]
    pub parent_checkpoint_id: Option<String>,
    pub step: i64,
    pub source: CheckpointSource,
    #[builder(default)]
    pub payload: Payload,
    #[builder(default)]
    pub metadata: Metadata,
}

/// Write request handed to a backend's `create_branch`.
#[derive(Debug, Clone)]
pub struct NewBranch {
    pub thread_id: String,
    pub namespace: String,
    pub source_checkpoint_id: String,
    pub name: Option<String>,
}

/// Every checkpoint and branch of one `(thread_id, namespace)`, read at a
/// single point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadSnapshot {
    /// Keyed by checkpoint id, in creation order.
    pub checkpoints: IndexMap<String, Checkpoint>,
    /// In creation order.
    pub branches: Vec<Branch>,
}

/// Per-thread rollup used by thread listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    pub checkpoint_count: u64,
}

impl ThreadSummary {
    /// Summary of a conversation that has not written anything yet.
    pub fn empty(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            created_at: Utc::now(),
            last_activity: None,
            checkpoint_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_round_trips_through_str() {
        for source in [
            CheckpointSource::Input,
            CheckpointSource::Loop,
            CheckpointSource::Update,
        ] {
            assert_eq!(source.as_str().parse::<CheckpointSource>().unwrap(), source);
        }
        assert!("fork".parse::<CheckpointSource>().is_err());
    }

    #[test]
    fn test_payload_preserves_channel_order() {
        let payload = Payload::new()
            .with_channel("zeta", json!(1))
            .with_channel("alpha", json!(2));

        let encoded = serde_json::to_string(&payload).unwrap();
        assert_eq!(
            encoded,
            r#"{"v":1,"channel_values":{"zeta":1,"alpha":2}}"#
        );
    }

    #[test]
    fn test_message_count_tolerates_odd_shapes() {
        assert_eq!(Payload::new().message_count(), 0);
        assert_eq!(
            Payload::new()
                .with_channel(MESSAGES_CHANNEL, json!("not a list"))
                .message_count(),
            0
        );
        assert_eq!(
            Payload::new()
                .with_channel(MESSAGES_CHANNEL, json!([{"type": "human"}, {"type": "ai"}]))
                .message_count(),
            2
        );
    }

    #[test]
    fn test_new_checkpoint_builder_defaults() {
        let new = NewCheckpoint::builder()
            .thread_id("t1")
            .step(0)
            .source(CheckpointSource::Input)
            .build();

        assert_eq!(new.namespace, "");
        assert!(new.parent_checkpoint_id.is_none());
        assert_eq!(new.payload, Payload::new());
    }
}
