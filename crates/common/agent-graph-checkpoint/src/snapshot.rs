//! Arena-style traversal over a [`ThreadSnapshot`].
//!
//! Checkpoints reference their parent by id only; every walk resolves ids
//! through the snapshot's index, so a chain walk or a tree build costs one
//! pass over the conversation instead of a point lookup per hop.

use crate::error::{CheckpointError, Result};
use crate::types::{Branch, Checkpoint, ThreadSnapshot};

impl ThreadSnapshot {
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn checkpoint(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.checkpoints.get(checkpoint_id)
    }

    pub fn active_branch(&self) -> Option<&Branch> {
        self.branches.iter().find(|b| b.is_active)
    }

    pub fn branch(&self, branch_id: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.branch_id == branch_id)
    }

    /// Walk parent links from `from` back to the root, most recent first.
    ///
    /// A dangling parent ends the walk; a cycle is reported as corrupt state.
    pub fn chain_from(&self, from: &str) -> Result<Vec<&Checkpoint>> {
        let mut chain = Vec::new();
        let mut cursor = Some(from);

        while let Some(id) = cursor {
            let Some(checkpoint) = self.checkpoints.get(id) else {
                break;
            };
            if chain.len() >= self.checkpoints.len() {
                return Err(CheckpointError::invalid_state(format!(
                    "parent cycle detected at checkpoint {id}"
                )));
            }
            chain.push(checkpoint);
            cursor = checkpoint.parent_checkpoint_id.as_deref();
        }

        Ok(chain)
    }

    /// Whether `ancestor` lies on the parent chain of `descendant`
    /// (a checkpoint counts as its own ancestor).
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        Ok(self
            .chain_from(descendant)?
            .iter()
            .any(|c| c.checkpoint_id == ancestor))
    }

    /// Checkpoints whose parent is `checkpoint_id`, in creation order.
    pub fn children_of<'a>(&'a self, checkpoint_id: &'a str) -> impl Iterator<Item = &'a Checkpoint> {
        self.checkpoints
            .values()
            .filter(move |c| c.parent_checkpoint_id.as_deref() == Some(checkpoint_id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{CheckpointSource, Metadata, Payload};

    fn checkpoint(id: &str, parent: Option<&str>, step: i64) -> Checkpoint {
        Checkpoint {
            thread_id: "t1".to_string(),
            namespace: String::new(),
            checkpoint_id: id.to_string(),
            parent_checkpoint_id: parent.map(str::to_string),
            step,
            source: CheckpointSource::Loop,
            payload: Payload::new(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    fn snapshot(checkpoints: Vec<Checkpoint>) -> ThreadSnapshot {
        ThreadSnapshot {
            checkpoints: checkpoints
                .into_iter()
                .map(|c| (c.checkpoint_id.clone(), c))
                .collect(),
            branches: Vec::new(),
        }
    }

    #[test]
    fn test_chain_from_walks_to_root() {
        let snap = snapshot(vec![
            checkpoint("c0", None, 0),
            checkpoint("c1", Some("c0"), 1),
            checkpoint("c2", Some("c0"), 1),
            checkpoint("c3", Some("c1"), 2),
        ]);

        let ids: Vec<_> = snap
            .chain_from("c3")
            .unwrap()
            .iter()
            .map(|c| c.checkpoint_id.as_str())
            .collect();
        assert_eq!(ids, ["c3", "c1", "c0"]);

        assert!(snap.is_ancestor("c0", "c3").unwrap());
        assert!(snap.is_ancestor("c3", "c3").unwrap());
        assert!(!snap.is_ancestor("c2", "c3").unwrap());

        let children: Vec<_> = snap.children_of("c0").map(|c| c.checkpoint_id.as_str()).collect();
        assert_eq!(children, ["c1", "c2"]);
    }

    #[test]
    fn test_chain_from_unknown_is_empty() {
        let snap = snapshot(vec![checkpoint("c0", None, 0)]);
        assert!(snap.chain_from("missing").unwrap().is_empty());
    }

    #[test]
    fn test_cycle_is_reported() {
        let snap = snapshot(vec![
            checkpoint("a", Some("b"), 0),
            checkpoint("b", Some("a"), 1),
        ]);
        assert!(snap.chain_from("a").unwrap_err().is_invalid_state());
    }
}
