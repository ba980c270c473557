//! Cluster View
//!
//! Immutable snapshot of the membership the coordinator currently
//! believes in. Views are replaced wholesale, never mutated, so any
//! reader holding an `Arc<ClusterView>` sees a consistent member list.

use std::fmt;

use crate::channel::NodeId;

/// An ordered, duplicate-free member set tagged with a monotonically
/// increasing view id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    id: u64,
    members: Vec<NodeId>,
}

impl ClusterView {
    /// The view that exists right after channel connect: just the
    /// local node.
    pub(crate) fn initial(local: NodeId) -> Self {
        Self {
            id: 1,
            members: vec![local],
        }
    }

    /// Successor view with the given membership. Strictly increments
    /// the view id; sorts and deduplicates members.
    pub(crate) fn next(&self, mut members: Vec<NodeId>) -> Self {
        members.sort();
        members.dedup();
        Self {
            id: self.id + 1,
            members,
        }
    }

    /// Normalize a raw member list the way `next` would, for change
    /// detection before deciding to bump the view id.
    pub(crate) fn normalize(mut members: Vec<NodeId>) -> Vec<NodeId> {
        members.sort();
        members.dedup();
        members
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.binary_search(node).is_ok()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl fmt::Display for ClusterView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view #{} [", self.id)?;
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(m.as_str())?;
        }
        f.write_str("]")
    }
}
