use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum NodeState {
    Member,
    Dead,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: u32,
    pub name: String,
    pub votes: u32,
    pub state: NodeState,
    pub groups: BTreeSet<String>,
}

impl ClusterNode {
    pub fn new(node_id: u32, name: impl Into<String>, votes: u32) -> Self {
        Self {
            node_id,
            name: name.into(),
            votes,
            state: NodeState::Member,
            groups: BTreeSet::new(),
        }
    }

    pub fn is_member(&self) -> bool {
        matches!(self.state, NodeState::Member)
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

impl Display for ClusterNode {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "ClusterNode({},{},{:?})", self.node_id, self.name, self.state)
    }
}
