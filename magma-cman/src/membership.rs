use std::fmt::{Display, Formatter};

use crate::node::ClusterNode;

/// Count and wrapping id sum over the live members of a node list.
///
/// Two digests compare equal when the member set is very likely unchanged,
/// which spares a full list comparison on every membership notification.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct MembershipDigest {
    pub count: i32,
    pub sum: u64,
}

impl MembershipDigest {
    pub fn from_nodes<'a, I>(nodes: I) -> Self where I: IntoIterator<Item=&'a ClusterNode> {
        nodes.into_iter()
            .filter(|node| node.is_member())
            .fold(Self::default(), |digest, node| Self {
                count: digest.count.wrapping_add(1),
                sum: digest.sum.wrapping_add(node.node_id as u64),
            })
    }
}

impl Display for MembershipDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MembershipDigest(count={},sum={})", self.count, self.sum)
    }
}
