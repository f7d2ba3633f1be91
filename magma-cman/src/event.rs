use std::fmt::{Display, Formatter};

/// Event handed back to the plugin caller by `get_event`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ClusterEvent {
    Null,
    MembershipChange,
    Quorate,
    Inquorate,
    Shutdown,
}

impl ClusterEvent {
    pub fn is_null(&self) -> bool {
        matches!(self, ClusterEvent::Null)
    }
}

impl Display for ClusterEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClusterEvent::Null => "null",
            ClusterEvent::MembershipChange => "membership change",
            ClusterEvent::Quorate => "quorate",
            ClusterEvent::Inquorate => "inquorate",
            ClusterEvent::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}
