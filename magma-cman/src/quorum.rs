use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Last observed quorum status of the cluster.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum QuorumState {
    Quorate,
    Inquorate,
    Unknown,
}

impl Default for QuorumState {
    fn default() -> Self {
        QuorumState::Unknown
    }
}

impl QuorumState {
    pub fn is_quorate(&self) -> bool {
        matches!(self, QuorumState::Quorate)
    }

    /// Integer flag form: `1` quorate, `0` inquorate, `-1` unknown.
    pub fn as_flag(&self) -> i32 {
        match self {
            QuorumState::Quorate => 1,
            QuorumState::Inquorate => 0,
            QuorumState::Unknown => -1,
        }
    }

    pub fn from_flag(flag: i32) -> Self {
        match flag {
            0 => QuorumState::Inquorate,
            flag if flag > 0 => QuorumState::Quorate,
            _ => QuorumState::Unknown,
        }
    }
}

impl From<bool> for QuorumState {
    fn from(quorate: bool) -> Self {
        if quorate {
            QuorumState::Quorate
        } else {
            QuorumState::Inquorate
        }
    }
}

impl Display for QuorumState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            QuorumState::Quorate => write!(f, "quorate"),
            QuorumState::Inquorate => write!(f, "inquorate"),
            QuorumState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Answer to a quorum status query.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct QuorumStatus {
    pub state: QuorumState,
    pub group_member: bool,
}

/// Votes needed for quorum given the expected vote count.
pub fn quorum_votes(expected_votes: u64) -> u64 {
    expected_votes / 2 + 1
}
