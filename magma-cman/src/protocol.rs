use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};

use crate::codec::Packet;
use crate::error::Result;
use crate::ext::{decode_bytes, encode_bytes};
use crate::node::ClusterNode;

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub enum CmanRequest {
    Register { name: String, votes: u32 },
    GetNodes,
    GetQuorum,
    JoinGroup { group: String },
    LeaveGroup { group: String },
    Fence { node_id: u32 },
}

impl Display for CmanRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CmanRequest::Register { name, votes } => write!(f, "Register({},{})", name, votes),
            CmanRequest::GetNodes => write!(f, "GetNodes"),
            CmanRequest::GetQuorum => write!(f, "GetQuorum"),
            CmanRequest::JoinGroup { group } => write!(f, "JoinGroup({})", group),
            CmanRequest::LeaveGroup { group } => write!(f, "LeaveGroup({})", group),
            CmanRequest::Fence { node_id } => write!(f, "Fence({})", node_id),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub enum CmanReply {
    Registered { node_id: u32 },
    Nodes(Vec<ClusterNode>),
    Quorum { quorate: bool, votes: u64, expected_votes: u64 },
    Done,
    Error(String),
}

impl CmanReply {
    pub fn name(&self) -> &'static str {
        match self {
            CmanReply::Registered { .. } => "Registered",
            CmanReply::Nodes(_) => "Nodes",
            CmanReply::Quorum { .. } => "Quorum",
            CmanReply::Done => "Done",
            CmanReply::Error(_) => "Error",
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Encode, Decode)]
pub enum Notification {
    MembershipChanged,
    QuorumChanged { quorate: bool },
    Shutdown,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub enum ClientFrame {
    Request { id: u64, request: CmanRequest },
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub enum ServerFrame {
    Reply { id: u64, reply: CmanReply },
    Notify(Notification),
}

pub trait FrameExt: Encode + Decode + Sized {
    fn to_packet(&self) -> Result<Packet> {
        Ok(Packet::new(encode_bytes(self)?))
    }

    fn from_packet(packet: &Packet) -> Result<Self> {
        decode_bytes(packet)
    }
}

impl FrameExt for ClientFrame {}

impl FrameExt for ServerFrame {}
