use std::net::SocketAddr;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CmanError, Result};
use crate::lockspace::LockSpace;
use crate::membership::MembershipDigest;
use crate::quorum::QuorumState;
use crate::socket::CmanSocket;

/// Private state of one plugin connection.
///
/// The socket and the lock-space are owned here and given back exactly once,
/// either by [`CmanPrivate::teardown`] or when the record is dropped. The
/// remaining fields are plain last observed values maintained by the plugin.
#[derive(Debug, Default)]
pub struct CmanPrivate {
    socket: Option<CmanSocket>,
    quorum_state: QuorumState,
    memb_count: i32,
    memb_sum: u64,
    lockspace: Option<LockSpace>,
}

impl CmanPrivate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quorum_state(&self) -> QuorumState {
        self.quorum_state
    }

    pub fn set_quorum_state(&mut self, quorum_state: QuorumState) {
        self.quorum_state = quorum_state;
    }

    pub fn memb_count(&self) -> i32 {
        self.memb_count
    }

    pub fn set_memb_count(&mut self, memb_count: i32) {
        self.memb_count = memb_count;
    }

    pub fn memb_sum(&self) -> u64 {
        self.memb_sum
    }

    pub fn set_memb_sum(&mut self, memb_sum: u64) {
        self.memb_sum = memb_sum;
    }

    pub fn digest(&self) -> MembershipDigest {
        MembershipDigest {
            count: self.memb_count,
            sum: self.memb_sum,
        }
    }

    pub fn set_digest(&mut self, digest: MembershipDigest) {
        self.memb_count = digest.count;
        self.memb_sum = digest.sum;
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn attach_socket(&mut self, socket: CmanSocket) -> Result<()> {
        if self.socket.is_some() {
            return Err(CmanError::AlreadyOpen);
        }
        self.socket = Some(socket);
        Ok(())
    }

    pub fn attach_lockspace(&mut self, lockspace: LockSpace) -> Result<()> {
        if self.lockspace.is_some() {
            return Err(CmanError::AlreadyOpen);
        }
        self.lockspace = Some(lockspace);
        Ok(())
    }

    pub fn socket(&self) -> Result<&CmanSocket> {
        self.socket.as_ref().ok_or(CmanError::NotConnected)
    }

    pub fn socket_mut(&mut self) -> Result<&mut CmanSocket> {
        self.socket.as_mut().ok_or(CmanError::NotConnected)
    }

    pub fn lockspace(&self) -> Result<&LockSpace> {
        self.lockspace.as_ref().ok_or(CmanError::NotConnected)
    }

    /// Closes the socket, then releases the lock-space. Both are attempted even
    /// when the first fails; the first error is returned.
    pub async fn teardown(&mut self) -> Result<()> {
        let socket_result = match self.socket.take() {
            Some(socket) => socket.close().await,
            None => Ok(()),
        };
        let lockspace_result = match self.lockspace.take() {
            Some(lockspace) => lockspace.release().await,
            None => Ok(()),
        };
        if let Some(error) = socket_result.as_ref().err() {
            warn!("close cluster manager socket error {:?}", error);
        }
        if let Some(error) = lockspace_result.as_ref().err() {
            warn!("release lockspace error {:?}", error);
        }
        debug!("private state torn down");
        socket_result.and(lockspace_result)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            peer: self.socket.as_ref().map(|socket| socket.peer()),
            quorum_state: self.quorum_state,
            memb_count: self.memb_count,
            memb_sum: self.memb_sum,
            lockspace: self.lockspace.as_ref().map(|lockspace| lockspace.name().to_string()),
        }
    }
}

/// Plain copy of [`CmanPrivate`] with the handles reduced to what identifies them.
#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub peer: Option<SocketAddr>,
    pub quorum_state: QuorumState,
    pub memb_count: i32,
    pub memb_sum: u64,
    pub lockspace: Option<String>,
}
