use std::net::SocketAddr;

use bincode::error::{DecodeError, EncodeError};
use thiserror::Error;

use crate::lockspace::LockSpaceId;

pub type Result<T, E = CmanError> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum CmanError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode {0} error: {1}")]
    Encode(&'static str, EncodeError),
    #[error("decode {0} error: {1}")]
    Decode(&'static str, DecodeError),
    #[error("packet of {0} bytes exceeds the {1} bytes limit")]
    PacketTooLarge(usize, usize),
    #[error("cannot connect to cluster manager {addr} after {attempts} attempts")]
    ConnectFailed { addr: SocketAddr, attempts: u32 },
    #[error("connection to cluster manager closed")]
    Disconnected,
    #[error("cluster manager request {0} timed out")]
    RequestTimeout(u64),
    #[error("cluster manager rejected request: {0}")]
    Daemon(String),
    #[error("unexpected reply {0} from cluster manager")]
    UnexpectedReply(String),
    #[error("plugin session is already open")]
    AlreadyOpen,
    #[error("plugin session is not connected")]
    NotConnected,
    #[error("cluster is not quorate")]
    NotQuorate,
    #[error("resource {0} is locked by another holder")]
    LockBusy(String),
    #[error("lock on resource {0} timed out")]
    LockTimeout(String),
    #[error("lock {0} is not held")]
    LockNotHeld(u64),
    #[error("unknown lockspace {0}")]
    UnknownLockSpace(LockSpaceId),
    #[error("already logged in to group {0}")]
    AlreadyLoggedIn(String),
    #[error("not logged in to any group")]
    NotLoggedIn,
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
}
