//! CMAN cluster plugin.
//!
//! Per-connection private state for a cluster membership plugin that talks to
//! a cluster manager daemon over a socket and locks through a distributed lock
//! manager lock-space.
//!
//! - [`private::CmanPrivate`] - the session record (socket, quorum state,
//!   membership count and sum, lock-space)
//! - [`plugin::CmanPlugin`] - plugin operations built on top of it
//! - [`service::CmanService`] - a small cluster manager daemon speaking the
//!   same [`protocol`]
//! - [`lockspace::LockManager`] - lock manager seam, backed by
//!   [`memory_lock::MemoryLockManager`] or [`etcd_lock::EtcdLockManager`]

pub const CMAN_CONFIG: &'static str = include_str!("../cman.toml");

pub mod codec;
pub mod config;
pub mod error;
pub mod etcd_lock;
pub mod event;
pub mod ext;
pub mod lockspace;
pub mod membership;
pub mod memory_lock;
pub mod node;
pub mod plugin;
pub mod private;
pub mod protocol;
pub mod quorum;
pub mod service;
pub mod socket;

pub use error::{CmanError, Result};
