use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::config::{LockBackend, LockConfig};
use crate::error::Result;
use crate::etcd_lock::EtcdLockManager;
use crate::memory_lock::MemoryLockManager;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LockSpaceId(pub u64);

impl Display for LockSpaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ls#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LockId(pub u64);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn compatible(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct LockFlags {
    /// Fail with `LockBusy` instead of waiting for a conflicting holder.
    pub no_queue: bool,
}

impl LockFlags {
    pub fn no_queue() -> Self {
        Self { no_queue: true }
    }
}

/// A granted lock, given back to `unlock`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LockHandle {
    pub id: LockId,
    pub resource: String,
    pub mode: LockMode,
}

#[async_trait]
pub trait LockManager: Debug + Send + Sync + 'static {
    async fn open_lockspace(&self, name: &str) -> Result<LockSpaceId>;

    /// Releases a lock-space and every lock still held in it.
    async fn release_lockspace(&self, ls: LockSpaceId) -> Result<()>;

    async fn lock(&self, ls: LockSpaceId, resource: &str, mode: LockMode, flags: LockFlags) -> Result<LockId>;

    async fn unlock(&self, ls: LockSpaceId, lock: LockId) -> Result<()>;
}

pub async fn connect_lock_manager(config: &LockConfig) -> Result<Arc<dyn LockManager>> {
    let manager: Arc<dyn LockManager> = match config.backend {
        LockBackend::Memory => Arc::new(MemoryLockManager::new()),
        LockBackend::Etcd => Arc::new(EtcdLockManager::connect(config).await?),
    };
    Ok(manager)
}

/// Owned lock-space handle, released exactly once.
pub struct LockSpace {
    id: LockSpaceId,
    name: String,
    manager: Arc<dyn LockManager>,
    released: bool,
}

impl Debug for LockSpace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSpace")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockSpace {
    pub async fn open(manager: Arc<dyn LockManager>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let id = manager.open_lockspace(&name).await?;
        debug!("open lockspace {} {}", name, id);
        let lockspace = Self {
            id,
            name,
            manager,
            released: false,
        };
        Ok(lockspace)
    }

    pub fn id(&self) -> LockSpaceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn lock(&self, resource: &str, mode: LockMode, flags: LockFlags) -> Result<LockHandle> {
        let id = self.manager.lock(self.id, resource, mode, flags).await?;
        let handle = LockHandle {
            id,
            resource: resource.to_string(),
            mode,
        };
        Ok(handle)
    }

    pub async fn unlock(&self, handle: LockHandle) -> Result<()> {
        self.manager.unlock(self.id, handle.id).await
    }

    /// Releases the lock-space. If this future is dropped before the manager
    /// answers, the handle's `Drop` still releases it.
    pub async fn release(mut self) -> Result<()> {
        debug!("release lockspace {} {}", self.name, self.id);
        let result = self.manager.release_lockspace(self.id).await;
        self.released = true;
        result
    }
}

impl Drop for LockSpace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let id = self.id;
        let name = std::mem::take(&mut self.name);
        let manager = self.manager.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(error) = manager.release_lockspace(id).await.err() {
                        error!("release dropped lockspace {} {} error {:?}", name, id, error);
                    }
                });
            }
            Err(_) => {
                warn!("lockspace {} {} dropped outside a tokio runtime, it is left to the lock manager", name, id);
            }
        }
    }
}
