use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::HashMap;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{CmanError, Result};
use crate::lockspace::{LockFlags, LockId, LockManager, LockMode, LockSpaceId};

type ResourceKey = (String, String);

#[derive(Debug, Copy, Clone)]
struct Grant {
    lock: LockId,
    ls: LockSpaceId,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockTable {
    resources: HashMap<ResourceKey, Vec<Grant>>,
    locks: HashMap<LockId, ResourceKey>,
}

impl LockTable {
    fn grantable(&self, key: &ResourceKey, mode: LockMode) -> bool {
        self.resources
            .get(key)
            .map(|grants| grants.iter().all(|grant| grant.mode.compatible(&mode)))
            .unwrap_or(true)
    }

    fn grant(&mut self, key: ResourceKey, grant: Grant) {
        self.locks.insert(grant.lock, key.clone());
        self.resources.entry(key).or_default().push(grant);
    }

    fn remove(&mut self, key: &ResourceKey, lock: LockId) {
        if let Some(grants) = self.resources.get_mut(key) {
            grants.retain(|grant| grant.lock != lock);
            if grants.is_empty() {
                self.resources.remove(key);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_id: AtomicU64,
    lockspaces: DashMap<LockSpaceId, String>,
    table: Mutex<LockTable>,
    released: DashMap<String, usize>,
    notify: Notify,
}

/// In-process lock manager.
///
/// Lock-spaces opened under the same name share their resources, so separate
/// sessions of one process contend the way nodes contend in a cluster wide DLM.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockManager {
    inner: Arc<Inner>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lockspace_name(&self, ls: LockSpaceId) -> Result<String> {
        self.inner
            .lockspaces
            .get(&ls)
            .map(|name| name.value().clone())
            .ok_or(CmanError::UnknownLockSpace(ls))
    }

    /// How many times lock-spaces named `name` were released.
    pub fn release_count(&self, name: &str) -> usize {
        self.inner.released.get(name).map(|count| *count).unwrap_or(0)
    }

    pub fn held_locks(&self, name: &str) -> usize {
        let table = self.inner.table.lock();
        table.resources
            .iter()
            .filter(|((lockspace, _), _)| lockspace == name)
            .map(|(_, grants)| grants.len())
            .sum()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn open_lockspace(&self, name: &str) -> Result<LockSpaceId> {
        let ls = LockSpaceId(self.next_id());
        self.inner.lockspaces.insert(ls, name.to_string());
        Ok(ls)
    }

    async fn release_lockspace(&self, ls: LockSpaceId) -> Result<()> {
        let (_, name) = self.inner.lockspaces.remove(&ls).ok_or(CmanError::UnknownLockSpace(ls))?;
        {
            let mut table = self.inner.table.lock();
            let LockTable { resources, locks } = &mut *table;
            resources.retain(|_, grants| {
                grants.retain(|grant| {
                    let keep = grant.ls != ls;
                    if !keep {
                        locks.remove(&grant.lock);
                    }
                    keep
                });
                !grants.is_empty()
            });
        }
        *self.inner.released.entry(name.clone()).or_insert(0) += 1;
        self.inner.notify.notify_waiters();
        debug!("lockspace {} {} released", name, ls);
        Ok(())
    }

    async fn lock(&self, ls: LockSpaceId, resource: &str, mode: LockMode, flags: LockFlags) -> Result<LockId> {
        let key = (self.lockspace_name(ls)?, resource.to_string());
        loop {
            let notified = {
                let mut table = self.inner.table.lock();
                if table.grantable(&key, mode) {
                    let lock = LockId(self.next_id());
                    table.grant(key.clone(), Grant { lock, ls, mode });
                    debug!("lock {:?} granted {:?} on {}/{}", lock, mode, key.0, key.1);
                    return Ok(lock);
                }
                if flags.no_queue {
                    return Err(CmanError::LockBusy(resource.to_string()));
                }
                self.inner.notify.notified()
            };
            notified.await;
            self.lockspace_name(ls)?;
        }
    }

    async fn unlock(&self, ls: LockSpaceId, lock: LockId) -> Result<()> {
        {
            let mut table = self.inner.table.lock();
            let key = table.locks.get(&lock).cloned().ok_or(CmanError::LockNotHeld(lock.0))?;
            let owned = table.resources
                .get(&key)
                .map(|grants| grants.iter().any(|grant| grant.lock == lock && grant.ls == ls))
                .unwrap_or(false);
            if !owned {
                return Err(CmanError::LockNotHeld(lock.0));
            }
            table.locks.remove(&lock);
            table.remove(&key, lock);
            debug!("lock {:?} released on {}/{}", lock, key.0, key.1);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }
}
