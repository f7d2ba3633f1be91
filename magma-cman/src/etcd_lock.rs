use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use etcd_client::{Client, LeaseKeepAliveStream, LeaseKeeper, LockOptions};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LockConfig;
use crate::error::{CmanError, Result};
use crate::lockspace::{LockFlags, LockId, LockManager, LockMode, LockSpaceId};

#[derive(Clone)]
pub struct EtcdClient(Client);

impl Deref for EtcdClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EtcdClient {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Debug for EtcdClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdClient")
            .finish_non_exhaustive()
    }
}

impl From<Client> for EtcdClient {
    fn from(value: Client) -> Self {
        EtcdClient(value)
    }
}

#[derive(Debug)]
struct EtcdLockSpace {
    name: String,
    lease_id: i64,
    keeper: JoinHandle<()>,
}

#[derive(Debug)]
struct EtcdLock {
    ls: LockSpaceId,
    key: Vec<u8>,
}

/// Lock manager backed by etcd v3 locks.
///
/// Every lock-space owns one lease kept alive in the background and every lock
/// is attached to it, so revoking the lease frees whatever the lock-space still
/// holds. etcd only has exclusive locks, shared requests are taken exclusively.
#[derive(Debug)]
pub struct EtcdLockManager {
    client: EtcdClient,
    lease_ttl: i64,
    keep_alive_interval: Duration,
    try_lock_timeout: Duration,
    next_id: AtomicU64,
    lockspaces: DashMap<LockSpaceId, EtcdLockSpace>,
    locks: DashMap<LockId, EtcdLock>,
}

pub fn lock_key(lockspace: &str, resource: &str) -> String {
    format!("{}/{}", lockspace, resource)
}

impl EtcdLockManager {
    pub async fn connect(config: &LockConfig) -> Result<Self> {
        let client = Client::connect(&config.etcd_endpoints, None).await?;
        info!("lock manager connected to etcd {:?}", config.etcd_endpoints);
        Ok(Self::new(client.into(), config))
    }

    pub fn new(client: EtcdClient, config: &LockConfig) -> Self {
        Self {
            client,
            lease_ttl: config.lease_ttl,
            keep_alive_interval: config.keep_alive_interval(),
            try_lock_timeout: config.try_lock_timeout(),
            next_id: AtomicU64::new(0),
            lockspaces: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn keep_alive(
        name: String,
        lease_id: i64,
        mut keeper: LeaseKeeper,
        mut stream: LeaseKeepAliveStream,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Some(error) = keeper.keep_alive().await.err() {
                warn!("lockspace {} lease {} keep alive failed {:?}", name, lease_id, error);
                break;
            }
            match tokio::time::timeout(Duration::from_secs(3), stream.message()).await {
                Ok(Ok(_)) => {}
                Ok(Err(error)) => {
                    warn!("lockspace {} wait lease response error {:?}", name, error);
                }
                Err(_) => {
                    warn!("lockspace {} wait lease response timeout", name);
                }
            }
        }
    }
}

#[async_trait]
impl LockManager for EtcdLockManager {
    async fn open_lockspace(&self, name: &str) -> Result<LockSpaceId> {
        let mut client = self.client.clone();
        let lease_id = client.lease_grant(self.lease_ttl, None).await?.id();
        let (keeper, stream) = match client.lease_keep_alive(lease_id).await {
            Ok(keep_alive) => keep_alive,
            Err(error) => {
                let _ = client.lease_revoke(lease_id).await;
                return Err(error.into());
            }
        };
        let keeper = tokio::spawn(Self::keep_alive(
            name.to_string(),
            lease_id,
            keeper,
            stream,
            self.keep_alive_interval,
        ));
        let ls = LockSpaceId(self.next_id());
        self.lockspaces.insert(ls, EtcdLockSpace { name: name.to_string(), lease_id, keeper });
        debug!("lockspace {} {} opened with lease {}", name, ls, lease_id);
        Ok(ls)
    }

    async fn release_lockspace(&self, ls: LockSpaceId) -> Result<()> {
        let (_, lockspace) = self.lockspaces.remove(&ls).ok_or(CmanError::UnknownLockSpace(ls))?;
        lockspace.keeper.abort();
        self.locks.retain(|_, lock| lock.ls != ls);
        let mut client = self.client.clone();
        client.lease_revoke(lockspace.lease_id).await?;
        debug!("lockspace {} {} released, lease {} revoked", lockspace.name, ls, lockspace.lease_id);
        Ok(())
    }

    async fn lock(&self, ls: LockSpaceId, resource: &str, mode: LockMode, flags: LockFlags) -> Result<LockId> {
        let (key, lease_id) = self.lockspaces
            .get(&ls)
            .map(|lockspace| (lock_key(&lockspace.name, resource), lockspace.lease_id))
            .ok_or(CmanError::UnknownLockSpace(ls))?;
        let options = Some(LockOptions::new().with_lease(lease_id));
        let mut client = self.client.clone();
        let response = if flags.no_queue {
            match tokio::time::timeout(self.try_lock_timeout, client.lock(key.clone(), options)).await {
                Ok(response) => response?,
                Err(_) => return Err(CmanError::LockBusy(resource.to_string())),
            }
        } else {
            client.lock(key.clone(), options).await?
        };
        let lock = LockId(self.next_id());
        self.locks.insert(lock, EtcdLock { ls, key: response.key().to_vec() });
        debug!("lock {:?} granted {:?} on {}", lock, mode, key);
        Ok(lock)
    }

    async fn unlock(&self, ls: LockSpaceId, lock: LockId) -> Result<()> {
        let (_, held) = self.locks
            .remove_if(&lock, |_, held| held.ls == ls)
            .ok_or(CmanError::LockNotHeld(lock.0))?;
        let mut client = self.client.clone();
        client.unlock(held.key).await?;
        debug!("lock {:?} released", lock);
        Ok(())
    }
}

impl Drop for EtcdLockManager {
    fn drop(&mut self) {
        for lockspace in self.lockspaces.iter() {
            lockspace.keeper.abort();
        }
    }
}
