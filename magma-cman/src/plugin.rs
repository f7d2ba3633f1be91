use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{ClientConfig, CmanConfig, LockConfig};
use crate::error::{CmanError, Result};
use crate::event::ClusterEvent;
use crate::lockspace::{connect_lock_manager, LockFlags, LockHandle, LockManager, LockMode, LockSpace};
use crate::membership::MembershipDigest;
use crate::node::ClusterNode;
use crate::private::CmanPrivate;
use crate::protocol::{CmanReply, CmanRequest, Notification};
use crate::quorum::{QuorumState, QuorumStatus};
use crate::socket::CmanSocket;

pub const PLUGIN_VERSION: &'static str = "CMAN/DLM Plugin v1.0";

/// Cluster plugin session against a cluster manager daemon and a lock manager.
#[derive(Debug)]
pub struct CmanPlugin {
    client: ClientConfig,
    lock: LockConfig,
    manager: Arc<dyn LockManager>,
    private: CmanPrivate,
    node_id: Option<u32>,
    group: Option<String>,
}

impl CmanPlugin {
    pub fn new(client: ClientConfig, lock: LockConfig, manager: Arc<dyn LockManager>) -> Self {
        Self {
            client,
            lock,
            manager,
            private: CmanPrivate::new(),
            node_id: None,
            group: None,
        }
    }

    pub async fn from_config(config: &CmanConfig) -> Result<Self> {
        let manager = connect_lock_manager(&config.lock).await?;
        Ok(Self::new(config.client.clone(), config.lock.clone(), manager))
    }

    pub fn private(&self) -> &CmanPrivate {
        &self.private
    }

    pub fn node_id(&self) -> Option<u32> {
        self.node_id
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn null(&self) -> Result<()> {
        debug!("{} present", PLUGIN_VERSION);
        Ok(())
    }

    pub fn version(&self) -> &'static str {
        PLUGIN_VERSION
    }

    /// Connects, registers the local node, seeds membership and quorum, then
    /// opens the lock-space. Anything opened is torn down again on failure.
    pub async fn open(&mut self) -> Result<()> {
        if self.private.is_connected() {
            return Err(CmanError::AlreadyOpen);
        }
        let result = self.try_open().await;
        if let Some(error) = result.as_ref().err() {
            warn!("open {} session failed {:?}", self.client.node_name, error);
            if let Some(error) = self.close().await.err() {
                warn!("teardown after failed open error {:?}", error);
            }
        }
        result
    }

    async fn try_open(&mut self) -> Result<()> {
        let socket = CmanSocket::connect(&self.client).await?;
        self.private.attach_socket(socket)?;
        let register = CmanRequest::Register {
            name: self.client.node_name.clone(),
            votes: self.client.votes,
        };
        let node_id = match self.request(register).await? {
            CmanReply::Registered { node_id } => node_id,
            other => return Err(CmanError::UnexpectedReply(other.name().to_string())),
        };
        self.node_id = Some(node_id);
        let nodes = self.nodes().await?;
        self.private.set_digest(MembershipDigest::from_nodes(&nodes));
        let quorate = self.quorate().await?;
        self.private.set_quorum_state(quorate.into());
        let lockspace = LockSpace::open(self.manager.clone(), self.lock.lockspace.clone()).await?;
        self.private.attach_lockspace(lockspace)?;
        info!(
            "{} opened as node {}, {} with {}",
            self.client.node_name,
            node_id,
            self.private.quorum_state(),
            self.private.digest(),
        );
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.node_id = None;
        self.group = None;
        self.private.teardown().await
    }

    pub async fn member_list(&mut self, group: Option<&str>) -> Result<Vec<ClusterNode>> {
        let members = self.nodes()
            .await?
            .into_iter()
            .filter(|node| node.is_member())
            .filter(|node| group.map(|group| node.in_group(group)).unwrap_or(true))
            .collect();
        Ok(members)
    }

    /// Current quorum, and whether the local node is in `group` (or in the
    /// group it logged in to when `group` is `None`).
    pub async fn quorum_status(&mut self, group: Option<&str>) -> Result<QuorumStatus> {
        let state = QuorumState::from(self.quorate().await?);
        let group = group.map(str::to_string).or_else(|| self.group.clone());
        let group_member = match (group, self.node_id) {
            (Some(group), Some(node_id)) => self.nodes()
                .await?
                .iter()
                .any(|node| node.node_id == node_id && node.is_member() && node.in_group(&group)),
            _ => false,
        };
        Ok(QuorumStatus { state, group_member })
    }

    /// Waits for the next daemon notification and reports it when it changes
    /// what this session last observed. `timeout` elapsing yields `Null`, or
    /// the quorum change whose notification was dropped by a full queue.
    pub async fn get_event(&mut self, timeout: Option<Duration>) -> Result<ClusterEvent> {
        let socket = self.private.socket_mut()?;
        let notification = socket.next_notification(timeout).await?;
        let latest_quorum = socket.latest_quorum();
        let event = match notification {
            None => match latest_quorum {
                Some(quorate) => self.quorum_changed(quorate),
                None => ClusterEvent::Null,
            },
            Some(Notification::MembershipChanged) => {
                let nodes = self.nodes().await?;
                let digest = MembershipDigest::from_nodes(&nodes);
                if digest == self.private.digest() {
                    ClusterEvent::Null
                } else {
                    debug!("membership {} -> {}", self.private.digest(), digest);
                    self.private.set_digest(digest);
                    ClusterEvent::MembershipChange
                }
            }
            Some(Notification::QuorumChanged { quorate }) => self.quorum_changed(quorate),
            Some(Notification::Shutdown) => ClusterEvent::Shutdown,
        };
        if !event.is_null() {
            info!("{} cluster event {}", self.client.node_name, event);
        }
        Ok(event)
    }

    fn quorum_changed(&mut self, quorate: bool) -> ClusterEvent {
        let state = QuorumState::from(quorate);
        if state == self.private.quorum_state() {
            return ClusterEvent::Null;
        }
        self.private.set_quorum_state(state);
        if quorate { ClusterEvent::Quorate } else { ClusterEvent::Inquorate }
    }

    pub async fn login(&mut self, group: &str) -> Result<()> {
        if let Some(joined) = &self.group {
            return if joined == group {
                Ok(())
            } else {
                Err(CmanError::AlreadyLoggedIn(joined.clone()))
            };
        }
        self.expect_done(CmanRequest::JoinGroup { group: group.to_string() }).await?;
        self.group = Some(group.to_string());
        debug!("{} logged in to {}", self.client.node_name, group);
        Ok(())
    }

    pub async fn logout(&mut self) -> Result<()> {
        let group = self.group.clone().ok_or(CmanError::NotLoggedIn)?;
        self.expect_done(CmanRequest::LeaveGroup { group: group.clone() }).await?;
        self.group = None;
        debug!("{} logged out of {}", self.client.node_name, group);
        Ok(())
    }

    pub async fn fence(&mut self, node_id: u32) -> Result<()> {
        info!("{} fencing node {}", self.client.node_name, node_id);
        self.expect_done(CmanRequest::Fence { node_id }).await
    }

    /// Locks `resource` in the session lock-space. Only allowed while quorate,
    /// judged by the latest quorum the daemon reported when there is one.
    pub async fn lock(&mut self, resource: &str, mode: LockMode, flags: LockFlags) -> Result<LockHandle> {
        let lockspace = self.private.lockspace()?;
        let quorum_state = self.private
            .socket()?
            .latest_quorum()
            .map(QuorumState::from)
            .unwrap_or(self.private.quorum_state());
        if !quorum_state.is_quorate() {
            return Err(CmanError::NotQuorate);
        }
        match tokio::time::timeout(self.lock.lock_timeout(), lockspace.lock(resource, mode, flags)).await {
            Ok(handle) => handle,
            Err(_) => Err(CmanError::LockTimeout(resource.to_string())),
        }
    }

    pub async fn unlock(&mut self, handle: LockHandle) -> Result<()> {
        self.private.lockspace()?.unlock(handle).await
    }

    async fn request(&mut self, request: CmanRequest) -> Result<CmanReply> {
        self.private.socket_mut()?.request(request).await
    }

    async fn expect_done(&mut self, request: CmanRequest) -> Result<()> {
        match self.request(request).await? {
            CmanReply::Done => Ok(()),
            other => Err(CmanError::UnexpectedReply(other.name().to_string())),
        }
    }

    async fn nodes(&mut self) -> Result<Vec<ClusterNode>> {
        match self.request(CmanRequest::GetNodes).await? {
            CmanReply::Nodes(nodes) => Ok(nodes),
            other => Err(CmanError::UnexpectedReply(other.name().to_string())),
        }
    }

    async fn quorate(&mut self) -> Result<bool> {
        match self.request(CmanRequest::GetQuorum).await? {
            CmanReply::Quorum { quorate, .. } => Ok(quorate),
            other => Err(CmanError::UnexpectedReply(other.name().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::config::CmanConfig;
    use crate::error::CmanError;
    use crate::event::ClusterEvent;
    use crate::lockspace::{LockFlags, LockMode};
    use crate::membership::MembershipDigest;
    use crate::memory_lock::MemoryLockManager;
    use crate::node::NodeState;
    use crate::plugin::{CmanPlugin, PLUGIN_VERSION};
    use crate::quorum::QuorumState;
    use crate::service::{CmanService, ServiceHandle};

    async fn cluster(expected_votes: u32) -> anyhow::Result<(ServiceHandle, CmanConfig)> {
        let mut config = CmanConfig::load_default()?;
        config.service.listen = "127.0.0.1:0".parse()?;
        config.service.expected_votes = expected_votes;
        let handle = CmanService::bind(&config.service).await?.spawn()?;
        config.client.addr = handle.local_addr();
        config.client.connect_retries = 1;
        config.client.request_timeout_ms = 2000;
        Ok((handle, config))
    }

    fn plugin(config: &CmanConfig, name: &str, manager: &MemoryLockManager) -> CmanPlugin {
        let mut client = config.client.clone();
        client.node_name = name.to_string();
        CmanPlugin::new(client, config.lock.clone(), Arc::new(manager.clone()))
    }

    async fn next_event(plugin: &mut CmanPlugin) -> anyhow::Result<ClusterEvent> {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            let event = plugin.get_event(Some(Duration::from_millis(100))).await?;
            if !event.is_null() {
                return Ok(event);
            }
        }
        Ok(ClusterEvent::Null)
    }

    async fn settle(plugin: &mut CmanPlugin) -> anyhow::Result<()> {
        let deadline = Instant::now() + Duration::from_millis(300);
        while Instant::now() < deadline {
            plugin.get_event(Some(Duration::from_millis(50))).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_open_seeds_private_state() -> anyhow::Result<()> {
        let (handle, config) = cluster(1).await?;
        let manager = MemoryLockManager::new();
        let mut node1 = plugin(&config, "node1", &manager);
        node1.null()?;
        assert_eq!(node1.version(), PLUGIN_VERSION);
        node1.open().await?;
        assert_eq!(node1.node_id(), Some(1));
        assert_eq!(node1.private().quorum_state(), QuorumState::Quorate);
        assert_eq!(node1.private().digest(), MembershipDigest { count: 1, sum: 1 });
        let snapshot = node1.private().snapshot();
        assert_eq!(snapshot.peer, Some(handle.local_addr()));
        assert_eq!(snapshot.lockspace.as_deref(), Some("Magma"));
        assert!(matches!(node1.open().await, Err(CmanError::AlreadyOpen)));

        node1.close().await?;
        assert!(!node1.private().is_connected());
        assert_eq!(manager.release_count("Magma"), 1);
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.nodes().iter().any(|node| node.state != NodeState::Dead) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await?;
        assert!(!handle.is_quorate());
        Ok(())
    }

    #[tokio::test]
    async fn test_membership_change_events() -> anyhow::Result<()> {
        let (_handle, config) = cluster(1).await?;
        let manager = MemoryLockManager::new();
        let mut node1 = plugin(&config, "node1", &manager);
        let mut node2 = plugin(&config, "node2", &manager);
        node1.open().await?;
        node2.open().await?;
        assert_eq!(next_event(&mut node1).await?, ClusterEvent::MembershipChange);
        assert_eq!(node1.private().digest(), MembershipDigest { count: 2, sum: 3 });
        assert_eq!(node1.member_list(None).await?.len(), 2);

        node2.close().await?;
        assert_eq!(next_event(&mut node1).await?, ClusterEvent::MembershipChange);
        assert_eq!(node1.private().digest(), MembershipDigest { count: 1, sum: 1 });
        // node2 still counts towards the expected votes
        assert_eq!(next_event(&mut node1).await?, ClusterEvent::Inquorate);
        assert_eq!(node1.get_event(Some(Duration::from_millis(50))).await?, ClusterEvent::Null);
        node1.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_quorum_events_gate_locking() -> anyhow::Result<()> {
        let (_handle, config) = cluster(2).await?;
        let manager = MemoryLockManager::new();
        let mut node1 = plugin(&config, "node1", &manager);
        let mut node2 = plugin(&config, "node2", &manager);
        node1.open().await?;
        assert_eq!(node1.private().quorum_state(), QuorumState::Inquorate);
        let inquorate = node1.lock("service:web", LockMode::Exclusive, LockFlags::default()).await;
        assert!(matches!(inquorate, Err(CmanError::NotQuorate)));

        node2.open().await?;
        assert_eq!(node2.private().quorum_state(), QuorumState::Quorate);
        assert_eq!(next_event(&mut node1).await?, ClusterEvent::MembershipChange);
        assert_eq!(next_event(&mut node1).await?, ClusterEvent::Quorate);
        assert_eq!(node1.private().quorum_state(), QuorumState::Quorate);

        let held = node1.lock("service:web", LockMode::Exclusive, LockFlags::default()).await?;
        let busy = node2.lock("service:web", LockMode::Shared, LockFlags::no_queue()).await;
        assert!(matches!(busy, Err(CmanError::LockBusy(_))));
        node1.unlock(held).await?;
        node2.lock("service:web", LockMode::Shared, LockFlags::no_queue()).await?;

        node2.close().await?;
        assert_eq!(manager.held_locks("Magma"), 0);
        assert_eq!(next_event(&mut node1).await?, ClusterEvent::MembershipChange);
        assert_eq!(next_event(&mut node1).await?, ClusterEvent::Inquorate);
        node1.close().await?;
        assert_eq!(manager.release_count("Magma"), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_quorum_survives_full_notification_queue() -> anyhow::Result<()> {
        let (_handle, mut config) = cluster(2).await?;
        config.client.notification_buffer = 1;
        let manager = MemoryLockManager::new();
        let mut node1 = plugin(&config, "node1", &manager);
        let mut node2 = plugin(&config, "node2", &manager);
        node1.open().await?;
        node2.open().await?;
        assert_eq!(node1.private().quorum_state(), QuorumState::Inquorate);
        let held = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match node1.lock("r", LockMode::Exclusive, LockFlags::no_queue()).await {
                    Err(CmanError::NotQuorate) => tokio::time::sleep(Duration::from_millis(10)).await,
                    result => break result,
                }
            }
        }).await??;
        node1.unlock(held).await?;

        assert_eq!(next_event(&mut node1).await?, ClusterEvent::MembershipChange);
        assert_eq!(next_event(&mut node1).await?, ClusterEvent::Quorate);
        assert_eq!(node1.private().quorum_state(), QuorumState::Quorate);
        assert_eq!(node1.get_event(Some(Duration::from_millis(50))).await?, ClusterEvent::Null);
        node1.close().await?;
        node2.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_timeout() -> anyhow::Result<()> {
        let (_handle, mut config) = cluster(1).await?;
        config.lock.lock_timeout_ms = 100;
        let manager = MemoryLockManager::new();
        let mut node1 = plugin(&config, "node1", &manager);
        let mut node2 = plugin(&config, "node2", &manager);
        node1.open().await?;
        node2.open().await?;
        node1.lock("r", LockMode::Exclusive, LockFlags::default()).await?;
        let waited = node2.lock("r", LockMode::Exclusive, LockFlags::default()).await;
        assert!(matches!(waited, Err(CmanError::LockTimeout(resource)) if resource == "r"));
        node1.close().await?;
        node2.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_login_and_group_members() -> anyhow::Result<()> {
        let (_handle, config) = cluster(1).await?;
        let manager = MemoryLockManager::new();
        let mut node1 = plugin(&config, "node1", &manager);
        let mut node2 = plugin(&config, "node2", &manager);
        node1.open().await?;
        node2.open().await?;
        node1.login("rgmanager").await?;
        node1.login("rgmanager").await?;
        assert!(matches!(node1.login("other").await, Err(CmanError::AlreadyLoggedIn(group)) if group == "rgmanager"));

        let members = node2.member_list(Some("rgmanager")).await?;
        assert_eq!(members.iter().map(|node| node.node_id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(node2.member_list(None).await?.len(), 2);

        let status = node1.quorum_status(None).await?;
        assert_eq!(status.state, QuorumState::Quorate);
        assert!(status.group_member);
        assert!(!node1.quorum_status(Some("other")).await?.group_member);
        assert!(!node2.quorum_status(Some("rgmanager")).await?.group_member);

        node1.logout().await?;
        assert!(matches!(node1.logout().await, Err(CmanError::NotLoggedIn)));
        assert!(node2.member_list(Some("rgmanager")).await?.is_empty());
        node1.close().await?;
        node2.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_fence_disconnects_victim() -> anyhow::Result<()> {
        let (handle, config) = cluster(1).await?;
        let manager = MemoryLockManager::new();
        let mut node1 = plugin(&config, "node1", &manager);
        let mut node2 = plugin(&config, "node2", &manager);
        node1.open().await?;
        node2.open().await?;
        assert_eq!(next_event(&mut node1).await?, ClusterEvent::MembershipChange);
        let victim = node2.node_id().ok_or(anyhow::anyhow!("node2 has no id"))?;
        node1.fence(victim).await?;

        let deadline = Instant::now() + Duration::from_secs(3);
        let disconnected = loop {
            match node2.get_event(Some(Duration::from_millis(100))).await {
                Err(CmanError::Disconnected) | Err(CmanError::Io(_)) => break true,
                Err(error) => return Err(error.into()),
                Ok(_) if Instant::now() > deadline => break false,
                Ok(_) => {}
            }
        };
        assert!(disconnected);
        assert_eq!(next_event(&mut node1).await?, ClusterEvent::MembershipChange);
        assert_eq!(node1.member_list(None).await?.len(), 1);
        assert!(handle.nodes().iter().any(|node| node.node_id == victim && node.state == NodeState::Dead));
        let _ = node2.close().await;
        assert!(!node2.private().is_connected());
        node1.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_event() -> anyhow::Result<()> {
        let (handle, config) = cluster(1).await?;
        let manager = MemoryLockManager::new();
        let mut node1 = plugin(&config, "node1", &manager);
        node1.open().await?;
        settle(&mut node1).await?;
        handle.shutdown();
        assert_eq!(next_event(&mut node1).await?, ClusterEvent::Shutdown);
        assert!(matches!(node1.get_event(Some(Duration::from_secs(1))).await, Err(CmanError::Disconnected)));
        let _ = node1.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_open_is_torn_down() -> anyhow::Result<()> {
        let (_handle, config) = cluster(1).await?;
        let manager = MemoryLockManager::new();
        let mut node1 = plugin(&config, "node1", &manager);
        let mut duplicate = plugin(&config, "node1", &manager);
        node1.open().await?;
        assert!(matches!(duplicate.open().await, Err(CmanError::Daemon(_))));
        assert!(!duplicate.private().is_connected());
        assert!(duplicate.node_id().is_none());
        assert_eq!(manager.release_count("Magma"), 0);
        assert!(matches!(duplicate.get_event(None).await, Err(CmanError::NotConnected)));

        let mut unreachable = config.clone();
        unreachable.client.addr = "127.0.0.1:1".parse()?;
        let mut lonely = plugin(&unreachable, "node3", &manager);
        assert!(matches!(lonely.open().await, Err(CmanError::ConnectFailed { .. })));
        assert!(matches!(
            lonely.lock("r", LockMode::Shared, LockFlags::default()).await,
            Err(CmanError::NotConnected),
        ));
        node1.close().await?;
        Ok(())
    }
}
