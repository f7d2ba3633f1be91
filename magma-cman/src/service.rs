use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::HashMap;
use futures::{SinkExt, StreamExt};
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::PacketCodec;
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::node::{ClusterNode, NodeState};
use crate::protocol::{ClientFrame, CmanReply, CmanRequest, FrameExt, Notification, ServerFrame};
use crate::quorum::quorum_votes;

type SessionId = u64;

#[derive(Debug)]
struct Session {
    tx: mpsc::UnboundedSender<ServerFrame>,
    node_id: Option<u32>,
}

#[derive(Debug)]
struct NodeEntry {
    node: ClusterNode,
    session: Option<SessionId>,
}

#[derive(Debug, Default)]
struct Roster {
    configured_votes: u32,
    nodes: BTreeMap<u32, NodeEntry>,
    ids: HashMap<String, u32>,
    sessions: HashMap<SessionId, Session>,
    quorate: bool,
}

impl Roster {
    fn new(configured_votes: u32) -> Self {
        Self {
            configured_votes,
            ..Default::default()
        }
    }

    fn expected_votes(&self) -> u64 {
        let known: u64 = self.nodes.values().map(|entry| u64::from(entry.node.votes)).sum();
        known.max(u64::from(self.configured_votes))
    }

    fn live_votes(&self) -> u64 {
        self.nodes
            .values()
            .filter(|entry| entry.node.is_member())
            .map(|entry| u64::from(entry.node.votes))
            .sum()
    }

    fn broadcast(&self, notification: Notification) {
        for session in self.sessions.values() {
            let _ = session.tx.send(ServerFrame::Notify(notification));
        }
    }

    fn membership_changed(&mut self) {
        self.broadcast(Notification::MembershipChanged);
        let quorate = self.live_votes() >= quorum_votes(self.expected_votes());
        if quorate != self.quorate {
            self.quorate = quorate;
            info!(
                "cluster is {} with {}/{} votes",
                if quorate { "quorate" } else { "inquorate" },
                self.live_votes(),
                self.expected_votes(),
            );
            self.broadcast(Notification::QuorumChanged { quorate });
        }
    }

    fn mark_dead(&mut self, node_id: u32) {
        if let Some(entry) = self.nodes.get_mut(&node_id) {
            entry.node.state = NodeState::Dead;
            entry.node.groups.clear();
            entry.session = None;
        }
    }

    fn registered_node(&mut self, session: SessionId) -> std::result::Result<&mut ClusterNode, String> {
        let node_id = self.sessions
            .get(&session)
            .and_then(|session| session.node_id)
            .ok_or_else(|| "session is not registered".to_string())?;
        self.nodes
            .get_mut(&node_id)
            .map(|entry| &mut entry.node)
            .ok_or_else(|| format!("node {} not found", node_id))
    }

    fn register(&mut self, session: SessionId, name: String, votes: u32) -> std::result::Result<CmanReply, String> {
        if self.sessions.get(&session).and_then(|session| session.node_id).is_some() {
            return Err("session is already registered".to_string());
        }
        let next_id = self.nodes.keys().next_back().map(|id| id + 1).unwrap_or(1);
        let node_id = *self.ids.entry(name.clone()).or_insert(next_id);
        let entry = self.nodes.entry(node_id).or_insert_with(|| NodeEntry {
            node: ClusterNode::new(node_id, name.clone(), votes),
            session: None,
        });
        if entry.session.is_some() {
            return Err(format!("node {} is already a member", name));
        }
        entry.node.state = NodeState::Member;
        entry.node.votes = votes;
        entry.session = Some(session);
        if let Some(session) = self.sessions.get_mut(&session) {
            session.node_id = Some(node_id);
        }
        info!("node {} joined as {} with {} votes", name, node_id, votes);
        self.membership_changed();
        Ok(CmanReply::Registered { node_id })
    }

    fn fence(&mut self, node_id: u32) -> std::result::Result<CmanReply, String> {
        let entry = self.nodes.get(&node_id).ok_or_else(|| format!("node {} not found", node_id))?;
        if let Some(session) = entry.session {
            self.sessions.remove(&session);
        }
        if entry.node.is_member() {
            info!("fence node {} {}", node_id, entry.node.name);
            self.mark_dead(node_id);
            self.membership_changed();
        }
        Ok(CmanReply::Done)
    }

    fn handle(&mut self, session: SessionId, request: CmanRequest) -> CmanReply {
        let result = match request {
            CmanRequest::Register { name, votes } => self.register(session, name, votes),
            CmanRequest::GetNodes => {
                let nodes = self.nodes.values().map(|entry| entry.node.clone()).collect();
                Ok(CmanReply::Nodes(nodes))
            }
            CmanRequest::GetQuorum => Ok(CmanReply::Quorum {
                quorate: self.quorate,
                votes: self.live_votes(),
                expected_votes: self.expected_votes(),
            }),
            CmanRequest::JoinGroup { group } => self.registered_node(session).map(|node| {
                node.groups.insert(group);
                CmanReply::Done
            }),
            CmanRequest::LeaveGroup { group } => self.registered_node(session).and_then(|node| {
                if node.groups.remove(&group) {
                    Ok(CmanReply::Done)
                } else {
                    Err(format!("node {} is not in group {}", node.name, group))
                }
            }),
            CmanRequest::Fence { node_id } => self.fence(node_id),
        };
        result.unwrap_or_else(CmanReply::Error)
    }

    fn disconnect(&mut self, session: SessionId) {
        let Some(session_entry) = self.sessions.remove(&session) else {
            return;
        };
        let Some(node_id) = session_entry.node_id else {
            return;
        };
        let current = self.nodes.get(&node_id).map(|entry| entry.session == Some(session)).unwrap_or(false);
        if current {
            info!("node {} left", node_id);
            self.mark_dead(node_id);
            self.membership_changed();
        }
    }

    fn shutdown(&mut self) {
        self.broadcast(Notification::Shutdown);
        self.sessions.clear();
    }
}

#[derive(Debug)]
struct ServiceState {
    roster: Mutex<Roster>,
    next_session: AtomicU64,
}

/// Minimal cluster manager daemon.
///
/// Every registered connection is a cluster node. Membership and quorum are
/// computed from the live connections and pushed to every session as
/// notifications.
#[derive(Debug)]
pub struct CmanService {
    listener: TcpListener,
    state: Arc<ServiceState>,
}

impl CmanService {
    pub async fn bind(config: &ServiceConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let state = ServiceState {
            roster: Mutex::new(Roster::new(config.expected_votes)),
            next_session: AtomicU64::new(0),
        };
        let service = Self {
            listener,
            state: Arc::new(state),
        };
        Ok(service)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn spawn(self) -> Result<ServiceHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = self.state.clone();
        let task = tokio::spawn(self.accept_loop(shutdown_rx));
        info!("cluster manager listening on {}", local_addr);
        let handle = ServiceHandle {
            local_addr,
            state,
            shutdown_tx,
            task,
        };
        Ok(handle)
    }

    async fn accept_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Some(error) = stream.set_nodelay(true).err() {
                            warn!("accept {} set tcp nodelay error {:?}, drop current connection", addr, error);
                            continue;
                        }
                        let session = self.state.next_session.fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = mpsc::unbounded_channel();
                        self.state.roster.lock().sessions.insert(session, Session { tx, node_id: None });
                        debug!("accept session {} from {}", session, addr);
                        tokio::spawn(Self::serve(self.state.clone(), session, addr, stream, rx));
                    }
                    Err(error) => {
                        warn!("accept connection error {:?}", error);
                    }
                },
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }
        info!("cluster manager stopped accepting connections");
    }

    async fn serve(
        state: Arc<ServiceState>,
        session: SessionId,
        addr: SocketAddr,
        stream: TcpStream,
        mut rx: mpsc::UnboundedReceiver<ServerFrame>,
    ) {
        let mut framed = Framed::new(stream, PacketCodec);
        loop {
            let outbound = tokio::select! {
                inbound = framed.next() => match inbound {
                    Some(Ok(packet)) => match ClientFrame::from_packet(&packet) {
                        Ok(ClientFrame::Request { id, request }) => {
                            debug!("session {} request {} {}", session, id, request);
                            let reply = state.roster.lock().handle(session, request);
                            ServerFrame::Reply { id, reply }
                        }
                        Err(error) => {
                            warn!("session {} from {} sent a bad frame {:?}, drop current connection", session, addr, error);
                            break;
                        }
                    },
                    Some(Err(error)) => {
                        warn!("session {} from {} read error {:?}, drop current connection", session, addr, error);
                        break;
                    }
                    None => break,
                },
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let sent = match outbound.to_packet() {
                Ok(packet) => framed.send(packet).await,
                Err(error) => Err(error),
            };
            if let Some(error) = sent.err() {
                warn!("session {} write to {} error {:?}, drop current connection", session, addr, error);
                break;
            }
        }
        state.roster.lock().disconnect(session);
        debug!("session {} from {} closed", session, addr);
    }
}

#[derive(Debug)]
pub struct ServiceHandle {
    local_addr: SocketAddr,
    state: Arc<ServiceState>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn nodes(&self) -> Vec<ClusterNode> {
        self.state.roster.lock().nodes.values().map(|entry| entry.node.clone()).collect()
    }

    pub fn is_quorate(&self) -> bool {
        self.state.roster.lock().quorate
    }

    /// Tells every session the cluster is going down, closes them and stops accepting.
    pub fn shutdown(&self) {
        let mut roster = self.state.roster.lock();
        let members = roster.nodes.values().filter(|entry| entry.node.is_member()).map(|entry| &entry.node.name).join(",");
        info!("cluster manager shutting down, members [{}]", members);
        roster.shutdown();
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn wait(mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
