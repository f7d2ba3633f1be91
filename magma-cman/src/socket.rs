use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::codec::PacketCodec;
use crate::config::ClientConfig;
use crate::error::{CmanError, Result};
use crate::protocol::{ClientFrame, CmanReply, CmanRequest, FrameExt, Notification, ServerFrame};

type PendingReplies = Arc<DashMap<u64, oneshot::Sender<CmanReply>>>;

/// Owned channel to the cluster manager daemon.
///
/// Replies are matched to requests by id on a background reader task, daemon
/// notifications are queued until [`CmanSocket::next_notification`] picks
/// them up. The last reported quorum is kept apart from the queue and
/// survives a full queue. Dropping the socket closes the stream and stops
/// the reader.
pub struct CmanSocket {
    peer: SocketAddr,
    writer: FramedWrite<OwnedWriteHalf, PacketCodec>,
    pending: PendingReplies,
    notifications: mpsc::Receiver<Notification>,
    quorum: watch::Receiver<Option<bool>>,
    reader: JoinHandle<()>,
    next_id: u64,
    request_timeout: Duration,
}

impl Debug for CmanSocket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmanSocket")
            .field("peer", &self.peer)
            .field("pending", &self.pending.len())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl CmanSocket {
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let addr = config.addr;
        let attempts = config.connect_retries.max(1);
        let mut attempt = 0;
        let stream = loop {
            attempt += 1;
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(error) if attempt < attempts => {
                    warn!(
                        "connect cluster manager {} error {:?}, retry {}/{} in {:?}",
                        addr,
                        error,
                        attempt,
                        attempts,
                        config.retry_interval(),
                    );
                    tokio::time::sleep(config.retry_interval()).await;
                }
                Err(error) => {
                    error!("connect cluster manager {} error {:?}, give up", addr, error);
                    return Err(CmanError::ConnectFailed { addr, attempts });
                }
            }
        };
        stream.set_nodelay(true)?;
        let socket = Self::from_stream(stream, config)?;
        info!("connected to cluster manager {}", socket.peer);
        Ok(socket)
    }

    pub fn from_stream(stream: TcpStream, config: &ClientConfig) -> Result<Self> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let pending = PendingReplies::default();
        let (tx, rx) = mpsc::channel(config.notification_buffer.max(1));
        let (quorum_tx, quorum_rx) = watch::channel(None);
        let reader = tokio::spawn(Self::read_loop(
            peer,
            FramedRead::new(read_half, PacketCodec),
            pending.clone(),
            tx,
            quorum_tx,
        ));
        let socket = Self {
            peer,
            writer: FramedWrite::new(write_half, PacketCodec),
            pending,
            notifications: rx,
            quorum: quorum_rx,
            reader,
            next_id: 0,
            request_timeout: config.request_timeout(),
        };
        Ok(socket)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
    }

    /// Quorum carried by the most recent `QuorumChanged` from the daemon,
    /// whether or not it made it into the notification queue.
    pub fn latest_quorum(&self) -> Option<bool> {
        *self.quorum.borrow()
    }

    async fn read_loop(
        peer: SocketAddr,
        mut framed: FramedRead<OwnedReadHalf, PacketCodec>,
        pending: PendingReplies,
        tx: mpsc::Sender<Notification>,
        quorum: watch::Sender<Option<bool>>,
    ) {
        while let Some(packet) = framed.next().await {
            let frame = match packet.and_then(|packet| ServerFrame::from_packet(&packet)) {
                Ok(frame) => frame,
                Err(error) => {
                    warn!("read from cluster manager {} error {:?}, drop current connection", peer, error);
                    break;
                }
            };
            match frame {
                ServerFrame::Reply { id, reply } => match pending.remove(&id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(reply);
                    }
                    None => {
                        debug!("drop reply {} {} from {} without waiter", id, reply.name(), peer);
                    }
                },
                ServerFrame::Notify(notification) => {
                    if let Notification::QuorumChanged { quorate } = notification {
                        quorum.send_replace(Some(quorate));
                    }
                    match tx.try_send(notification) {
                        Ok(_) => {}
                        Err(TrySendError::Full(notification)) => {
                            warn!("notification queue of {} is full, drop {:?}", peer, notification);
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            }
        }
        pending.clear();
        debug!("cluster manager {} reader stopped", peer);
    }

    pub async fn request(&mut self, request: CmanRequest) -> Result<CmanReply> {
        if self.is_closed() {
            return Err(CmanError::Disconnected);
        }
        let id = self.next_id;
        self.next_id += 1;
        debug!("send request {} {} to {}", id, request, self.peer);
        let packet = ClientFrame::Request { id, request }.to_packet()?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if let Err(error) = self.writer.send(packet).await {
            self.pending.remove(&id);
            return Err(error);
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(CmanReply::Error(message))) => Err(CmanError::Daemon(message)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CmanError::Disconnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(CmanError::RequestTimeout(id))
            }
        }
    }

    /// Waits for the next daemon notification, `Ok(None)` when `timeout` elapses first.
    pub async fn next_notification(&mut self, timeout: Option<Duration>) -> Result<Option<Notification>> {
        let received = match timeout {
            None => self.notifications.recv().await,
            Some(timeout) => match tokio::time::timeout(timeout, self.notifications.recv()).await {
                Ok(received) => received,
                Err(_) => return Ok(None),
            },
        };
        received.map(Some).ok_or(CmanError::Disconnected)
    }

    pub async fn close(mut self) -> Result<()> {
        self.reader.abort();
        self.pending.clear();
        let result = self.writer.close().await;
        info!("closed cluster manager connection {}", self.peer);
        result
    }
}

impl Drop for CmanSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::Framed;

    use crate::codec::PacketCodec;
    use crate::config::{ClientConfig, CmanConfig};
    use crate::error::CmanError;
    use crate::protocol::{ClientFrame, CmanReply, CmanRequest, FrameExt, Notification, ServerFrame};
    use crate::socket::CmanSocket;

    async fn listener() -> anyhow::Result<(TcpListener, ClientConfig)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let mut config = CmanConfig::load_default()?.client;
        config.addr = listener.local_addr()?;
        config.connect_retries = 1;
        config.request_timeout_ms = 300;
        Ok((listener, config))
    }

    async fn next_request(framed: &mut Framed<TcpStream, PacketCodec>) -> anyhow::Result<(u64, CmanRequest)> {
        let packet = framed.next().await.ok_or(anyhow::anyhow!("client closed"))??;
        let ClientFrame::Request { id, request } = ClientFrame::from_packet(&packet)?;
        Ok((id, request))
    }

    #[tokio::test]
    async fn test_reply_routed_and_notification_queued() -> anyhow::Result<()> {
        let (listener, config) = listener().await?;
        let daemon = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut framed = Framed::new(stream, PacketCodec);
            let (id, request) = next_request(&mut framed).await?;
            assert_eq!(request, CmanRequest::GetQuorum);
            framed.send(ServerFrame::Notify(Notification::MembershipChanged).to_packet()?).await?;
            let reply = CmanReply::Quorum { quorate: true, votes: 1, expected_votes: 1 };
            framed.send(ServerFrame::Reply { id, reply }.to_packet()?).await?;
            let (_, request) = next_request(&mut framed).await?;
            assert_eq!(request, CmanRequest::GetNodes);
            framed.send(ServerFrame::Reply { id: 77, reply: CmanReply::Done }.to_packet()?).await?;
            anyhow::Ok(())
        });
        let mut socket = CmanSocket::connect(&config).await?;
        let reply = socket.request(CmanRequest::GetQuorum).await?;
        assert_eq!(reply, CmanReply::Quorum { quorate: true, votes: 1, expected_votes: 1 });
        let notification = socket.next_notification(Some(Duration::from_secs(1))).await?;
        assert_eq!(notification, Some(Notification::MembershipChanged));
        let result = socket.request(CmanRequest::GetNodes).await;
        assert!(matches!(result, Err(CmanError::Disconnected) | Err(CmanError::RequestTimeout(_))));
        daemon.await??;
        assert!(matches!(socket.next_notification(Some(Duration::from_secs(1))).await, Err(CmanError::Disconnected)));
        Ok(())
    }

    #[tokio::test]
    async fn test_full_queue_keeps_latest_quorum() -> anyhow::Result<()> {
        let (listener, mut config) = listener().await?;
        config.notification_buffer = 1;
        let daemon = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut framed = Framed::new(stream, PacketCodec);
            let (id, _) = next_request(&mut framed).await?;
            for notification in [
                Notification::MembershipChanged,
                Notification::QuorumChanged { quorate: true },
                Notification::QuorumChanged { quorate: false },
            ] {
                framed.send(ServerFrame::Notify(notification).to_packet()?).await?;
            }
            framed.send(ServerFrame::Reply { id, reply: CmanReply::Done }.to_packet()?).await?;
            let _ = framed.next().await;
            anyhow::Ok(())
        });
        let mut socket = CmanSocket::connect(&config).await?;
        assert_eq!(socket.latest_quorum(), None);
        assert_eq!(socket.request(CmanRequest::GetNodes).await?, CmanReply::Done);
        assert_eq!(socket.latest_quorum(), Some(false));
        let notification = socket.next_notification(Some(Duration::from_millis(100))).await?;
        assert_eq!(notification, Some(Notification::MembershipChanged));
        assert_eq!(socket.next_notification(Some(Duration::from_millis(100))).await?, None);
        socket.close().await?;
        daemon.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_request_timeout() -> anyhow::Result<()> {
        let (listener, config) = listener().await?;
        let daemon = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut framed = Framed::new(stream, PacketCodec);
            let _ = next_request(&mut framed).await?;
            tokio::time::sleep(Duration::from_secs(1)).await;
            anyhow::Ok(())
        });
        let mut socket = CmanSocket::connect(&config).await?;
        let result = socket.request(CmanRequest::GetNodes).await;
        assert!(matches!(result, Err(CmanError::RequestTimeout(0))));
        assert_eq!(socket.next_notification(Some(Duration::from_millis(10))).await?, None);
        socket.close().await?;
        daemon.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_gives_up() -> anyhow::Result<()> {
        let (listener, mut config) = listener().await?;
        drop(listener);
        config.connect_retries = 2;
        config.retry_interval_ms = 10;
        let result = CmanSocket::connect(&config).await;
        assert!(matches!(result, Err(CmanError::ConnectFailed { attempts: 2, .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_close_reaches_daemon_once() -> anyhow::Result<()> {
        let (listener, config) = listener().await?;
        let daemon = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut framed = Framed::new(stream, PacketCodec);
            let mut frames = 0;
            while let Some(packet) = framed.next().await {
                packet?;
                frames += 1;
            }
            anyhow::Ok(frames)
        });
        let socket = CmanSocket::connect(&config).await?;
        socket.close().await?;
        assert_eq!(daemon.await??, 0);
        Ok(())
    }
}
