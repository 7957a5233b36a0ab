//! UDP over QUIC datagram
//!
//! - [`DatagramIo`]: 在 QUIC datagram 通道上收发 [`UdpMessage`]
//! - [`UdpSessionManager`]: 按会话 ID 分发收到的消息
//! - [`UdpConn`]: 单个 UDP 会话，实现 [`Conn`]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use quinn::SendDatagramError;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::{Conn, DeadlineController, Error, Result};

use crate::frag::{frag_udp_message, Defragger};
use crate::protocol::{parse_udp_message, UdpMessage, MAX_DATAGRAM_FRAME_SIZE};

/// 每个会话的接收队列长度，队列满时丢弃新消息
const SESSION_QUEUE_SIZE: usize = 1024;

/// 不可靠 datagram 通道
#[async_trait]
pub trait DatagramChannel: Send + Sync + 'static {
    async fn read_datagram(&self) -> Result<Bytes>;

    fn send_datagram(&self, data: Bytes) -> Result<()>;

    /// 当前可发送的最大 datagram 长度，`None` 表示对端不接受 datagram
    fn max_datagram_size(&self) -> Option<usize>;
}

#[async_trait]
impl DatagramChannel for quinn::Connection {
    async fn read_datagram(&self) -> Result<Bytes> {
        quinn::Connection::read_datagram(self)
            .await
            .map_err(|e| Error::Closed(e.into()))
    }

    fn send_datagram(&self, data: Bytes) -> Result<()> {
        quinn::Connection::send_datagram(self, data).map_err(|e| match e {
            SendDatagramError::ConnectionLost(e) => Error::Closed(e.into()),
            other => Error::Io(io::Error::other(other)),
        })
    }

    fn max_datagram_size(&self) -> Option<usize> {
        quinn::Connection::max_datagram_size(self)
    }
}

/// datagram 消息收发
pub struct DatagramIo<C> {
    channel: C,
}

impl<C: DatagramChannel> DatagramIo<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    /// 接收下一条格式正确的消息
    ///
    /// 格式错误的 datagram 被丢弃后继续等待；通道错误直接返回，会话管理器随之停止。
    pub async fn receive_message(&self) -> Result<UdpMessage> {
        loop {
            let data = self.channel.read_datagram().await?;
            match parse_udp_message(data) {
                Ok(msg) => return Ok(msg),
                Err(e) => debug!("丢弃无效的 UDP 消息: {}", e),
            }
        }
    }

    /// 单条消息序列化后的长度上限
    ///
    /// 取连接当前的 datagram 上限，不超过 [`MAX_DATAGRAM_FRAME_SIZE`]。
    pub fn max_message_size(&self) -> usize {
        self.channel
            .max_datagram_size()
            .map_or(MAX_DATAGRAM_FRAME_SIZE, |n| n.min(MAX_DATAGRAM_FRAME_SIZE))
    }

    /// 把消息序列化到 `buf` 后作为一个 datagram 发送
    ///
    /// 消息放不进 `buf` 时静默丢弃。
    pub fn send_message(&self, buf: &mut [u8], msg: &UdpMessage) -> Result<()> {
        let Some(n) = msg.serialize(buf) else {
            return Ok(());
        };
        self.channel.send_datagram(Bytes::copy_from_slice(&buf[..n]))
    }
}

struct Session {
    queue: mpsc::Sender<UdpMessage>,
    defragger: Defragger,
}

/// UDP 会话管理器
///
/// 后台任务循环接收消息并按会话 ID 分发；接收出错时所有会话以 `Eof` 结束。
pub struct UdpSessionManager<C> {
    io: Arc<DatagramIo<C>>,
    sessions: StdMutex<HashMap<u32, Session>>,
    next_id: AtomicU32,
    stopped: CancellationToken,
}

impl<C: DatagramChannel> UdpSessionManager<C> {
    pub fn new(io: DatagramIo<C>) -> Arc<Self> {
        let manager = Arc::new(Self {
            io: Arc::new(io),
            sessions: StdMutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            stopped: CancellationToken::new(),
        });
        tokio::spawn(receive_loop(manager.clone()));
        manager
    }

    /// 新建一个以 `addr` 为默认目标的 UDP 会话
    pub fn new_udp(self: &Arc<Self>, addr: &str) -> Result<UdpConn<C>> {
        if self.stopped.is_cancelled() {
            return Err(Error::Closed(io::Error::new(
                io::ErrorKind::NotConnected,
                "udp session manager stopped",
            )));
        }
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_SIZE);
        self.lock_sessions().insert(
            session_id,
            Session {
                queue: tx,
                defragger: Defragger::default(),
            },
        );
        debug!("新建 UDP 会话 {} -> {}", session_id, addr);
        Ok(UdpConn {
            session_id,
            addr: addr.to_string(),
            manager: self.clone(),
            queue: Mutex::new(rx),
            send_buf: Mutex::new(vec![0u8; MAX_DATAGRAM_FRAME_SIZE]),
            deadlines: DeadlineController::new(),
            closed: CancellationToken::new(),
        })
    }

    /// 当前存活的会话数
    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, session_id: u32) {
        self.lock_sessions().remove(&session_id);
    }

    fn dispatch(&self, msg: UdpMessage) {
        let mut sessions = self.lock_sessions();
        let Some(session) = sessions.get_mut(&msg.session_id) else {
            return;
        };
        let Some(msg) = session.defragger.feed(msg) else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(msg)) = session.queue.try_send(msg) {
            debug!("UDP 会话 {} 接收队列已满，丢弃消息", msg.session_id);
        }
    }
}

async fn receive_loop<C: DatagramChannel>(manager: Arc<UdpSessionManager<C>>) {
    loop {
        match manager.io.receive_message().await {
            Ok(msg) => manager.dispatch(msg),
            Err(e) => {
                debug!("UDP 接收循环结束: {}", e);
                break;
            }
        }
    }
    manager.stopped.cancel();
    // 丢弃所有发送端，各会话读到 Eof
    manager.lock_sessions().clear();
}

/// 单个 UDP 会话
pub struct UdpConn<C: DatagramChannel> {
    session_id: u32,
    addr: String,
    manager: Arc<UdpSessionManager<C>>,
    queue: Mutex<mpsc::Receiver<UdpMessage>>,
    send_buf: Mutex<Vec<u8>>,
    deadlines: DeadlineController,
    closed: CancellationToken,
}

impl<C: DatagramChannel> UdpConn<C> {
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// 接收一个数据包，返回长度和来源地址；比 `buf` 长的部分被截断
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, String)> {
        let read_scope = self.deadlines.read_scope();
        self.check_open(&read_scope)?;

        let mut queue = self.queue.lock().await;
        tokio::select! {
            biased;
            _ = read_scope.cancelled() => Err(Error::DeadlineExceeded),
            _ = self.closed.cancelled() => Err(Error::Eof),
            msg = queue.recv() => {
                let msg = msg.ok_or(Error::Eof)?;
                let n = buf.len().min(msg.data.len());
                buf[..n].copy_from_slice(&msg.data[..n]);
                Ok((n, msg.addr))
            }
        }
    }

    /// 向 `addr` 发送一个数据包，超过 datagram 上限时分片
    pub async fn send_to(&self, buf: &[u8], addr: &str) -> Result<usize> {
        self.check_open(&self.deadlines.write_scope())?;

        let mut msg = UdpMessage {
            session_id: self.session_id,
            packet_id: 0,
            frag_id: 0,
            frag_count: 1,
            addr: addr.to_string(),
            data: Bytes::copy_from_slice(buf),
        };
        // 上限随路径 MTU 变化，每次发送时重新读取
        let max_size = self.manager.io.max_message_size();
        let mut send_buf = self.send_buf.lock().await;
        let send_buf = &mut send_buf[..max_size];
        if msg.size() <= max_size {
            self.manager.io.send_message(send_buf, &msg)?;
            return Ok(buf.len());
        }

        msg.packet_id = rand::random_range(1..=u16::MAX);
        for frag in frag_udp_message(&msg, max_size) {
            self.manager.io.send_message(send_buf, &frag)?;
        }
        Ok(buf.len())
    }

    fn check_open(&self, scope: &CancellationToken) -> Result<()> {
        if scope.is_cancelled() {
            return Err(Error::DeadlineExceeded);
        }
        if self.closed.is_cancelled() {
            return Err(Error::Eof);
        }
        Ok(())
    }
}

#[async_trait]
impl<C: DatagramChannel> Conn for UdpConn<C> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let (n, _) = self.recv_from(buf).await?;
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.send_to(buf, &self.addr).await
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.manager.remove(self.session_id);
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.addr.parse().ok()
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.deadlines.set_deadline(deadline);
        Ok(())
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.deadlines.set_read_deadline(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.deadlines.set_write_deadline(deadline);
        Ok(())
    }
}

impl<C: DatagramChannel> Drop for UdpConn<C> {
    fn drop(&mut self) {
        if !self.closed.is_cancelled() {
            self.manager.remove(self.session_id);
        }
    }
}
