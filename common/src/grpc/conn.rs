//! gRPC 双向流连接适配器
//!
//! 把"一次调用收/发一条消息"的 gRPC 双向流包装成带截止时间的字节流连接：
//! - 每次读/写都派生一个后台任务执行一次阻塞的接收/发送，结果通过单槽 oneshot 通道送回；
//! - 调用方在 {完成, 截止时间作用域, 关闭作用域} 之间竞争，截止时间或关闭立即返回；
//! - 一条消息比调用方缓冲区大时，剩余部分留在内部缓冲区，后续读取直接从中返回。
//!
//! 已知限制：截止时间或关闭不会真正中止进行中的接收/发送，后台任务会一直运行到底层调用返回
//! （每个被放弃的调用最多遗留一个任务，oneshot 通道保证它总能交付结果后退出）。

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status, Streaming};
use tracing::debug;

use super::Hunk;
use crate::deadline::DeadlineController;
use crate::error::{Error, Result};
use crate::tunnel::Conn;

/// 消息流接口
///
/// 对底层双向流的最小抽象：一次 `recv` 收一条消息，一次 `send` 发一条消息。
#[async_trait]
pub trait HunkStream: Send + Sync + 'static {
    /// 接收一条消息
    ///
    /// # Returns
    /// * `Ok(Some(data))` - 收到一条消息
    /// * `Ok(None)` - 对端已结束发送
    async fn recv(&self) -> std::result::Result<Option<Bytes>, Status>;

    /// 发送一条消息
    async fn send(&self, data: Bytes) -> std::result::Result<(), Status>;

    /// 对端地址（来自 RPC 请求的对端信息）
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// 服务端 `Tun` 调用的消息流
///
/// 入站方向是请求流，出站方向是响应流背后的通道。
pub struct TunStream {
    inbound: Mutex<Streaming<Hunk>>,
    outbound: mpsc::Sender<std::result::Result<Hunk, Status>>,
    remote_addr: Option<SocketAddr>,
}

impl TunStream {
    pub fn new(
        inbound: Streaming<Hunk>,
        outbound: mpsc::Sender<std::result::Result<Hunk, Status>>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            inbound: Mutex::new(inbound),
            outbound,
            remote_addr,
        }
    }
}

#[async_trait]
impl HunkStream for TunStream {
    async fn recv(&self) -> std::result::Result<Option<Bytes>, Status> {
        let mut inbound = self.inbound.lock().await;
        Ok(inbound.message().await?.map(|hunk| hunk.data))
    }

    async fn send(&self, data: Bytes) -> std::result::Result<(), Status> {
        self.outbound
            .send(Ok(Hunk { data }))
            .await
            .map_err(|_| Status::unavailable("tun response stream closed"))
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

/// 一次后台接收交付给 `read` 的结果
type PendingReceive = std::result::Result<Option<Bytes>, Status>;

/// 上一条消息中尚未被读走的字节
#[derive(Default)]
struct Leftover {
    buf: Option<Vec<u8>>,
    offset: usize,
}

impl Leftover {
    /// 有剩余字节时拷贝到 `dst` 并返回拷贝的长度，全部读完后释放缓冲区
    fn drain_into(&mut self, dst: &mut [u8]) -> Option<usize> {
        let buf = self.buf.as_ref()?;
        let n = copy_from(dst, &buf[self.offset..]);
        self.offset += n;
        if self.offset == buf.len() {
            self.buf = None;
            self.offset = 0;
        }
        Some(n)
    }

    fn retain(&mut self, rest: &[u8]) {
        if rest.is_empty() {
            return;
        }
        self.buf = Some(rest.to_vec());
        self.offset = 0;
    }
}

/// gRPC 流连接
///
/// 每个入站 `Tun` 调用对应一个实例，生命周期与该调用相同。
pub struct GunConn<S: HunkStream> {
    stream: Arc<S>,
    local_addr: Option<SocketAddr>,
    /// 读路径锁，同时保护剩余缓冲区
    reading: Mutex<Leftover>,
    writing: Mutex<()>,
    /// 保证同一时刻最多一个后台接收/发送在底层流上执行
    recv_gate: Arc<Mutex<()>>,
    send_gate: Arc<Mutex<()>>,
    deadlines: DeadlineController,
    closed: CancellationToken,
}

impl<S: HunkStream> GunConn<S> {
    pub fn new(stream: S, local_addr: Option<SocketAddr>) -> Self {
        Self {
            stream: Arc::new(stream),
            local_addr,
            reading: Mutex::new(Leftover::default()),
            writing: Mutex::new(()),
            recv_gate: Arc::new(Mutex::new(())),
            send_gate: Arc::new(Mutex::new(())),
            deadlines: DeadlineController::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
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
impl<S: HunkStream> Conn for GunConn<S> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_open(&self.deadlines.read_scope())?;

        let mut leftover = self.reading.lock().await;
        if let Some(n) = leftover.drain_into(buf) {
            return Ok(n);
        }

        let (done_tx, done_rx) = oneshot::channel::<PendingReceive>();
        let stream = self.stream.clone();
        let gate = self.recv_gate.clone();
        tokio::spawn(async move {
            let _gate = gate.lock_owned().await;
            let _ = done_tx.send(stream.recv().await);
        });

        let read_scope = self.deadlines.read_scope();
        tokio::select! {
            biased;
            _ = read_scope.cancelled() => Err(Error::DeadlineExceeded),
            _ = self.closed.cancelled() => Err(Error::Eof),
            pending = done_rx => {
                let payload = match pending {
                    Ok(Ok(Some(payload))) => payload,
                    Ok(Ok(None)) => return Err(Error::Eof),
                    Ok(Err(status)) => return Err(translate_status(status)),
                    // 后台任务没能交付结果（运行时正在关闭）
                    Err(_) => return Err(Error::Eof),
                };
                let n = copy_from(buf, &payload);
                leftover.retain(&payload[n..]);
                Ok(n)
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.check_open(&self.deadlines.write_scope())?;

        let _writing = self.writing.lock().await;

        let (done_tx, done_rx) = oneshot::channel();
        let stream = self.stream.clone();
        let gate = self.send_gate.clone();
        let data = Bytes::copy_from_slice(buf);
        tokio::spawn(async move {
            let _gate = gate.lock_owned().await;
            let _ = done_tx.send(stream.send(data).await);
        });

        let write_scope = self.deadlines.write_scope();
        tokio::select! {
            biased;
            _ = write_scope.cancelled() => Err(Error::DeadlineExceeded),
            _ = self.closed.cancelled() => Err(Error::Eof),
            sent = done_rx => match sent {
                Ok(Ok(())) => Ok(buf.len()),
                Ok(Err(status)) => Err(translate_status(status)),
                Err(_) => Err(Error::Eof),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.is_cancelled() {
            debug!("关闭 gRPC 隧道连接: {:?}", self.stream.remote_addr());
            self.closed.cancel();
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.stream.remote_addr()
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

/// `Unavailable` / `OutOfRange` 表示对端已关闭，按流结束处理
pub fn translate_status(status: Status) -> Error {
    match status.code() {
        Code::Unavailable | Code::OutOfRange => Error::Eof,
        _ => Error::Status(status),
    }
}

fn copy_from(dst: &mut [u8], src: &[u8]) -> usize {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// 内存消息流：入站消息由测试推入，出站消息被测试取走
    struct MockStream {
        inbound: Mutex<mpsc::UnboundedReceiver<std::result::Result<Bytes, Status>>>,
        outbound: mpsc::UnboundedSender<Bytes>,
        send_delay: Option<Duration>,
    }

    #[async_trait]
    impl HunkStream for MockStream {
        async fn recv(&self) -> std::result::Result<Option<Bytes>, Status> {
            self.inbound.lock().await.recv().await.transpose()
        }

        async fn send(&self, data: Bytes) -> std::result::Result<(), Status> {
            if let Some(delay) = self.send_delay {
                tokio::time::sleep(delay).await;
            }
            self.outbound
                .send(data)
                .map_err(|_| Status::unavailable("peer gone"))
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            "127.0.0.1:9000".parse().ok()
        }
    }

    type Inbound = mpsc::UnboundedSender<std::result::Result<Bytes, Status>>;
    type Outbound = mpsc::UnboundedReceiver<Bytes>;

    fn mock_conn(send_delay: Option<Duration>) -> (GunConn<MockStream>, Inbound, Outbound) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let stream = MockStream {
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
            send_delay,
        };
        (GunConn::new(stream, None), in_tx, out_rx)
    }

    #[tokio::test]
    async fn test_large_message_split_across_reads() {
        let (conn, inbound, _outbound) = mock_conn(None);
        let message: Vec<u8> = (0u8..10).collect();
        inbound.send(Ok(Bytes::from(message.clone()))).unwrap();

        let mut received = Vec::new();
        let mut reads = 0;
        while received.len() < message.len() {
            let mut buf = [0u8; 3];
            let n = conn.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
            reads += 1;
        }

        // ceil(10 / 3) = 4
        assert_eq!(reads, 4);
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_leftover_drained_before_next_message() {
        let (conn, inbound, _outbound) = mock_conn(None);
        inbound.send(Ok(Bytes::from_static(b"hello"))).unwrap();
        inbound.send(Ok(Bytes::from_static(b"world"))).unwrap();

        let mut buf = [0u8; 4];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hell");
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"o");
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"worl");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_refresh() {
        let (conn, inbound, _outbound) = mock_conn(None);

        conn.set_read_deadline(Some(Instant::now() - Duration::from_secs(1)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            conn.read(&mut buf).await,
            Err(Error::DeadlineExceeded)
        ));

        conn.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)))
            .unwrap();
        inbound.send(Ok(Bytes::from_static(b"ok"))).unwrap();
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_expires_while_waiting() {
        let (conn, _inbound, _outbound) = mock_conn(None);
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)))
            .unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            conn.read(&mut buf).await,
            Err(Error::DeadlineExceeded)
        ));
        // 作用域保持触发，直到重新设置
        assert!(matches!(
            conn.read(&mut buf).await,
            Err(Error::DeadlineExceeded)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_deadline_does_not_affect_read() {
        let (conn, inbound, _outbound) = mock_conn(Some(Duration::from_secs(30)));
        let conn = Arc::new(conn);

        conn.set_write_deadline(Some(Instant::now() + Duration::from_millis(50)))
            .unwrap();
        let writer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.write(b"slow").await })
        };
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                tokio::time::sleep(Duration::from_millis(200)).await;
                conn.read(&mut buf).await.map(|n| buf[..n].to_vec())
            })
        };
        inbound.send(Ok(Bytes::from_static(b"data"))).unwrap();

        assert!(matches!(
            writer.await.unwrap(),
            Err(Error::DeadlineExceeded)
        ));
        assert_eq!(reader.await.unwrap().unwrap(), b"data");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_does_not_affect_write() {
        let (conn, _inbound, mut outbound) = mock_conn(None);
        let conn = Arc::new(conn);

        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)))
            .unwrap();
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                conn.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            reader.await.unwrap(),
            Err(Error::DeadlineExceeded)
        ));

        assert_eq!(conn.write(b"ping").await.unwrap(), 4);
        assert_eq!(outbound.recv().await.unwrap(), Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn test_status_translated_to_eof() {
        let (conn, inbound, _outbound) = mock_conn(None);
        inbound.send(Err(Status::unavailable("gone"))).unwrap();
        inbound.send(Err(Status::out_of_range("done"))).unwrap();
        inbound.send(Err(Status::internal("boom"))).unwrap();

        let mut buf = [0u8; 8];
        assert!(conn.read(&mut buf).await.unwrap_err().is_eof());
        assert!(conn.read(&mut buf).await.unwrap_err().is_eof());
        assert!(matches!(
            conn.read(&mut buf).await,
            Err(Error::Status(s)) if s.code() == Code::Internal
        ));
    }

    #[tokio::test]
    async fn test_send_to_closed_peer_is_eof() {
        let (conn, _inbound, outbound) = mock_conn(None);
        drop(outbound);
        assert!(conn.write(b"lost").await.unwrap_err().is_eof());
    }

    #[tokio::test]
    async fn test_end_of_inbound_stream_is_eof() {
        let (conn, inbound, _outbound) = mock_conn(None);
        drop(inbound);
        let mut buf = [0u8; 8];
        assert!(conn.read(&mut buf).await.unwrap_err().is_eof());
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (conn, _inbound, _outbound) = mock_conn(None);
        let conn = Arc::new(conn);
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                conn.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(reader.await.unwrap().unwrap_err().is_eof());
        assert!(conn.is_closed());
        assert!(conn.write(b"x").await.unwrap_err().is_eof());
    }

    #[tokio::test]
    async fn test_remote_addr_from_stream() {
        let (conn, _inbound, _outbound) = mock_conn(None);
        assert_eq!(conn.remote_addr(), "127.0.0.1:9000".parse().ok());
        assert_eq!(conn.local_addr(), None);
    }
}
