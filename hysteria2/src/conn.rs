//! hysteria2 TCP 隧道连接
//!
//! 每个 TCP 代理请求占用一条 QUIC 双向流：先写请求帧，再读响应帧，之后就是原始字节流。
//! 启用 fast open 时不等待响应，由后台任务读取响应帧，第一次读取时取回校验结果。

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use quinn::{RecvStream, SendStream, VarInt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::{Conn, DeadlineController, Error, Result};

use crate::protocol::{read_tcp_response, write_tcp_request};

/// 连接层的 I/O 错误分类
///
/// 暂时性的错误原样返回，其他错误都说明 QUIC 连接已经不可用。
pub fn wrap_if_connection_closed(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            Error::Io(err)
        }
        _ => Error::Closed(err),
    }
}

/// 把建立隧道过程中的错误归为 [`wrap_if_connection_closed`] 的分类
pub(crate) fn classify(err: Error) -> Error {
    match err {
        Error::Io(e) => wrap_if_connection_closed(e),
        Error::Closed(_) | Error::Dial { .. } => err,
        other => Error::Closed(io::Error::other(other)),
    }
}

enum RecvHalf {
    /// 响应帧还在后台读取，成功后交回接收流
    ///
    /// 读取超时只放弃等待，不会截断响应帧。
    Pending(JoinHandle<Result<RecvStream>>),
    Ready(RecvStream),
    /// 远端拒绝或响应无效
    Failed,
}

/// TCP 隧道连接
pub struct TcpConn {
    send: Mutex<SendStream>,
    recv: Mutex<RecvHalf>,
    local_addr: Option<SocketAddr>,
    remote_addr: SocketAddr,
    deadlines: DeadlineController,
    closed: CancellationToken,
}

impl TcpConn {
    /// 在 `conn` 上打开一条新流并发送到 `addr` 的隧道请求
    ///
    /// 不启用 fast open 时同步读取响应，远端拒绝会在这里返回 `Error::Dial`。
    pub async fn dial(
        conn: &quinn::Connection,
        addr: &str,
        fast_open: bool,
        local_addr: Option<SocketAddr>,
    ) -> Result<Self> {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| wrap_if_connection_closed(e.into()))?;

        if let Err(e) = write_tcp_request(&mut send, addr).await {
            abort_streams(&mut send, &mut recv);
            return Err(classify(e));
        }

        if !fast_open {
            match read_tcp_response(&mut recv).await {
                Ok((true, _)) => {}
                Ok((false, msg)) => {
                    abort_streams(&mut send, &mut recv);
                    return Err(Error::dial(format!("from remote: {}", msg)));
                }
                Err(e) => {
                    abort_streams(&mut send, &mut recv);
                    return Err(classify(e));
                }
            }
        }

        debug!("TCP 隧道已建立: {} (fast open: {})", addr, fast_open);
        let recv = if fast_open {
            RecvHalf::Pending(tokio::spawn(validate_response(recv)))
        } else {
            RecvHalf::Ready(recv)
        };
        Ok(Self {
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            local_addr,
            remote_addr: conn.remote_address(),
            deadlines: DeadlineController::new(),
            closed: CancellationToken::new(),
        })
    }

    /// 结束发送方向，对端会读到 EOF
    pub async fn close_write(&self) -> Result<()> {
        let _ = self.send.lock().await.finish();
        Ok(())
    }

    /// 停止接收方向
    pub async fn close_read(&self) -> Result<()> {
        let mut half = self.recv.lock().await;
        match &mut *half {
            RecvHalf::Ready(stream) => {
                let _ = stream.stop(VarInt::from_u32(0));
            }
            RecvHalf::Pending(task) => {
                task.abort();
                *half = RecvHalf::Failed;
            }
            RecvHalf::Failed => {}
        }
        Ok(())
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

impl Drop for TcpConn {
    fn drop(&mut self) {
        if let RecvHalf::Pending(task) = self.recv.get_mut() {
            task.abort();
        }
    }
}

/// 读取 fast open 流的响应帧，成功时交回接收流
async fn validate_response(mut recv: RecvStream) -> Result<RecvStream> {
    match read_tcp_response(&mut recv).await {
        Ok((true, _)) => Ok(recv),
        Ok((false, msg)) => {
            let _ = recv.stop(VarInt::from_u32(0));
            Err(Error::dial(msg))
        }
        Err(e) => {
            let _ = recv.stop(VarInt::from_u32(0));
            Err(classify(e))
        }
    }
}

async fn read_established(half: &mut RecvHalf, buf: &mut [u8]) -> Result<usize> {
    if let RecvHalf::Pending(task) = half {
        // JoinHandle 可以安全地重复等待
        let res = task
            .await
            .unwrap_or_else(|e| Err(Error::Closed(io::Error::other(e))));
        match res {
            Ok(stream) => *half = RecvHalf::Ready(stream),
            Err(e) => {
                *half = RecvHalf::Failed;
                return Err(e);
            }
        }
    }
    match half {
        RecvHalf::Ready(stream) => match stream.read(buf).await {
            Ok(Some(n)) => Ok(n),
            Ok(None) => Err(Error::Eof),
            Err(e) => Err(wrap_if_connection_closed(e.into())),
        },
        RecvHalf::Pending(_) | RecvHalf::Failed => Err(Error::Eof),
    }
}

fn abort_streams(send: &mut SendStream, recv: &mut RecvStream) {
    let _ = send.reset(VarInt::from_u32(0));
    let _ = recv.stop(VarInt::from_u32(0));
}

#[async_trait]
impl Conn for TcpConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let read_scope = self.deadlines.read_scope();
        self.check_open(&read_scope)?;

        let mut half = self.recv.lock().await;
        tokio::select! {
            biased;
            _ = read_scope.cancelled() => Err(Error::DeadlineExceeded),
            _ = self.closed.cancelled() => Err(Error::Eof),
            res = read_established(&mut half, buf) => res,
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let write_scope = self.deadlines.write_scope();
        self.check_open(&write_scope)?;

        let mut send = self.send.lock().await;
        tokio::select! {
            biased;
            _ = write_scope.cancelled() => Err(Error::DeadlineExceeded),
            _ = self.closed.cancelled() => Err(Error::Eof),
            res = send.write_all(buf) => match res {
                Ok(()) => Ok(buf.len()),
                Err(e) => Err(wrap_if_connection_closed(e.into())),
            },
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        self.close_write().await?;
        self.close_read().await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
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
