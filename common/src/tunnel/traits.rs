//! 隧道连接 trait 定义
//!
//! 此模块定义了与普通 socket 等价的字节流连接接口：读写各自独立、
//! 各有可撤销的截止时间，关闭后阻塞中的读写立即返回。
//! gRPC 流适配器、hysteria2 的 TCP/UDP 连接都实现这个接口。

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::time::Instant;

use crate::error::Result;

/// 统一连接接口
///
/// 所有方法都只需要 `&self`：同一个连接上可以并发地进行一次读和一次写，互不阻塞。
#[async_trait]
pub trait Conn: Send + Sync {
    /// 读取一些字节
    ///
    /// # Returns
    /// * `Ok(n)` - 读到 n 字节
    ///
    /// # Errors
    /// * `Error::DeadlineExceeded` - 读截止时间已到
    /// * `Error::Eof` - 流已结束或连接已关闭
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// 写入整个缓冲区
    ///
    /// 要么全部写入并返回 `buf.len()`，要么失败，不会出现部分写入。
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// 关闭连接（幂等）
    async fn close(&self) -> Result<()>;

    /// 本地地址（仅供参考）
    fn local_addr(&self) -> Option<SocketAddr>;

    /// 远程地址
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// 同时设置读写截止时间，`None` 表示不设截止时间
    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()>;

    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()>;

    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()>;
}
