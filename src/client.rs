//! 代理客户端
//!
//! 按隧道协议分派的统一入口，目前只有 hysteria2。

use common::{Conn, Result};
use hysteria2::{ClientConfig, HandshakeInfo};
use tracing::debug;

/// 隧道协议客户端
pub enum ProxyClient {
    Hysteria2(hysteria2::Client),
}

impl ProxyClient {
    /// 连接 hysteria2 服务器并完成握手
    pub async fn hysteria2(config: ClientConfig) -> Result<(Self, HandshakeInfo)> {
        let (client, info) = hysteria2::Client::connect(config).await?;
        Ok((ProxyClient::Hysteria2(client), info))
    }

    /// 打开到 `addr` 的 TCP 隧道
    pub async fn tcp(&self, addr: &str) -> Result<Box<dyn Conn>> {
        debug!("打开 TCP 隧道: {}", addr);
        match self {
            ProxyClient::Hysteria2(client) => Ok(Box::new(client.tcp(addr).await?)),
        }
    }

    /// 新建以 `addr` 为目标的 UDP 会话
    pub fn udp(&self, addr: &str) -> Result<Box<dyn Conn>> {
        match self {
            ProxyClient::Hysteria2(client) => Ok(Box::new(client.udp(addr)?)),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            ProxyClient::Hysteria2(client) => client.close(),
        }
    }
}
