//! hysteria2 客户端
//!
//! 建立 QUIC 连接后发送一次 HTTP/3 认证请求，根据服务端的回复选择拥塞控制算法，
//! 之后在同一个连接上打开 TCP 隧道流和 UDP 会话。

use std::future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{Endpoint, EndpointConfig, IdleTimeout, TokioRuntime, TransportConfig, VarInt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use common::{Error, Result};

use crate::config::{ClientConfig, QuicConfig};
use crate::congestion::{select_congestion, SwitchableCongestion};
use crate::conn::{wrap_if_connection_closed, TcpConn};
use crate::protocol::{
    auth_request_to_headers, auth_response_from_headers, AuthRequest, STATUS_AUTH_OK, URL_HOST, URL_PATH,
};
use crate::tls::build_client_config;
use crate::udp::{DatagramIo, UdpConn, UdpSessionManager};

/// 正常关闭
pub const CLOSE_ERR_CODE_OK: u32 = 0x100;
/// 协议错误
pub const CLOSE_ERR_CODE_PROTOCOL_ERROR: u32 = 0x101;

/// 建立连接（含认证）的超时时间
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 握手结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub udp_enabled: bool,
    /// 实际发送速率（字节/秒），使用 BBR 时为 0
    pub tx: u64,
}

/// 认证期间建立的 HTTP/3 会话
///
/// 丢弃 `SendRequest` 会关闭整个 QUIC 连接，所以它和驱动任务要与客户端同生命周期。
struct H3Session {
    _send_request: h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>,
    driver: JoinHandle<()>,
}

impl Drop for H3Session {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// hysteria2 客户端
pub struct Client {
    config: ClientConfig,
    endpoint: Endpoint,
    conn: quinn::Connection,
    udp: Option<Arc<UdpSessionManager<quinn::Connection>>>,
    _h3: H3Session,
}

impl Client {
    /// 连接服务器并完成认证
    pub async fn connect(mut config: ClientConfig) -> Result<(Self, HandshakeInfo)> {
        config.verify_and_fill()?;
        let server_addr = config
            .server_addr
            .ok_or(Error::Config {
                field: "server_addr",
                reason: "must be set",
            })?;

        let socket = config
            .factory()
            .new_socket(server_addr)
            .map_err(Error::connect)?;
        let endpoint = Endpoint::new(EndpointConfig::default(), None, socket, Arc::new(TokioRuntime))
            .map_err(Error::connect)?;

        let congestion = SwitchableCongestion::new();
        let client_config = quic_client_config(&config, congestion.clone())?;
        let server_name = if config.tls.server_name.is_empty() {
            server_addr.ip().to_string()
        } else {
            config.tls.server_name.clone()
        };

        let handshake = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            Self::handshake(&endpoint, client_config, server_addr, &server_name, &config),
        )
        .await
        .unwrap_or_else(|_| Err(HandshakeError::transport(None, "handshake timed out")));

        let (conn, h3, auth) = match handshake {
            Ok(v) => v,
            Err(HandshakeError { conn, error }) => {
                if let Some(conn) = conn {
                    conn.close(VarInt::from_u32(CLOSE_ERR_CODE_PROTOCOL_ERROR), b"");
                }
                endpoint.close(VarInt::from_u32(CLOSE_ERR_CODE_PROTOCOL_ERROR), b"");
                warn!("hysteria2 握手失败: {}", error);
                return Err(error);
            }
        };

        let (strategy, tx) = select_congestion(auth.rx_auto, auth.rx, config.bandwidth.max_tx);
        congestion.switch(strategy);
        info!(
            "hysteria2 认证成功: {}, 拥塞控制: {:?}, UDP: {}",
            server_addr, strategy, auth.udp_enabled
        );

        let udp = auth
            .udp_enabled
            .then(|| UdpSessionManager::new(DatagramIo::new(conn.clone())));

        let client = Self {
            config,
            endpoint,
            conn,
            udp,
            _h3: h3,
        };
        let info = HandshakeInfo {
            udp_enabled: auth.udp_enabled,
            tx,
        };
        Ok((client, info))
    }

    async fn handshake(
        endpoint: &Endpoint,
        client_config: quinn::ClientConfig,
        server_addr: SocketAddr,
        server_name: &str,
        config: &ClientConfig,
    ) -> std::result::Result<(quinn::Connection, H3Session, crate::protocol::AuthResponse), HandshakeError> {
        let connecting = endpoint
            .connect_with(client_config, server_addr, server_name)
            .map_err(|e| HandshakeError::transport(None, e))?;
        let conn = connecting
            .await
            .map_err(|e| HandshakeError::transport(None, e))?;

        let on_err = |e: Box<dyn std::error::Error + Send + Sync>| HandshakeError {
            conn: Some(conn.clone()),
            error: Error::Connect(e),
        };

        let (mut driver, mut send_request) = h3::client::new(h3_quinn::Connection::new(conn.clone()))
            .await
            .map_err(|e| on_err(e.into()))?;
        let driver = tokio::spawn(async move {
            if let Err(e) = future::poll_fn(|cx| driver.poll_close(cx)).await {
                debug!("HTTP/3 连接结束: {}", e);
            }
        });
        let h3 = H3Session {
            _send_request: send_request.clone(),
            driver,
        };

        let mut headers = HeaderMap::new();
        auth_request_to_headers(
            &mut headers,
            &AuthRequest {
                auth: config.auth.clone(),
                rx: config.bandwidth.max_rx,
            },
        )
        .map_err(|e| on_err(e.into()))?;
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(format!("https://{}{}", URL_HOST, URL_PATH))
            .body(())
            .map_err(|e| on_err(e.into()))?;
        *request.headers_mut() = headers;

        let mut stream = send_request
            .send_request(request)
            .await
            .map_err(|e| on_err(e.into()))?;
        stream.finish().await.map_err(|e| on_err(e.into()))?;
        let response = stream
            .recv_response()
            .await
            .map_err(|e| on_err(e.into()))?;

        let status = response.status().as_u16();
        if status != STATUS_AUTH_OK {
            return Err(HandshakeError {
                conn: Some(conn),
                error: Error::Auth { status },
            });
        }
        let auth = auth_response_from_headers(response.headers());
        Ok((conn, h3, auth))
    }

    /// 打开到 `addr` 的 TCP 隧道
    pub async fn tcp(&self, addr: &str) -> Result<TcpConn> {
        let local_addr = self.endpoint.local_addr().ok();
        TcpConn::dial(&self.conn, addr, self.config.fast_open, local_addr).await
    }

    /// 新建以 `addr` 为默认目标的 UDP 会话
    pub fn udp(&self, addr: &str) -> Result<UdpConn<quinn::Connection>> {
        match &self.udp {
            Some(manager) => manager.new_udp(addr),
            None => Err(Error::dial("UDP not enabled")),
        }
    }

    /// 关闭连接，错误被忽略
    pub fn close(&self) -> Result<()> {
        self.conn.close(VarInt::from_u32(CLOSE_ERR_CODE_OK), b"");
        self.endpoint.close(VarInt::from_u32(CLOSE_ERR_CODE_OK), b"");
        Ok(())
    }

    /// 连接是否已关闭
    pub fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    /// 连接关闭的原因，按 [`wrap_if_connection_closed`] 分类
    pub fn close_error(&self) -> Option<Error> {
        self.conn
            .close_reason()
            .map(|reason| wrap_if_connection_closed(reason.into()))
    }
}

/// 握手失败时携带已建立的连接，以便用协议错误码关闭
struct HandshakeError {
    conn: Option<quinn::Connection>,
    error: Error,
}

impl HandshakeError {
    fn transport<E>(conn: Option<quinn::Connection>, err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            conn,
            error: Error::connect(err),
        }
    }
}

/// 按配置构建 QUIC 客户端参数，datagram 始终启用
fn quic_client_config(config: &ClientConfig, congestion: Arc<SwitchableCongestion>) -> Result<quinn::ClientConfig> {
    let crypto = build_client_config(&config.tls)?;
    let crypto = QuicClientConfig::try_from(crypto).map_err(Error::connect)?;

    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport_config(&config.quic, congestion)?));
    Ok(client_config)
}

fn transport_config(quic: &QuicConfig, congestion: Arc<SwitchableCongestion>) -> Result<TransportConfig> {
    let invalid = |field: &'static str| Error::Config {
        field,
        reason: "out of range",
    };

    let mut transport = TransportConfig::default();
    transport.stream_receive_window(
        VarInt::try_from(quic.max_stream_receive_window)
            .map_err(|_| invalid("quic.max_stream_receive_window"))?,
    );
    transport.receive_window(
        VarInt::try_from(quic.max_connection_receive_window)
            .map_err(|_| invalid("quic.max_connection_receive_window"))?,
    );
    if let Some(idle) = quic.max_idle_timeout {
        transport.max_idle_timeout(Some(
            IdleTimeout::try_from(idle).map_err(|_| invalid("quic.max_idle_timeout"))?,
        ));
    }
    transport.keep_alive_interval(quic.keep_alive_period);
    if quic.disable_path_mtu_discovery {
        transport.mtu_discovery_config(None);
    }
    transport.congestion_controller_factory(congestion);
    Ok(transport)
}
