//! hysteria2 客户端配置

use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};

use common::utils::{create_configured_udp_socket, unspecified_addr_for};
use common::{Error, Result};

const DEFAULT_STREAM_RECEIVE_WINDOW: u64 = 8 * 1024 * 1024;
const DEFAULT_CONN_RECEIVE_WINDOW: u64 = DEFAULT_STREAM_RECEIVE_WINDOW * 5 / 2;
const MIN_RECEIVE_WINDOW: u64 = 16384;

const DEFAULT_MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(4);
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

const DEFAULT_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(10);
const MIN_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(2);
const MAX_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(60);

/// 为 QUIC 端点创建底层 UDP socket
pub trait ConnFactory: Send + Sync {
    fn new_socket(&self, server_addr: SocketAddr) -> io::Result<UdpSocket>;
}

/// 默认工厂：绑定与服务器地址族相同的通配地址
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpConnFactory;

impl ConnFactory for UdpConnFactory {
    fn new_socket(&self, server_addr: SocketAddr) -> io::Result<UdpSocket> {
        create_configured_udp_socket(unspecified_addr_for(server_addr))
    }
}

/// 证书校验回调，参数为对端证书链（叶子证书在前）
pub type VerifyPeerCertificate =
    Arc<dyn Fn(&[CertificateDer<'_>]) -> std::result::Result<(), String> + Send + Sync>;

/// TLS 配置
#[derive(Clone, Default)]
pub struct TlsConfig {
    /// SNI，同时用于证书主机名校验
    pub server_name: String,
    pub insecure_skip_verify: bool,
    /// 在证书链校验之后执行；跳过校验时单独执行
    pub verify_peer_certificate: Option<VerifyPeerCertificate>,
    /// 为空时使用内置的 webpki 根证书
    pub root_cas: Vec<CertificateDer<'static>>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server_name", &self.server_name)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("verify_peer_certificate", &self.verify_peer_certificate.is_some())
            .field("root_cas", &self.root_cas.len())
            .finish()
    }
}

/// QUIC 传输参数
///
/// 窗口大小为 0、超时为 `None` 时使用默认值。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuicConfig {
    #[serde(default)]
    pub initial_stream_receive_window: u64,
    #[serde(default)]
    pub max_stream_receive_window: u64,
    #[serde(default)]
    pub initial_connection_receive_window: u64,
    #[serde(default)]
    pub max_connection_receive_window: u64,

    /// 空闲超时（秒）
    #[serde(default, with = "duration_secs")]
    pub max_idle_timeout: Option<Duration>,

    /// 心跳间隔（秒）
    #[serde(default, with = "duration_secs")]
    pub keep_alive_period: Option<Duration>,

    #[serde(default)]
    pub disable_path_mtu_discovery: bool,
}

/// 带宽上限，单位字节/秒，0 表示未知
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BandwidthConfig {
    #[serde(default)]
    pub max_tx: u64,
    #[serde(default)]
    pub max_rx: u64,
}

/// 客户端配置
///
/// 使用前调用一次 [`ClientConfig::verify_and_fill`]，之后不再修改。
#[derive(Clone, Default)]
pub struct ClientConfig {
    pub conn_factory: Option<Arc<dyn ConnFactory>>,
    pub server_addr: Option<SocketAddr>,
    pub auth: String,
    pub tls: TlsConfig,
    pub quic: QuicConfig,
    pub bandwidth: BandwidthConfig,
    pub fast_open: bool,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_addr", &self.server_addr)
            .field("tls", &self.tls)
            .field("quic", &self.quic)
            .field("bandwidth", &self.bandwidth)
            .field("fast_open", &self.fast_open)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// 校验配置并填充默认值
    ///
    /// 只替换零值和 `None`，重复调用结果不变。
    pub fn verify_and_fill(&mut self) -> Result<()> {
        if self.server_addr.is_none() {
            return Err(config_error("server_addr", "must be set"));
        }
        if self.conn_factory.is_none() {
            self.conn_factory = Some(Arc::new(UdpConnFactory));
        }

        let quic = &mut self.quic;
        fill_window(
            &mut quic.initial_stream_receive_window,
            DEFAULT_STREAM_RECEIVE_WINDOW,
            "quic.initial_stream_receive_window",
        )?;
        fill_window(
            &mut quic.max_stream_receive_window,
            DEFAULT_STREAM_RECEIVE_WINDOW,
            "quic.max_stream_receive_window",
        )?;
        fill_window(
            &mut quic.initial_connection_receive_window,
            DEFAULT_CONN_RECEIVE_WINDOW,
            "quic.initial_connection_receive_window",
        )?;
        fill_window(
            &mut quic.max_connection_receive_window,
            DEFAULT_CONN_RECEIVE_WINDOW,
            "quic.max_connection_receive_window",
        )?;
        fill_duration(
            &mut quic.max_idle_timeout,
            DEFAULT_MAX_IDLE_TIMEOUT,
            MIN_IDLE_TIMEOUT..=MAX_IDLE_TIMEOUT,
            "quic.max_idle_timeout",
        )?;
        fill_duration(
            &mut quic.keep_alive_period,
            DEFAULT_KEEP_ALIVE_PERIOD,
            MIN_KEEP_ALIVE_PERIOD..=MAX_KEEP_ALIVE_PERIOD,
            "quic.keep_alive_period",
        )?;

        Ok(())
    }

    pub(crate) fn factory(&self) -> Arc<dyn ConnFactory> {
        self.conn_factory
            .clone()
            .unwrap_or_else(|| Arc::new(UdpConnFactory))
    }
}

fn config_error(field: &'static str, reason: &'static str) -> Error {
    Error::Config { field, reason }
}

fn fill_window(value: &mut u64, default: u64, field: &'static str) -> Result<()> {
    if *value == 0 {
        *value = default;
    } else if *value < MIN_RECEIVE_WINDOW {
        return Err(config_error(field, "must be at least 16384"));
    }
    Ok(())
}

fn fill_duration(
    value: &mut Option<Duration>,
    default: Duration,
    range: std::ops::RangeInclusive<Duration>,
    field: &'static str,
) -> Result<()> {
    match value {
        None => *value = Some(default),
        Some(d) if d.is_zero() => *value = Some(default),
        Some(d) if !range.contains(d) => return Err(config_error(field, "out of range")),
        Some(_) => {}
    }
    Ok(())
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
