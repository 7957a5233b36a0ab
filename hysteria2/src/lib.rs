//! hysteria2 客户端
//!
//! 基于 QUIC 的代理协议：HTTP/3 认证握手、拥塞控制选择、
//! 每个 TCP 请求一条 QUIC 流、UDP 走 QUIC datagram。

pub mod client;
pub mod config;
pub mod congestion;
pub mod conn;
pub mod frag;
pub mod protocol;
pub mod tls;
pub mod udp;

pub use client::{Client, HandshakeInfo};
pub use config::{BandwidthConfig, ClientConfig, ConnFactory, QuicConfig, TlsConfig, UdpConnFactory};
pub use conn::{wrap_if_connection_closed, TcpConn};
pub use udp::{DatagramIo, UdpConn};
