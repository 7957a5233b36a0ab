//! 多协议隧道的传输适配层
//!
//! - [`server`]: gun gRPC 隧道服务端，把每个 `Tun` 调用变成一个连接
//! - [`client`]: 隧道协议客户端（hysteria2）

pub mod client;
pub mod server;

pub use client::ProxyClient;
pub use common::{Conn, Error, Result};
pub use server::{ConnHandler, GunServer};
