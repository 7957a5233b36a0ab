//! gun 隧道的 gRPC 定义
//!
//! 服务 `gun.GunService` 有两个双向流方法：`Tun` 承载一条隧道连接，
//! `TunDatagram` 目前只被接受、不做转发。

mod conn;

pub use conn::*;

/// 隧道流上交换的一个不透明数据块
#[derive(Clone, PartialEq, prost::Message)]
pub struct Hunk {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: bytes::Bytes,
}

// 导出 build.rs 生成的服务代码
pub mod gun {
    include!(concat!(env!("OUT_DIR"), "/gun.GunService.rs"));
}

// 重新导出常用类型
pub use gun::gun_service_client::GunServiceClient;
pub use gun::gun_service_server::{GunService, GunServiceServer};
