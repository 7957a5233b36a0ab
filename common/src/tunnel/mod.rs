//! 隧道模块
//!
//! 此模块提供了统一的连接抽象层，gRPC 和 QUIC 两种传输都通过它对外暴露字节流连接。

mod traits;

pub use traits::*;
