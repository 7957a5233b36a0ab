//! 隧道传输公共库
//!
//! 此库包含 gRPC 隧道服务端与 hysteria2 客户端共享的代码：
//! 错误分类、截止时间控制、统一连接接口、gun gRPC 定义与流适配器。

pub mod deadline;
pub mod error;
pub mod grpc;
pub mod tunnel;
pub mod utils;

pub use deadline::DeadlineController;
pub use error::{Error, Result};
pub use tunnel::Conn;
