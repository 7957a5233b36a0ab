//! 错误类型定义
//!
//! 传输层错误在边界处只分类一次，之后按下面的分类向上传递，本层不做任何重试。

use std::io;

use thiserror::Error;

/// 通用结果类型
pub type Result<T> = std::result::Result<T, Error>;

/// 隧道传输错误
#[derive(Debug, Error)]
pub enum Error {
    /// 读/写截止时间已到（作用域已被触发）
    #[error("i/o deadline exceeded")]
    DeadlineExceeded,

    /// 对端正常或异常结束了流
    #[error("end of stream")]
    Eof,

    /// 认证之前（或认证过程中）的传输层失败
    #[error("connect error: {0}")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// 认证返回了非成功状态码
    #[error("authentication error, HTTP status code: {status}")]
    Auth { status: u16 },

    /// 隧道请求被拒绝，或 UDP 未启用
    #[error("dial error: {message}")]
    Dial { message: String },

    /// 底层连接已被判定为永久关闭
    #[error("connection closed: {0}")]
    Closed(#[source] io::Error),

    /// 配置校验失败
    #[error("invalid config: {field}: {reason}")]
    Config {
        field: &'static str,
        reason: &'static str,
    },

    /// 未被翻译为 EOF 的 gRPC 状态
    #[error("transport status: {0}")]
    Status(#[from] tonic::Status),

    /// 对端发来的数据不符合协议格式
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn connect<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Connect(err.into())
    }

    pub fn dial(message: impl Into<String>) -> Self {
        Error::Dial {
            message: message.into(),
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Error::DeadlineExceeded)
    }
}

/// 转换为 `io::Error`，便于接入基于 std/tokio I/O 的调用方
impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::DeadlineExceeded => io::Error::new(io::ErrorKind::TimedOut, err),
            Error::Eof => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            Error::Io(e) => e,
            Error::Closed(_) => io::Error::new(io::ErrorKind::NotConnected, err),
            other => io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let e: io::Error = Error::DeadlineExceeded.into();
        assert_eq!(e.kind(), io::ErrorKind::TimedOut);

        let e: io::Error = Error::Eof.into();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);

        let e: io::Error = Error::dial("UDP not enabled").into();
        assert_eq!(e.kind(), io::ErrorKind::Other);
        assert!(e.to_string().contains("UDP not enabled"));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::Auth { status: 404 }.to_string(),
            "authentication error, HTTP status code: 404"
        );
        assert_eq!(
            Error::Config {
                field: "server_addr",
                reason: "must be set"
            }
            .to_string(),
            "invalid config: server_addr: must be set"
        );
    }
}
