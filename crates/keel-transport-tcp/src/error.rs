//! TCP 传输层的错误映射。
//!
//! # 契约说明（What）
//! - 所有 IO 失败先落入 [`TcpError`] 归类操作语境，再映射为带稳定错误码的
//!   [`CoreError`]，底层 `io::Error` 保留在根因链路上。

use std::io;

use keel_core::error::{CoreError, codes};
use thiserror::Error;

/// 操作语境标签，随错误进入日志与根因链路。
pub(crate) const BIND: &str = "bind";
pub(crate) const LISTEN: &str = "listen";
pub(crate) const ACCEPT: &str = "accept";
pub(crate) const READ: &str = "read";
pub(crate) const WRITE: &str = "write";
pub(crate) const CONFIGURE: &str = "configure";
pub(crate) const SELECT: &str = "select";
pub(crate) const REGISTER: &str = "register";

/// TCP 实现内部的错误形态。
#[derive(Debug, Error)]
pub(crate) enum TcpError {
    #[error("tcp {op} failed")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("operation `{op}` is not supported by this channel")]
    Unsupported { op: &'static str },
}

/// 把 IO 错误映射为核心错误域。
pub(crate) fn map_io_error(op: &'static str, source: io::Error) -> CoreError {
    CoreError::new(codes::TRANSPORT_IO, format!("tcp {op} failed"))
        .with_cause(TcpError::Io { op, source })
}

/// 该通道形态不支持请求的操作（如对监听通道执行 write）。
pub(crate) fn unsupported(op: &'static str) -> CoreError {
    CoreError::new(
        codes::TRANSPORT_UNSUPPORTED,
        format!("operation `{op}` not supported"),
    )
    .with_cause(TcpError::Unsupported { op })
}
