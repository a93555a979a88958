//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 通道对外只通过 Promise 结果与 Pipeline 错误事件暴露失败，本模块集中定义这些失败的取值；
//! - 可恢复的 I/O 级错误以值的形式流动，契约违背（跨线程改状态、重复初始化）则是断言，不在此枚举中。
//!
//! ## 设计要求（What）
//! - 每个变体携带稳定错误码（`spark.channel.*`），与传输实现 crate 的错误码方案保持一致；
//! - `ChannelError` 必须是 `Clone`，因为同一个关闭结果会同时派发给关闭 Promise 与多个等待者。

use std::io;

use thiserror::Error;

/// 通道层统一错误类型。
///
/// # 教案式说明
/// - **意图 (Why)**：把“通道已关闭”这一典型的“来得太晚”错误与方向性关闭、传输 I/O 失败区分开，
///   调用方据此决定是重试、降级还是直接放弃。
/// - **契约 (What)**：
///   - `Closed` 在 Pipeline 已被回收或通道正在关闭时返回，绝不以 panic 形式出现；
///   - `Io` 保存 `io::ErrorKind` 与文案而非 `io::Error` 本体，以便 `Clone`；
///   - `code()` 返回的字符串在版本间保持稳定，可直接作为指标标签。
/// - **设计权衡 (Trade-offs)**：`Handshake` 与 `Io` 携带 `String`，牺牲少量分配换取可读的上下文。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// 通道已完成关闭或 Pipeline 已被回收。
    #[error("channel closed")]
    Closed,

    /// 读方向已经关闭或正在关闭。
    #[error("channel read side shut down")]
    ReadShutdown,

    /// 写方向已经关闭或正在关闭。
    #[error("channel write side shut down")]
    WriteShutdown,

    /// 传输实现不支持该操作（例如面向流的传输调用 `write_to`）。
    #[error("operation `{0}` is not supported by this transport")]
    Unsupported(&'static str),

    /// 缓冲区大小超出允许区间。
    #[error("buffer size {requested} out of range [{min}, {max}]")]
    InvalidBufferSize { requested: u32, min: u32, max: u32 },

    /// 事件循环已终止，任务无法再被调度。
    #[error("event loop terminated")]
    LoopTerminated,

    /// 建连或协议握手阶段失败。
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// 底层传输 I/O 失败。
    #[error("{op} failed: {message}")]
    Io {
        op: &'static str,
        kind: io::ErrorKind,
        message: String,
    },
}

impl ChannelError {
    /// 将 `io::Error` 包装为带操作名的通道错误。
    pub fn io(op: &'static str, error: io::Error) -> Self {
        ChannelError::Io {
            op,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ChannelError::Closed => "spark.channel.closed",
            ChannelError::ReadShutdown => "spark.channel.read_shutdown",
            ChannelError::WriteShutdown => "spark.channel.write_shutdown",
            ChannelError::Unsupported(_) => "spark.channel.unsupported",
            ChannelError::InvalidBufferSize { .. } => "spark.channel.invalid_buffer_size",
            ChannelError::LoopTerminated => "spark.channel.loop_terminated",
            ChannelError::Handshake(_) => "spark.channel.handshake_failed",
            ChannelError::Io { .. } => "spark.channel.io_failed",
        }
    }

    /// 是否属于“通道已不可用”一类错误。
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::Closed | ChannelError::LoopTerminated)
    }
}

impl From<io::Error> for ChannelError {
    fn from(error: io::Error) -> Self {
        ChannelError::io("io", error)
    }
}

/// 通道层 `Result` 别名。
pub type Result<T, E = ChannelError> = core::result::Result<T, E>;
