//! 通道的声明式配置。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 缓冲区大小、`TCP_NODELAY`、带宽上限等参数通常来自配置文件，
//!   本模块把它们收拢为可序列化的 [`ChannelConfig`]，由 [`Channel::apply_config`](crate::Channel::apply_config)
//!   一次性下发到循环线程。
//!
//! ## 契约（What）
//! - 缺省字段保持传输的默认值不变；
//! - 解析阶段即完成缓冲区区间校验，非法配置不会到达传输实现。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ChannelError;

/// 缓冲区大小的合法区间（闭区间）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRange {
    pub min: u32,
    pub max: u32,
}

impl BufferRange {
    /// 接收与发送缓冲区共用的区间：8 KiB 至 8 MiB。
    pub const DEFAULT: BufferRange = BufferRange {
        min: 8 * 1024,
        max: 8 * 1024 * 1024,
    };

    /// 校验并原样返回 `size`。
    pub fn check(&self, size: u32) -> Result<u32, ChannelError> {
        if (self.min..=self.max).contains(&size) {
            Ok(size)
        } else {
            Err(ChannelError::InvalidBufferSize {
                requested: size,
                min: self.min,
                max: self.max,
            })
        }
    }
}

/// 配置解析失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid channel config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid `{field}`: {source}")]
    Invalid {
        field: &'static str,
        #[source]
        source: ChannelError,
    },
}

/// 通道参数。
///
/// ```toml
/// read_buffer_size = 65536
/// nodelay = true
/// bandwidth_limit = 1048576
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    pub read_buffer_size: Option<u32>,
    pub write_buffer_size: Option<u32>,
    pub nodelay: bool,
    /// 每秒字节数，`0` 表示解除限速。
    pub bandwidth_limit: Option<u32>,
}

impl ChannelConfig {
    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: ChannelConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验缓冲区区间。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("read_buffer_size", self.read_buffer_size),
            ("write_buffer_size", self.write_buffer_size),
        ];
        for (field, size) in fields {
            if let Some(size) = size {
                BufferRange::DEFAULT
                    .check(size)
                    .map_err(|source| ConfigError::Invalid { field, source })?;
            }
        }
        Ok(())
    }
}
