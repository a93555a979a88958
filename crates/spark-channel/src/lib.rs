#![doc = r#"
# spark-channel

## 设计动机（Why）
- **定位**：Spark 的异步网络通道核心。一个通道代表 TCP 连接、UDP 套接字或监听套接字的一端，
  其 I/O 操作被派发到唯一归属的事件循环线程，生命周期由显式状态机追踪，
  完成通知则同时流经有序的 Handler 链与返回给任意线程调用方的 Promise。
- **架构角色**：位于具体传输实现（实现 [`Transport`]）与协议/应用 Handler（实现
  [`ChannelHandler`]）之间，事件循环由外部提供（实现 [`EventLoop`]，生产实现见
  `spark-channel-tokio`）。

## 核心契约（What）
- **线程归属**：所有状态修改与事件派发只发生在通道所属循环上；修改方法要求出示
  [`InLoop`] 令牌，跨线程误用在类型层面即被拒绝；
- **恰好一次**：每个被接受的操作恰好兑现一次 Promise；`connected`、`read_closed`、
  `write_closed`、`closed` 每轮生命周期至多派发一次；
- **关闭汇合**：读、写两个方向都完成半关闭后自动发起整体关闭，关闭 Promise 兑现即回收 Pipeline；
- **迟到保护**：Pipeline 回收后的任何操作以 [`ChannelError::Closed`] 兑现，绝不 panic。

## 实现策略（How）
- 状态按轴拆分（见 [`flags`]），每次转换后执行跨轴不变量检查；
- 公共操作经由一个泛型派发例程“立即返回 Promise + 投递任务”，
  任务在循环上检查 Pipeline 后交给 Handler 链，最终抵达传输实现；
- Handler 链以原子快照保存，派发期间不持锁。

## 风险与考量（Trade-offs）
- 契约违背（循环外修改、使用其他循环的令牌、重复初始化）一律 `assert!`，不作为错误值返回；
- `test_stubs` 随 crate 公开，供下游传输实现复用同一组确定性测试协作者。
"#]

pub mod channel;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod flags;
pub mod pipeline;
pub mod promise;
pub mod test_stubs;
pub mod transport;

pub use channel::{AioCallback, Channel, ChannelCtx, ChannelId, ChannelInitializer, DialPromise};
pub use config::{BufferRange, ChannelConfig, ConfigError};
pub use error::{ChannelError, Result};
pub use event_loop::{EventLoop, InLoop, Job, RejectedJob};
pub use flags::{
    ChannelSnapshot, ClosePhase, ConnectPhase, Direction, FiredEvents, LoopFlags, RateFlags,
    ReadFlags, Role, WriteFlags,
};
pub use pipeline::{ChannelHandler, ChannelPipeline, HandlerContext};
pub use promise::{OpPromise, OpResult, Promise, SizePromise};
pub use transport::Transport;
