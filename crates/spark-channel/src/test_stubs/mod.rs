//! 通道契约测试使用的确定性协作者。
//!
//! # 设计定位（Why）
//! - 通道的正确性取决于“何时在循环上执行什么”，真实的多线程循环会让断言依赖时序；
//!   这里提供由测试线程手动驱动的循环、可编排完成时机的传输以及记录全部入站事件的 Handler。
//! - 集中出口让 crate 内单元测试、`tests/` 契约测试与下游传输实现的测试共用同一组桩对象。
//!
//! # 使用方式（How）
//! - `ManualEventLoop::new(name)` 的归属线程即构造线程，测试在该线程上调用 `run_until_idle` 推进；
//! - `ScriptedTransport` 默认立即成功，`defer` 后改为手动 `complete_next`，`fail_next` 注入失败；
//! - `RecordingHandler` 挂到 Pipeline 上即可按顺序拿到事件列表。
//!
//! # 风险与权衡（Trade-offs）
//! - 桩对象随 crate 对外公开，属于稳定测试 API；生产代码不应依赖。

mod handler;
mod manual_loop;
mod scripted;

pub use handler::{ChannelEvent, RecordingHandler};
pub use manual_loop::ManualEventLoop;
pub use scripted::{ScriptedTransport, TransportOp};
