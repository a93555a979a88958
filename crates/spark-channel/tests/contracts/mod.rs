//! 通道契约测试集合。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：以确定性循环（`ManualEventLoop`）与可编排传输（`ScriptedTransport`）驱动真实的
//!   `Channel`，逐条验证生命周期、关闭汇合、跨线程派发与 Pipeline 顺序等对外承诺。
//! - **结构 (How)**：
//!   - `support`：测试夹具，负责创建循环、通道并挂上 `RecordingHandler`；
//!   - `lifecycle`：初始化、回收、再初始化与迟到操作；
//!   - `close_sequencing`：半关闭汇合、并发关闭、延迟关闭与写错误场景；
//!   - `dispatch`：有界轮次内兑现、数据报通道、缓冲区与配置、`aio_*` 开关；
//!   - `pipeline_order`：入站/出站方向与 Handler 拦截；
//!   - `logging`：生命周期日志。
//! - **前置条件 (What)**：所有测试在构造循环的线程上推进循环，跨线程场景只在子线程提交操作。

mod close_sequencing;
mod lifecycle;
mod logging;
mod pipeline_order;
