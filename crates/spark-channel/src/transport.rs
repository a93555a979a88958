//! 传输实现需要提供的能力集合。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 通道核心只负责线程归属、状态机与事件派发，真正的套接字操作（TCP、UDP、内存管道等）
//!   由实现 [`Transport`] 的类型提供；通道对具体 I/O 后端不做任何假设。
//!
//! ## 契约（What）
//! - 所有方法都在通道所属循环线程上被调用，并通过 [`ChannelCtx`] 拿到通道与循环令牌；
//! - 接收 Promise 的方法必须**最终**兑现该 Promise，可同步兑现，也可稍后在任意线程兑现，
//!   通道会把完成结果重新投递回循环线程处理；
//! - `aio_*` 回调必须在循环线程上调用。
//!
//! ## 风险（Trade-offs）
//! - 方法以 `&self` 接收，传输实现需自行使用内部可变性；由于调用被限定在单一线程，
//!   内部锁不会出现竞争。

use std::net::SocketAddr;

use bytes::Bytes;

use crate::{
    channel::{AioCallback, ChannelCtx, ChannelId},
    error::ChannelError,
    promise::{OpPromise, SizePromise},
};

/// 具体传输实现的能力集合。
///
/// # 教案式说明
/// - **意图 (Why)**：以 trait 代替继承层次，通道对传输类型泛型化，静态分发且无虚表开销。
/// - **契约 (What)**：
///   - `*_impl` 方法只在通道状态机放行后才会被调用（例如写方向未关闭、关闭流程未重复发起）；
///   - `close_impl` 完成后通道负责补发方向事件与 `closed` 事件，传输实现无需自行派发；
///   - 缓冲区大小在到达传输前已按 [`BufferRange`](crate::config::BufferRange) 校验。
/// - **风险 (Trade-offs)**：`write_to_impl` 默认返回 `Unsupported`，面向流的传输无需实现。
pub trait Transport: Send + Sync + Sized + 'static {
    /// 传输标识，通常为底层句柄号。
    fn id(&self) -> ChannelId;

    /// 诊断描述，例如本端与对端地址。
    fn info(&self) -> String;

    fn set_read_buffer_size(&self, ctx: &ChannelCtx<'_, Self>, size: u32, promise: SizePromise);

    fn get_read_buffer_size(&self, ctx: &ChannelCtx<'_, Self>, promise: SizePromise);

    fn set_write_buffer_size(&self, ctx: &ChannelCtx<'_, Self>, size: u32, promise: SizePromise);

    fn get_write_buffer_size(&self, ctx: &ChannelCtx<'_, Self>, promise: SizePromise);

    fn set_nodelay(&self, ctx: &ChannelCtx<'_, Self>, nodelay: bool, promise: OpPromise);

    /// 带宽上限，`0` 表示不限速。默认不做任何处理。
    fn set_bandwidth_limit(&self, ctx: &ChannelCtx<'_, Self>, limit: u32) {
        let _ = (ctx, limit);
    }

    /// 发送一段字节。
    fn write_impl(&self, ctx: &ChannelCtx<'_, Self>, data: Bytes, promise: OpPromise);

    /// 向指定地址发送一个数据报。
    fn write_to_impl(
        &self,
        ctx: &ChannelCtx<'_, Self>,
        data: Bytes,
        to: SocketAddr,
        promise: OpPromise,
    ) {
        let _ = (ctx, data, to);
        promise.set(Err(ChannelError::Unsupported("write_to")));
    }

    fn close_read_impl(&self, ctx: &ChannelCtx<'_, Self>, promise: OpPromise);

    fn close_write_impl(&self, ctx: &ChannelCtx<'_, Self>, promise: OpPromise);

    /// 关闭整个传输，Promise 的取值即关闭码。
    fn close_impl(&self, ctx: &ChannelCtx<'_, Self>, promise: OpPromise);

    /// 开始监听可读事件。
    fn aio_read(&self, ctx: &ChannelCtx<'_, Self>, callback: AioCallback);

    fn aio_end_read(&self, ctx: &ChannelCtx<'_, Self>);

    /// 开始监听可写事件。
    fn aio_write(&self, ctx: &ChannelCtx<'_, Self>, callback: AioCallback);

    fn aio_end_write(&self, ctx: &ChannelCtx<'_, Self>);

    /// 开始监听建连完成事件。
    fn aio_connect(&self, ctx: &ChannelCtx<'_, Self>, callback: AioCallback);

    fn aio_end_connect(&self, ctx: &ChannelCtx<'_, Self>);
}
