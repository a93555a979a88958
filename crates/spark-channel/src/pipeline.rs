//! 通道 Handler 链。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 借鉴 Netty `ChannelPipeline`：入站事件自头向尾流经 Handler，出站操作自尾向头回流，
//!   越过头部后才真正抵达通道的关闭/写入时序逻辑，Handler 因而可以观察、改写或拦截两个方向的流量。
//! - Handler 列表以 [`ArcSwap`] 快照保存，派发时只克隆一次 `Arc`，不在回调期间持有任何锁，
//!   Handler 在回调中再次发起出站操作也不会自锁。
//!
//! ## 契约（What）
//! - 所有 `fire_*` 与出站入口都要求 [`InLoop`] 令牌，即只能在通道所属循环上调用；
//! - Pipeline 通过弱引用回指通道，通道已释放时出站操作以 [`ChannelError::Closed`] 兑现 Promise；
//! - `deinit` 之后 Handler 列表被清空，Handler 对通道的任何引用随之释放。
//!
//! ## 风险（Trade-offs）
//! - `add_first`/`add_last` 以复制整张列表的方式更新快照，适合“初始化时装配、运行期偶尔调整”的节奏。

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use arc_swap::ArcSwap;
use bytes::Bytes;
use tracing::trace;

use crate::{error::ChannelError, event_loop::InLoop, promise::OpPromise};

type HandlerList = Vec<Arc<dyn ChannelHandler>>;

/// 通道 Handler 契约。
///
/// # 教案式说明
/// - **意图 (Why)**：协议编解码、应用逻辑都以 Handler 形式挂在 Pipeline 上，
///   所有回调默认“原样转发”，实现者只需覆写关心的事件。
/// - **契约 (What)**：
///   - 回调均在通道所属循环线程上执行，不得阻塞；
///   - 入站回调通过 `ctx.fire_*` 继续向尾部传播，不调用即视为吞掉该事件；
///   - 出站回调通过 `ctx.write` 等继续向头部传播，吞掉出站操作时必须自行兑现 Promise。
/// - **风险 (Trade-offs)**：Handler 若需持有通道引用，应使用 `Weak`，否则会与通道形成引用环，
///   直至 `deinit` 才被打破。
pub trait ChannelHandler: Send + Sync + 'static {
    /// 用于日志的 Handler 名称。
    fn name(&self) -> &str {
        "handler"
    }

    /// Pipeline 初始化时调用（仅对初始化时已安装的 Handler）。
    fn added(&self, ctx: &HandlerContext<'_>) {
        let _ = ctx;
    }

    /// Pipeline 回收时调用。
    fn removed(&self, ctx: &HandlerContext<'_>) {
        let _ = ctx;
    }

    fn connected(&self, ctx: &HandlerContext<'_>) {
        ctx.fire_connected();
    }

    fn read(&self, ctx: &HandlerContext<'_>, data: Bytes) {
        ctx.fire_read(data);
    }

    fn readfrom(&self, ctx: &HandlerContext<'_>, data: Bytes, from: SocketAddr) {
        ctx.fire_readfrom(data, from);
    }

    fn read_closed(&self, ctx: &HandlerContext<'_>) {
        ctx.fire_read_closed();
    }

    fn write_closed(&self, ctx: &HandlerContext<'_>) {
        ctx.fire_write_closed();
    }

    fn closed(&self, ctx: &HandlerContext<'_>) {
        ctx.fire_closed();
    }

    /// 建连/握手阶段的错误事件。
    fn error(&self, ctx: &HandlerContext<'_>, error: ChannelError) {
        ctx.fire_error(error);
    }

    fn write(&self, ctx: &HandlerContext<'_>, data: Bytes, promise: OpPromise) {
        ctx.write(data, promise);
    }

    fn write_to(&self, ctx: &HandlerContext<'_>, data: Bytes, to: SocketAddr, promise: OpPromise) {
        ctx.write_to(data, to, promise);
    }

    fn close(&self, ctx: &HandlerContext<'_>, promise: OpPromise) {
        ctx.close(promise);
    }

    fn close_read(&self, ctx: &HandlerContext<'_>, promise: OpPromise) {
        ctx.close_read(promise);
    }

    fn close_write(&self, ctx: &HandlerContext<'_>, promise: OpPromise) {
        ctx.close_write(promise);
    }
}

/// Pipeline 头部之后的出站终点，由通道实现。
pub(crate) trait PipelineSink: Send + Sync {
    fn sink_write(&self, token: &InLoop<'_>, data: Bytes, promise: OpPromise);
    fn sink_write_to(&self, token: &InLoop<'_>, data: Bytes, to: SocketAddr, promise: OpPromise);
    fn sink_close(&self, token: &InLoop<'_>, promise: OpPromise);
    fn sink_close_read(&self, token: &InLoop<'_>, promise: OpPromise);
    fn sink_close_write(&self, token: &InLoop<'_>, promise: OpPromise);
    fn describe(&self) -> String;
}

/// 通道独占的 Handler 链。
pub struct ChannelPipeline {
    handlers: ArcSwap<HandlerList>,
    sink: Weak<dyn PipelineSink>,
    live: AtomicBool,
}

impl ChannelPipeline {
    pub(crate) fn new(sink: Weak<dyn PipelineSink>) -> Self {
        Self {
            handlers: ArcSwap::from_pointee(Vec::new()),
            sink,
            live: AtomicBool::new(false),
        }
    }

    /// 在链尾追加 Handler。
    pub fn add_last(&self, handler: Arc<dyn ChannelHandler>) {
        self.handlers.rcu(|current| {
            let mut next = HandlerList::clone(current);
            next.push(Arc::clone(&handler));
            next
        });
    }

    /// 在链首插入 Handler。
    pub fn add_first(&self, handler: Arc<dyn ChannelHandler>) {
        self.handlers.rcu(|current| {
            let mut next = HandlerList::with_capacity(current.len() + 1);
            next.push(Arc::clone(&handler));
            next.extend(current.iter().cloned());
            next
        });
    }

    /// 当前 Handler 数量。
    pub fn len(&self) -> usize {
        self.handlers.load().len()
    }

    /// 是否没有任何 Handler。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handler 名称列表，自头向尾。
    pub fn names(&self) -> Vec<String> {
        self.handlers
            .load()
            .iter()
            .map(|handler| handler.name().to_owned())
            .collect()
    }

    /// 是否处于 `init` 与 `deinit` 之间。
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn init(&self, token: &InLoop<'_>) {
        self.live.store(true, Ordering::Release);
        let handlers = self.handlers.load_full();
        for index in 0..handlers.len() {
            let ctx = HandlerContext::new(self, &handlers, index, *token);
            handlers[index].added(&ctx);
        }
    }

    pub(crate) fn deinit(&self, token: &InLoop<'_>) {
        self.live.store(false, Ordering::Release);
        let handlers = self.handlers.swap(Arc::new(Vec::new()));
        for index in 0..handlers.len() {
            let ctx = HandlerContext::new(self, &handlers, index, *token);
            handlers[index].removed(&ctx);
        }
    }

    fn inbound<F>(&self, token: &InLoop<'_>, event: &'static str, dispatch: F)
    where
        F: FnOnce(&dyn ChannelHandler, &HandlerContext<'_>),
    {
        let handlers = self.handlers.load_full();
        match handlers.first() {
            Some(head) => {
                let ctx = HandlerContext::new(self, &handlers, 0, *token);
                dispatch(head.as_ref(), &ctx);
            }
            None => trace!(event, "inbound event reached empty pipeline"),
        }
    }

    fn outbound<F, S>(&self, token: &InLoop<'_>, dispatch: F, sink: S)
    where
        F: FnOnce(&dyn ChannelHandler, &HandlerContext<'_>),
        S: FnOnce(&ChannelPipeline, &InLoop<'_>),
    {
        let handlers = self.handlers.load_full();
        match handlers.len().checked_sub(1) {
            Some(last) => {
                let ctx = HandlerContext::new(self, &handlers, last, *token);
                dispatch(handlers[last].as_ref(), &ctx);
            }
            None => sink(self, token),
        }
    }

    pub(crate) fn fire_connected(&self, token: &InLoop<'_>) {
        self.inbound(token, "connected", |handler, ctx| handler.connected(ctx));
    }

    pub(crate) fn fire_read(&self, token: &InLoop<'_>, data: Bytes) {
        self.inbound(token, "read", move |handler, ctx| handler.read(ctx, data));
    }

    pub(crate) fn fire_readfrom(&self, token: &InLoop<'_>, data: Bytes, from: SocketAddr) {
        self.inbound(token, "readfrom", move |handler, ctx| {
            handler.readfrom(ctx, data, from)
        });
    }

    pub(crate) fn fire_read_closed(&self, token: &InLoop<'_>) {
        self.inbound(token, "read_closed", |handler, ctx| handler.read_closed(ctx));
    }

    pub(crate) fn fire_write_closed(&self, token: &InLoop<'_>) {
        self.inbound(token, "write_closed", |handler, ctx| {
            handler.write_closed(ctx)
        });
    }

    pub(crate) fn fire_closed(&self, token: &InLoop<'_>) {
        self.inbound(token, "closed", |handler, ctx| handler.closed(ctx));
    }

    pub(crate) fn fire_error(&self, token: &InLoop<'_>, error: ChannelError) {
        self.inbound(token, "error", move |handler, ctx| handler.error(ctx, error));
    }

    /// 出站写，自链尾进入。
    pub fn write(&self, token: &InLoop<'_>, data: Bytes, promise: OpPromise) {
        let promise_for_sink = promise.clone();
        let data_for_sink = data.clone();
        self.outbound(
            token,
            move |handler, ctx| handler.write(ctx, data, promise),
            move |pipeline, token| pipeline.sink_write(token, data_for_sink, promise_for_sink),
        );
    }

    /// 出站定向写，自链尾进入。
    pub fn write_to(&self, token: &InLoop<'_>, data: Bytes, to: SocketAddr, promise: OpPromise) {
        let promise_for_sink = promise.clone();
        let data_for_sink = data.clone();
        self.outbound(
            token,
            move |handler, ctx| handler.write_to(ctx, data, to, promise),
            move |pipeline, token| {
                pipeline.sink_write_to(token, data_for_sink, to, promise_for_sink)
            },
        );
    }

    /// 出站整体关闭，自链尾进入。
    pub fn close(&self, token: &InLoop<'_>, promise: OpPromise) {
        let promise_for_sink = promise.clone();
        self.outbound(
            token,
            move |handler, ctx| handler.close(ctx, promise),
            move |pipeline, token| pipeline.sink_close(token, promise_for_sink),
        );
    }

    /// 出站读半关闭，自链尾进入。
    pub fn close_read(&self, token: &InLoop<'_>, promise: OpPromise) {
        let promise_for_sink = promise.clone();
        self.outbound(
            token,
            move |handler, ctx| handler.close_read(ctx, promise),
            move |pipeline, token| pipeline.sink_close_read(token, promise_for_sink),
        );
    }

    /// 出站写半关闭，自链尾进入。
    pub fn close_write(&self, token: &InLoop<'_>, promise: OpPromise) {
        let promise_for_sink = promise.clone();
        self.outbound(
            token,
            move |handler, ctx| handler.close_write(ctx, promise),
            move |pipeline, token| pipeline.sink_close_write(token, promise_for_sink),
        );
    }

    fn with_sink<F>(&self, promise: &OpPromise, op: &'static str, f: F)
    where
        F: FnOnce(&dyn PipelineSink),
    {
        match self.sink.upgrade() {
            Some(sink) => f(sink.as_ref()),
            None => {
                trace!(op, "outbound operation reached a released channel");
                promise.set(Err(ChannelError::Closed));
            }
        }
    }

    fn sink_write(&self, token: &InLoop<'_>, data: Bytes, promise: OpPromise) {
        self.with_sink(&promise.clone(), "write", |sink| {
            sink.sink_write(token, data, promise)
        });
    }

    fn sink_write_to(&self, token: &InLoop<'_>, data: Bytes, to: SocketAddr, promise: OpPromise) {
        self.with_sink(&promise.clone(), "write_to", |sink| {
            sink.sink_write_to(token, data, to, promise)
        });
    }

    fn sink_close(&self, token: &InLoop<'_>, promise: OpPromise) {
        self.with_sink(&promise.clone(), "close", |sink| {
            sink.sink_close(token, promise)
        });
    }

    fn sink_close_read(&self, token: &InLoop<'_>, promise: OpPromise) {
        self.with_sink(&promise.clone(), "close_read", |sink| {
            sink.sink_close_read(token, promise)
        });
    }

    fn sink_close_write(&self, token: &InLoop<'_>, promise: OpPromise) {
        self.with_sink(&promise.clone(), "close_write", |sink| {
            sink.sink_close_write(token, promise)
        });
    }

    fn describe(&self) -> Option<String> {
        self.sink.upgrade().map(|sink| sink.describe())
    }
}

impl fmt::Debug for ChannelPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPipeline")
            .field("handlers", &self.names())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Handler 回调时的链路位置与传播入口。
pub struct HandlerContext<'a> {
    pipeline: &'a ChannelPipeline,
    handlers: &'a [Arc<dyn ChannelHandler>],
    index: usize,
    token: InLoop<'a>,
}

impl<'a> HandlerContext<'a> {
    fn new(
        pipeline: &'a ChannelPipeline,
        handlers: &'a [Arc<dyn ChannelHandler>],
        index: usize,
        token: InLoop<'a>,
    ) -> Self {
        Self {
            pipeline,
            handlers,
            index,
            token,
        }
    }

    fn at(&self, index: usize) -> HandlerContext<'a> {
        HandlerContext::new(self.pipeline, self.handlers, index, self.token)
    }

    fn next_inbound<F>(&self, event: &'static str, dispatch: F)
    where
        F: FnOnce(&dyn ChannelHandler, &HandlerContext<'_>),
    {
        let next = self.index + 1;
        match self.handlers.get(next) {
            Some(handler) => dispatch(handler.as_ref(), &self.at(next)),
            None => trace!(event, "inbound event reached pipeline tail"),
        }
    }

    /// 出站方向的下一个 Handler；`None` 表示已越过头部。
    fn next_outbound(&self) -> Option<(&'a Arc<dyn ChannelHandler>, HandlerContext<'a>)> {
        let previous = self.index.checked_sub(1)?;
        Some((&self.handlers[previous], self.at(previous)))
    }

    /// 当前循环令牌。
    pub fn token(&self) -> &InLoop<'a> {
        &self.token
    }

    /// 当前 Handler 名称。
    pub fn name(&self) -> &str {
        self.handlers[self.index].name()
    }

    /// 通道描述；通道已释放时为 `None`。
    pub fn channel_info(&self) -> Option<String> {
        self.pipeline.describe()
    }

    pub fn fire_connected(&self) {
        self.next_inbound("connected", |handler, ctx| handler.connected(ctx));
    }

    pub fn fire_read(&self, data: Bytes) {
        self.next_inbound("read", move |handler, ctx| handler.read(ctx, data));
    }

    pub fn fire_readfrom(&self, data: Bytes, from: SocketAddr) {
        self.next_inbound("readfrom", move |handler, ctx| {
            handler.readfrom(ctx, data, from)
        });
    }

    pub fn fire_read_closed(&self) {
        self.next_inbound("read_closed", |handler, ctx| handler.read_closed(ctx));
    }

    pub fn fire_write_closed(&self) {
        self.next_inbound("write_closed", |handler, ctx| handler.write_closed(ctx));
    }

    pub fn fire_closed(&self) {
        self.next_inbound("closed", |handler, ctx| handler.closed(ctx));
    }

    pub fn fire_error(&self, error: ChannelError) {
        self.next_inbound("error", move |handler, ctx| handler.error(ctx, error));
    }

    pub fn write(&self, data: Bytes, promise: OpPromise) {
        match self.next_outbound() {
            Some((handler, ctx)) => handler.write(&ctx, data, promise),
            None => self.pipeline.sink_write(&self.token, data, promise),
        }
    }

    pub fn write_to(&self, data: Bytes, to: SocketAddr, promise: OpPromise) {
        match self.next_outbound() {
            Some((handler, ctx)) => handler.write_to(&ctx, data, to, promise),
            None => self.pipeline.sink_write_to(&self.token, data, to, promise),
        }
    }

    pub fn close(&self, promise: OpPromise) {
        match self.next_outbound() {
            Some((handler, ctx)) => handler.close(&ctx, promise),
            None => self.pipeline.sink_close(&self.token, promise),
        }
    }

    pub fn close_read(&self, promise: OpPromise) {
        match self.next_outbound() {
            Some((handler, ctx)) => handler.close_read(&ctx, promise),
            None => self.pipeline.sink_close_read(&self.token, promise),
        }
    }

    pub fn close_write(&self, promise: OpPromise) {
        match self.next_outbound() {
            Some((handler, ctx)) => handler.close_write(&ctx, promise),
            None => self.pipeline.sink_close_write(&self.token, promise),
        }
    }
}
