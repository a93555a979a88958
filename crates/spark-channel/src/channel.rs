//! 通道核心：生命周期、跨线程派发与关闭时序。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 通道是三类约束的交汇点：线程归属（一切修改都在所属循环上发生）、多轴状态机
//!   （读/写半关闭、建连、关闭阶段）、以及生命周期事件“恰好一次”地流经 Pipeline。
//! - 调用方可能来自任意线程，因此每个公共操作都“立即返回 Promise + 投递任务到循环”，
//!   真正的状态修改在循环线程上凭 [`InLoop`] 令牌完成。
//!
//! ## 契约（What）
//! - 每个被接受的操作恰好兑现一次：要么得到真实结果，要么在 Pipeline 已回收时得到
//!   [`ChannelError::Closed`]，循环已终止时得到 [`ChannelError::LoopTerminated`]；
//! - `connected`、`read_closed`、`write_closed`、`closed` 每轮生命周期至多派发一次；
//! - 读、写两个方向都完成半关闭后，若通道尚未进入关闭流程，自动发起整体关闭；
//! - 关闭 Promise 兑现即触发 Pipeline 回收，此后通道可以再次 `init` 进入新一轮生命周期。
//!
//! ## 逻辑（How）
//! - 出站路径：公共方法 → `dispatch` 投递 → 循环线程检查 Pipeline → Pipeline 自尾向头 →
//!   `PipelineSink` → 本模块的时序逻辑 → [`Transport`] 的 `*_impl`；
//! - 传输实现以“内部 Promise”汇报完成，完成回调通过 [`Channel::run_in_loop`] 回到循环线程，
//!   再推进状态、派发事件并兑现调用方的 Promise；
//! - 传输完成回调携带发起时的生命周期序号，迟到的完成只兑现当初的 Promise，不改动新一轮的状态。
//!
//! ## 风险（Trade-offs）
//! - 循环终止后关闭 Promise 可能在其他线程兑现，此时 Pipeline 被直接摘下，Handler 收不到 `removed`；
//! - 状态放在 `parking_lot::Mutex` 中，仅为让其他线程读取快照；写入方只有循环线程，锁不会竞争。
//!   任何回调、Pipeline 派发、Promise 兑现都在锁外执行，避免重入死锁。

use std::{
    any::Any,
    fmt, mem,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    config::{BufferRange, ChannelConfig},
    error::ChannelError,
    event_loop::{EventLoop, InLoop, Job},
    flags::{
        ChannelSnapshot, ChannelState, ClosePhase, ConnectPhase, Direction, FiredEvents,
        LoopFlags, RateFlags, ReadFlags, Role, WriteFlags,
    },
    pipeline::{ChannelPipeline, PipelineSink},
    promise::{OpPromise, OpResult, Promise, SizePromise},
    transport::Transport,
};

/// 通道标识。
pub type ChannelId = u64;

/// `aio_*` 就绪回调，在循环线程上调用。
pub type AioCallback = Box<dyn FnMut(OpResult) + Send + 'static>;

/// 安装 Handler 的初始化器。
pub type ChannelInitializer = Box<dyn FnOnce(&ChannelPipeline) + Send + 'static>;

/// 建连/监听流程交付通道的 Promise。
pub type DialPromise<T> = Promise<Result<Arc<Channel<T>>, ChannelError>>;

type Context = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct Core {
    state: ChannelState,
    incarnation: u64,
    last_error: Option<ChannelError>,
    write_error: Option<ChannelError>,
    close_promise: Option<OpPromise>,
    read_waiters: Vec<OpPromise>,
    write_waiters: Vec<OpPromise>,
}

impl Core {
    fn waiters(&mut self, direction: Direction) -> &mut Vec<OpPromise> {
        match direction {
            Direction::Read => &mut self.read_waiters,
            Direction::Write => &mut self.write_waiters,
        }
    }

    fn record_error(&mut self, direction: Direction, error: &ChannelError) {
        match direction {
            Direction::Read => self.state.axes.read.insert(ReadFlags::ERROR),
            Direction::Write => {
                self.state.axes.write.insert(WriteFlags::ERROR);
                self.write_error = Some(error.clone());
            }
        }
        self.last_error = Some(error.clone());
    }
}

/// 半关闭请求在当前状态下的处理方式。
enum HalfClose {
    Resolve(OpResult),
    AttachToClose(OpPromise),
    Wait,
    Start,
}

/// 整体关闭请求在当前状态下的处理方式。
enum FullClose {
    Resolve(OpResult),
    Attach(OpPromise),
    Start(OpPromise),
}

/// 异步网络通道。
///
/// # 教案式说明
/// - **意图 (Why)**：代表一个 TCP 连接、UDP 套接字或监听套接字的一端，
///   以 `Arc<Channel<T>>` 的形式被应用代码与循环内部簿记共同持有。
/// - **契约 (What)**：
///   - 通道独占其 Pipeline 与关闭 Promise，事件循环只被引用；
///   - Handler 只能以弱引用回指通道；
///   - `T` 为具体传输，见 [`Transport`]。
/// - **风险 (Trade-offs)**：跨线程的公共操作一律排队执行，哪怕调用方本就在循环线程上，
///   以保持同一提交方的先后顺序。
pub struct Channel<T: Transport> {
    event_loop: Arc<dyn EventLoop>,
    core: Mutex<Core>,
    pipeline: ArcSwapOption<ChannelPipeline>,
    ctx: Mutex<Option<Context>>,
    transport: T,
    self_ref: Weak<Channel<T>>,
}

impl<T: Transport> Channel<T> {
    /// 创建处于 `Closed` 阶段的通道，需要在循环线程上 [`init`](Self::init) 后才可使用。
    pub fn new(event_loop: Arc<dyn EventLoop>, transport: T) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Channel {
            event_loop,
            core: Mutex::new(Core::default()),
            pipeline: ArcSwapOption::empty(),
            ctx: Mutex::new(None),
            transport,
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.transport.id()
    }

    pub fn info(&self) -> String {
        self.transport.info()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn event_loop(&self) -> &Arc<dyn EventLoop> {
        &self.event_loop
    }

    /// 当前 Pipeline；已回收时为 `None`。
    pub fn pipeline(&self) -> Option<Arc<ChannelPipeline>> {
        self.pipeline.load_full()
    }

    /// 当前生命周期的关闭 Promise。
    pub fn close_promise(&self) -> Option<OpPromise> {
        self.core.lock().close_promise.clone()
    }

    /// 全部状态轴的快照。
    pub fn snapshot(&self) -> ChannelSnapshot {
        self.core.lock().state.axes
    }

    /// 最近一次记录的读/写错误。
    pub fn last_error(&self) -> Option<ChannelError> {
        self.core.lock().last_error.clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.snapshot().role, Role::Active)
    }

    pub fn is_passive(&self) -> bool {
        !self.is_active()
    }

    pub fn is_listener(&self) -> bool {
        matches!(self.snapshot().connect, ConnectPhase::Listening)
    }

    /// 挂接上层上下文，返回被替换的旧值。
    pub fn set_ctx(&self, ctx: Context) -> Option<Context> {
        self.ctx.lock().replace(ctx)
    }

    /// 以具体类型取回上下文；类型不符时返回 `None`。
    pub fn ctx<C>(&self) -> Option<Arc<C>>
    where
        C: Any + Send + Sync,
    {
        let ctx = self.ctx.lock().clone()?;
        ctx.downcast::<C>().ok()
    }

    /// 取走上下文。
    pub fn take_ctx(&self) -> Option<Context> {
        self.ctx.lock().take()
    }

    fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        f(&mut self.core.lock())
    }

    fn handle(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }
}

impl<T: Transport> Channel<T> {
    /// 在通道所属循环上执行 `job`；已身处循环时同步执行。
    ///
    /// 循环已终止时返回 [`ChannelError::LoopTerminated`]，`job` 被丢弃。
    pub fn run_in_loop<F>(self: &Arc<Self>, job: F) -> Result<(), ChannelError>
    where
        F: FnOnce(&Arc<Self>, &InLoop<'_>) + Send + 'static,
    {
        if let Some(token) = InLoop::enter(&*self.event_loop) {
            job(self, &token);
            return Ok(());
        }
        let channel = Arc::clone(self);
        let job: Job = Box::new(move || {
            let token = InLoop::assert(&*channel.event_loop);
            job(&channel, &token);
        });
        self.event_loop.execute(job).map_err(|_| {
            warn!(channel = self.id(), "event loop rejected job");
            ChannelError::LoopTerminated
        })
    }

    /// 投递一次出站操作：立即返回 Promise，循环线程上检查 Pipeline 后再交给 `op`。
    ///
    /// # 契约说明（What）
    /// - Pipeline 已回收：以 [`ChannelError::Closed`] 兑现，不再调用 `op`；
    /// - 循环拒绝任务：以 [`ChannelError::LoopTerminated`] 兑现；
    /// - 其余情况由 `op` 负责最终兑现。
    fn dispatch<R, F>(
        self: &Arc<Self>,
        op: &'static str,
        promise: Promise<Result<R, ChannelError>>,
        f: F,
    ) -> Promise<Result<R, ChannelError>>
    where
        R: Clone + Send + 'static,
        F: FnOnce(&Arc<Self>, &ChannelPipeline, &InLoop<'_>, Promise<Result<R, ChannelError>>)
            + Send
            + 'static,
    {
        let channel = Arc::clone(self);
        let pending = promise.clone();
        let job: Job = Box::new(move || {
            let token = InLoop::assert(&*channel.event_loop);
            match channel.pipeline.load_full() {
                Some(pipeline) => {
                    trace!(channel = channel.id(), op, "dispatch");
                    f(&channel, &*pipeline, &token, pending);
                }
                None => {
                    trace!(channel = channel.id(), op, "channel deinitialized");
                    pending.set(Err(ChannelError::Closed));
                }
            }
        });
        if self.event_loop.execute(job).is_err() {
            warn!(channel = self.id(), op, "event loop rejected job");
            promise.set(Err(ChannelError::LoopTerminated));
        }
        promise
    }

    /// 不返回 Promise 的开关类操作；Pipeline 已回收时静默忽略。
    fn dispatch_void<F>(self: &Arc<Self>, op: &'static str, f: F)
    where
        F: FnOnce(&Arc<Self>, &InLoop<'_>) + Send + 'static,
    {
        let channel = Arc::clone(self);
        let job: Job = Box::new(move || {
            let token = InLoop::assert(&*channel.event_loop);
            if channel.pipeline.load().is_none() {
                trace!(channel = channel.id(), op, "channel deinitialized");
                return;
            }
            f(&channel, &token);
        });
        if self.event_loop.execute(job).is_err() {
            warn!(channel = self.id(), op, "event loop rejected job");
        }
    }

    pub fn close(self: &Arc<Self>) -> OpPromise {
        self.close_with(OpPromise::new())
    }

    /// 整体关闭；Promise 的取值即关闭码。
    pub fn close_with(self: &Arc<Self>, promise: OpPromise) -> OpPromise {
        self.dispatch("close", promise, |_, pipeline, token, promise| {
            pipeline.close(token, promise)
        })
    }

    pub fn close_read(self: &Arc<Self>) -> OpPromise {
        self.close_read_with(OpPromise::new())
    }

    pub fn close_read_with(self: &Arc<Self>, promise: OpPromise) -> OpPromise {
        self.dispatch("close_read", promise, |_, pipeline, token, promise| {
            pipeline.close_read(token, promise)
        })
    }

    pub fn close_write(self: &Arc<Self>) -> OpPromise {
        self.close_write_with(OpPromise::new())
    }

    pub fn close_write_with(self: &Arc<Self>, promise: OpPromise) -> OpPromise {
        self.dispatch("close_write", promise, |_, pipeline, token, promise| {
            pipeline.close_write(token, promise)
        })
    }

    pub fn write(self: &Arc<Self>, data: Bytes) -> OpPromise {
        self.write_with(data, OpPromise::new())
    }

    pub fn write_with(self: &Arc<Self>, data: Bytes, promise: OpPromise) -> OpPromise {
        self.dispatch("write", promise, move |_, pipeline, token, promise| {
            pipeline.write(token, data, promise)
        })
    }

    pub fn write_to(self: &Arc<Self>, data: Bytes, to: SocketAddr) -> OpPromise {
        self.write_to_with(data, to, OpPromise::new())
    }

    pub fn write_to_with(
        self: &Arc<Self>,
        data: Bytes,
        to: SocketAddr,
        promise: OpPromise,
    ) -> OpPromise {
        self.dispatch("write_to", promise, move |_, pipeline, token, promise| {
            pipeline.write_to(token, data, to, promise)
        })
    }

    pub fn set_read_buffer_size(self: &Arc<Self>, size: u32) -> SizePromise {
        if let Err(error) = BufferRange::DEFAULT.check(size) {
            return SizePromise::resolved(Err(error));
        }
        self.dispatch(
            "set_read_buffer_size",
            SizePromise::new(),
            move |channel, _, token, promise| {
                let ctx = ChannelCtx::new(channel, *token);
                channel.transport.set_read_buffer_size(&ctx, size, promise);
            },
        )
    }

    pub fn read_buffer_size(self: &Arc<Self>) -> SizePromise {
        self.dispatch(
            "get_read_buffer_size",
            SizePromise::new(),
            |channel, _, token, promise| {
                let ctx = ChannelCtx::new(channel, *token);
                channel.transport.get_read_buffer_size(&ctx, promise);
            },
        )
    }

    pub fn set_write_buffer_size(self: &Arc<Self>, size: u32) -> SizePromise {
        if let Err(error) = BufferRange::DEFAULT.check(size) {
            return SizePromise::resolved(Err(error));
        }
        self.dispatch(
            "set_write_buffer_size",
            SizePromise::new(),
            move |channel, _, token, promise| {
                let ctx = ChannelCtx::new(channel, *token);
                channel.transport.set_write_buffer_size(&ctx, size, promise);
            },
        )
    }

    pub fn write_buffer_size(self: &Arc<Self>) -> SizePromise {
        self.dispatch(
            "get_write_buffer_size",
            SizePromise::new(),
            |channel, _, token, promise| {
                let ctx = ChannelCtx::new(channel, *token);
                channel.transport.get_write_buffer_size(&ctx, promise);
            },
        )
    }

    pub fn set_nodelay(self: &Arc<Self>, nodelay: bool) -> OpPromise {
        self.dispatch(
            "set_nodelay",
            OpPromise::new(),
            move |channel, _, token, promise| {
                let ctx = ChannelCtx::new(channel, *token);
                channel.transport.set_nodelay(&ctx, nodelay, promise);
            },
        )
    }

    /// 设置带宽上限，`0` 解除限速。
    pub fn set_bandwidth_limit(self: &Arc<Self>, limit: u32) {
        self.dispatch_void("set_bandwidth_limit", move |channel, token| {
            channel.with_core(|core| {
                core.state.axes.rate.set(RateFlags::LIMITED, limit != 0);
            });
            channel
                .transport
                .set_bandwidth_limit(&ChannelCtx::new(channel, *token), limit);
        });
    }

    /// 下发一组配置，以第一个失败项或 `Ok(())` 兑现。
    pub fn apply_config(self: &Arc<Self>, config: &ChannelConfig) -> OpPromise {
        let mut parts = Vec::new();
        if let Some(size) = config.read_buffer_size {
            parts.push(size_to_op(self.set_read_buffer_size(size)));
        }
        if let Some(size) = config.write_buffer_size {
            parts.push(size_to_op(self.set_write_buffer_size(size)));
        }
        if config.nodelay {
            parts.push(self.set_nodelay(true));
        }
        if let Some(limit) = config.bandwidth_limit {
            self.set_bandwidth_limit(limit);
        }
        join_ops(parts)
    }

    /// 开始监听可读；读方向已关闭时回调立即收到 `ReadShutdown`，重复开启为空操作。
    pub fn aio_read(self: &Arc<Self>, mut callback: AioCallback) {
        self.dispatch_void("aio_read", move |channel, token| {
            let read = channel.snapshot().read;
            if read.intersects(ReadFlags::SHUTTING_DOWN | ReadFlags::SHUTDOWN) {
                callback(Err(ChannelError::ReadShutdown));
                return;
            }
            if read.contains(ReadFlags::WATCH) {
                return;
            }
            channel.with_core(|core| core.state.axes.read.insert(ReadFlags::WATCH));
            channel
                .transport
                .aio_read(&ChannelCtx::new(channel, *token), callback);
        });
    }

    pub fn aio_end_read(self: &Arc<Self>) {
        self.dispatch_void("aio_end_read", |channel, token| {
            let watching = channel.with_core(|core| {
                let watching = core.state.axes.read.contains(ReadFlags::WATCH);
                core.state.axes.read.remove(ReadFlags::WATCH);
                watching
            });
            if watching {
                channel
                    .transport
                    .aio_end_read(&ChannelCtx::new(channel, *token));
            }
        });
    }

    /// 开始监听可写；写方向已关闭时回调立即收到 `WriteShutdown`，重复开启为空操作。
    pub fn aio_write(self: &Arc<Self>, mut callback: AioCallback) {
        self.dispatch_void("aio_write", move |channel, token| {
            let write = channel.snapshot().write;
            if write.intersects(WriteFlags::SHUTTING_DOWN | WriteFlags::SHUTDOWN) {
                callback(Err(ChannelError::WriteShutdown));
                return;
            }
            if write.contains(WriteFlags::WATCH) {
                return;
            }
            channel.with_core(|core| core.state.axes.write.insert(WriteFlags::WATCH));
            channel
                .transport
                .aio_write(&ChannelCtx::new(channel, *token), callback);
        });
    }

    pub fn aio_end_write(self: &Arc<Self>) {
        self.dispatch_void("aio_end_write", |channel, token| {
            let watching = channel.with_core(|core| {
                let watching = core.state.axes.write.contains(WriteFlags::WATCH);
                core.state.axes.write.remove(WriteFlags::WATCH);
                watching
            });
            if watching {
                channel
                    .transport
                    .aio_end_write(&ChannelCtx::new(channel, *token));
            }
        });
    }

    pub fn aio_connect(self: &Arc<Self>, callback: AioCallback) {
        self.dispatch_void("aio_connect", move |channel, token| {
            channel
                .transport
                .aio_connect(&ChannelCtx::new(channel, *token), callback);
        });
    }

    pub fn aio_end_connect(self: &Arc<Self>) {
        self.dispatch_void("aio_end_connect", |channel, token| {
            channel
                .transport
                .aio_end_connect(&ChannelCtx::new(channel, *token));
        });
    }
}

impl<T: Transport> Channel<T> {
    /// 进入新一轮生命周期：复位状态，创建关闭 Promise 与 Pipeline，并运行初始化器。
    ///
    /// # 契约说明（What）
    /// - **前置条件**：身处所属循环，且关闭阶段为 `Closed`，否则 panic；
    /// - **后置条件**：关闭阶段为 `Open`，Pipeline 与关闭 Promise 均存在；
    /// - 关闭 Promise 兑现时自动回收本轮 Pipeline；
    /// - `initializer` 可以是闭包，也可以是预先装箱、可跨线程保存的 [`ChannelInitializer`]。
    pub fn init<F>(self: &Arc<Self>, token: &InLoop<'_>, initializer: F)
    where
        F: FnOnce(&ChannelPipeline),
    {
        token.check(&*self.event_loop);
        let close_promise = OpPromise::new();
        let incarnation = self.with_core(|core| {
            assert!(
                matches!(core.state.axes.close, ClosePhase::Closed),
                "init on a channel that is not closed: {:?}",
                core.state.axes.close
            );
            core.state.reset_for_incarnation();
            core.incarnation += 1;
            core.last_error = None;
            core.write_error = None;
            core.close_promise = Some(close_promise.clone());
            core.state.check_invariants(true);
            core.incarnation
        });

        let weak = self.self_ref.clone();
        close_promise.if_done(move |_| {
            if let Some(channel) = weak.upgrade() {
                let outcome =
                    channel.run_in_loop(move |channel, token| channel.deinit(token, incarnation));
                if outcome.is_err() {
                    channel.detach_pipeline(incarnation);
                }
            }
        });

        let sink: Weak<dyn PipelineSink> = self.self_ref.clone();
        let pipeline = Arc::new(ChannelPipeline::new(sink));
        initializer(&pipeline);
        self.pipeline.store(Some(Arc::clone(&pipeline)));
        pipeline.init(token);
        debug!(
            channel = self.id(),
            incarnation,
            handlers = pipeline.len(),
            "channel initialized"
        );
    }

    fn deinit(self: &Arc<Self>, token: &InLoop<'_>, incarnation: u64) {
        let current = self.with_core(|core| {
            if core.incarnation != incarnation {
                return false;
            }
            core.close_promise = None;
            true
        });
        if !current {
            return;
        }
        if let Some(pipeline) = self.pipeline.swap(None) {
            pipeline.deinit(token);
        }
        debug!(channel = self.id(), incarnation, "channel deinitialized");
    }

    /// 循环已终止、无法回到循环线程时摘下本轮 Pipeline。
    ///
    /// `removed` 钩子需要循环令牌，此路径不再运行；释放 Pipeline 仍会断开 Handler 持有的资源。
    fn detach_pipeline(&self, incarnation: u64) {
        let current = self.with_core(|core| {
            if core.incarnation != incarnation {
                return false;
            }
            core.close_promise = None;
            true
        });
        if current && self.pipeline.swap(None).is_some() {
            warn!(
                channel = self.id(),
                incarnation,
                "loop terminated, pipeline detached without teardown hooks"
            );
        }
    }

    /// 派发 `closed` 事件（至多一次）并以 `code` 兑现关闭 Promise。
    fn fire_closed(self: &Arc<Self>, token: &InLoop<'_>, code: OpResult) {
        let (first, close_promise) = self.with_core(|core| {
            core.state.axes.close = ClosePhase::Closed;
            let first = core.state.mark_fired(FiredEvents::CLOSED);
            core.state.check_invariants(true);
            (first, core.close_promise.clone())
        });
        if first {
            if let Some(pipeline) = self.pipeline.load_full() {
                pipeline.fire_closed(token);
            }
        }
        debug!(channel = self.id(), ?code, "channel closed");
        if let Some(close_promise) = close_promise {
            close_promise.set(code);
        }
    }

    /// 读写均已半关闭且尚未进入关闭流程时，自动发起整体关闭。
    fn rdwr_shutdown_check(self: &Arc<Self>, token: &InLoop<'_>) {
        if self.with_core(|core| core.state.needs_auto_close()) {
            debug!(channel = self.id(), "both directions shut down, closing");
            self.begin_close(token);
        }
        self.with_core(|core| core.state.check_invariants(true));
    }

    /// 把传输完成结果带回循环线程；循环已终止时以 `fallback` 兑现。
    fn on_complete<F>(&self, inner: &OpPromise, fallback: Vec<OpPromise>, step: F)
    where
        F: FnOnce(&Arc<Self>, &InLoop<'_>, OpResult) + Send + 'static,
    {
        let weak = self.self_ref.clone();
        inner.if_done(move |result| {
            let result = result.clone();
            let Some(channel) = weak.upgrade() else {
                for promise in fallback {
                    promise.set(result.clone());
                }
                return;
            };
            if channel
                .run_in_loop(move |channel, token| step(channel, token, result))
                .is_err()
            {
                for promise in fallback {
                    promise.set(Err(ChannelError::LoopTerminated));
                }
            }
        });
    }

    fn request_write<F>(self: &Arc<Self>, token: &InLoop<'_>, promise: OpPromise, submit: F)
    where
        F: FnOnce(&T, &ChannelCtx<'_, T>, OpPromise),
    {
        token.check(&*self.event_loop);
        let rejected = self.with_core(|core| {
            let axes = core.state.axes;
            if !matches!(axes.close, ClosePhase::Open) {
                Some(ChannelError::Closed)
            } else if axes.write.intersects(
                WriteFlags::SHUTTING_DOWN | WriteFlags::SHUTDOWN | WriteFlags::SHUTDOWN_PENDING,
            ) {
                Some(ChannelError::WriteShutdown)
            } else if axes.write.contains(WriteFlags::ERROR) {
                Some(core.write_error.clone().unwrap_or(ChannelError::WriteShutdown))
            } else {
                core.state.begin_write();
                core.state.check_invariants(false);
                None
            }
        });
        let incarnation = self.with_core(|core| core.incarnation);
        if let Some(error) = rejected {
            trace!(channel = self.id(), op = "write", %error, "write rejected");
            promise.set(Err(error));
            return;
        }

        let inner = OpPromise::new();
        let outer = promise.clone();
        self.on_complete(&inner, vec![promise], move |channel, token, result| {
            channel.finish_write(token, incarnation, result, outer)
        });
        submit(&self.transport, &ChannelCtx::new(self, *token), inner);
    }

    fn finish_write(
        self: &Arc<Self>,
        token: &InLoop<'_>,
        incarnation: u64,
        result: OpResult,
        promise: OpPromise,
    ) {
        let outcome = self.with_core(|core| {
            if core.incarnation != incarnation {
                return None;
            }
            if let Err(error) = &result {
                if !matches!(error, ChannelError::Unsupported(_)) {
                    core.record_error(Direction::Write, error);
                }
            }
            let drained = core.state.end_write();
            core.state.check_invariants(false);
            let run_close = drained && matches!(core.state.axes.close, ClosePhase::ClosePending);
            let run_shutdown =
                drained && core.state.axes.write.contains(WriteFlags::SHUTDOWN_PENDING);
            Some((run_close, run_shutdown))
        });
        let Some((run_close, run_shutdown)) = outcome else {
            trace!(channel = self.id(), incarnation, "stale write completion dropped");
            promise.set(result);
            return;
        };
        if let Err(error) = &result {
            warn!(channel = self.id(), op = "write", %error, "write failed");
        }
        promise.set(result);
        if run_close {
            self.begin_close(token);
        } else if run_shutdown {
            self.begin_half_close(token, Direction::Write);
        }
    }

    fn request_half_close(
        self: &Arc<Self>,
        token: &InLoop<'_>,
        direction: Direction,
        promise: OpPromise,
    ) {
        token.check(&*self.event_loop);
        let decision = self.with_core(|core| {
            let axes = core.state.axes;
            let (shutting_down, shutdown) = match direction {
                Direction::Read => (
                    axes.read.contains(ReadFlags::SHUTTING_DOWN),
                    axes.read.contains(ReadFlags::SHUTDOWN),
                ),
                Direction::Write => (
                    axes.write
                        .intersects(WriteFlags::SHUTTING_DOWN | WriteFlags::SHUTDOWN_PENDING),
                    axes.write.contains(WriteFlags::SHUTDOWN),
                ),
            };
            if shutdown {
                return HalfClose::Resolve(Ok(()));
            }
            if !matches!(axes.close, ClosePhase::Open) {
                return match &core.close_promise {
                    Some(close_promise) => HalfClose::AttachToClose(close_promise.clone()),
                    None => HalfClose::Resolve(Err(ChannelError::Closed)),
                };
            }
            core.waiters(direction).push(promise.clone());
            if shutting_down {
                return HalfClose::Wait;
            }
            if matches!(direction, Direction::Write) && core.state.writes_in_flight > 0 {
                core.state.axes.write.insert(WriteFlags::SHUTDOWN_PENDING);
                core.state.check_invariants(false);
                return HalfClose::Wait;
            }
            HalfClose::Start
        });
        match decision {
            HalfClose::Resolve(result) => {
                promise.set(result);
            }
            HalfClose::AttachToClose(close_promise) => close_promise.forward_to(&promise),
            HalfClose::Wait => {
                trace!(channel = self.id(), ?direction, "half close queued");
            }
            HalfClose::Start => self.begin_half_close(token, direction),
        }
    }

    fn begin_half_close(self: &Arc<Self>, token: &InLoop<'_>, direction: Direction) {
        let (incarnation, waiters) = self.with_core(|core| {
            match direction {
                Direction::Read => core.state.axes.read.insert(ReadFlags::SHUTTING_DOWN),
                Direction::Write => {
                    core.state.axes.write.remove(WriteFlags::SHUTDOWN_PENDING);
                    core.state.axes.write.insert(WriteFlags::SHUTTING_DOWN);
                }
            }
            core.state.check_invariants(false);
            (core.incarnation, core.waiters(direction).clone())
        });
        debug!(channel = self.id(), ?direction, "half close started");

        let inner = OpPromise::new();
        let captured = waiters.clone();
        self.on_complete(&inner, waiters, move |channel, token, result| {
            channel.finish_half_close(token, direction, incarnation, captured, result)
        });
        let ctx = ChannelCtx::new(self, *token);
        match direction {
            Direction::Read => self.transport.close_read_impl(&ctx, inner),
            Direction::Write => self.transport.close_write_impl(&ctx, inner),
        }
    }

    fn finish_half_close(
        self: &Arc<Self>,
        token: &InLoop<'_>,
        direction: Direction,
        incarnation: u64,
        captured: Vec<OpPromise>,
        result: OpResult,
    ) {
        let outcome = self.with_core(|core| {
            if core.incarnation != incarnation {
                return None;
            }
            let first = match (&result, direction) {
                (Ok(()), Direction::Read) => {
                    core.state.axes.read.remove(ReadFlags::SHUTTING_DOWN);
                    core.state.axes.read.insert(ReadFlags::SHUTDOWN);
                    core.state.mark_fired(FiredEvents::READ_CLOSED)
                }
                (Ok(()), Direction::Write) => {
                    core.state.axes.write.remove(WriteFlags::SHUTTING_DOWN);
                    core.state.axes.write.insert(WriteFlags::SHUTDOWN);
                    core.state.mark_fired(FiredEvents::WRITE_CLOSED)
                }
                (Err(error), Direction::Read) => {
                    core.state.axes.read.remove(ReadFlags::SHUTTING_DOWN);
                    core.record_error(direction, error);
                    false
                }
                (Err(error), Direction::Write) => {
                    core.state.axes.write.remove(WriteFlags::SHUTTING_DOWN);
                    core.record_error(direction, error);
                    false
                }
            };
            core.state.check_invariants(false);
            Some((first, mem::take(core.waiters(direction))))
        });
        let Some((first, waiters)) = outcome else {
            trace!(
                channel = self.id(),
                ?direction,
                incarnation,
                "stale half close completion dropped"
            );
            for waiter in captured {
                waiter.set(result.clone());
            }
            return;
        };
        debug!(channel = self.id(), ?direction, ?result, "half close finished");
        if first {
            if let Some(pipeline) = self.pipeline.load_full() {
                match direction {
                    Direction::Read => pipeline.fire_read_closed(token),
                    Direction::Write => pipeline.fire_write_closed(token),
                }
            }
        }
        for waiter in waiters {
            waiter.set(result.clone());
        }
        self.rdwr_shutdown_check(token);
    }

    fn request_close(self: &Arc<Self>, token: &InLoop<'_>, promise: OpPromise) {
        token.check(&*self.event_loop);
        let decision = self.with_core(|core| {
            let Some(close_promise) = core.close_promise.clone() else {
                return FullClose::Resolve(Err(ChannelError::Closed));
            };
            match core.state.axes.close {
                ClosePhase::Closed | ClosePhase::ClosePending | ClosePhase::Closing => {
                    FullClose::Attach(close_promise)
                }
                ClosePhase::Open if core.state.writes_in_flight > 0 => {
                    core.state.axes.close = ClosePhase::ClosePending;
                    core.state.check_invariants(true);
                    FullClose::Attach(close_promise)
                }
                ClosePhase::Open => FullClose::Start(close_promise),
            }
        });
        match decision {
            FullClose::Resolve(result) => {
                promise.set(result);
            }
            FullClose::Attach(close_promise) => {
                trace!(channel = self.id(), "close attached to pending close");
                close_promise.forward_to(&promise);
            }
            FullClose::Start(close_promise) => {
                close_promise.forward_to(&promise);
                self.begin_close(token);
            }
        }
    }

    fn begin_close(self: &Arc<Self>, token: &InLoop<'_>) {
        let (incarnation, close_promise) = self.with_core(|core| {
            core.state.axes.close = ClosePhase::Closing;
            core.state.check_invariants(true);
            (core.incarnation, core.close_promise.clone())
        });
        debug!(channel = self.id(), "closing channel");

        let inner = OpPromise::new();
        let fallback: Vec<OpPromise> = close_promise.into_iter().collect();
        let captured = fallback.clone();
        self.on_complete(&inner, fallback, move |channel, token, code| {
            channel.finish_close(token, incarnation, captured, code)
        });
        self.transport
            .close_impl(&ChannelCtx::new(self, *token), inner);
    }

    fn finish_close(
        self: &Arc<Self>,
        token: &InLoop<'_>,
        incarnation: u64,
        captured: Vec<OpPromise>,
        code: OpResult,
    ) {
        let outcome = self.with_core(|core| {
            if core.incarnation != incarnation {
                return None;
            }
            let axes = &mut core.state.axes;
            axes.read.remove(ReadFlags::SHUTTING_DOWN | ReadFlags::WATCH);
            axes.read.insert(ReadFlags::SHUTDOWN);
            axes.write.remove(
                WriteFlags::SHUTTING_DOWN | WriteFlags::SHUTDOWN_PENDING | WriteFlags::WATCH,
            );
            axes.write.insert(WriteFlags::SHUTDOWN);
            let read_first = core.state.mark_fired(FiredEvents::READ_CLOSED);
            let write_first = core.state.mark_fired(FiredEvents::WRITE_CLOSED);
            let mut waiters = mem::take(&mut core.read_waiters);
            waiters.append(&mut core.write_waiters);
            core.state.check_invariants(true);
            Some((read_first, write_first, waiters))
        });
        let Some((read_first, write_first, waiters)) = outcome else {
            trace!(channel = self.id(), incarnation, "stale close completion dropped");
            for promise in captured {
                promise.set(code.clone());
            }
            return;
        };
        if let Some(pipeline) = self.pipeline.load_full() {
            if read_first {
                pipeline.fire_read_closed(token);
            }
            if write_first {
                pipeline.fire_write_closed(token);
            }
        }
        for waiter in waiters {
            waiter.set(code.clone());
        }
        self.fire_closed(token, code);
    }
}

impl<T: Transport> PipelineSink for Channel<T> {
    fn sink_write(&self, token: &InLoop<'_>, data: Bytes, promise: OpPromise) {
        let Some(channel) = self.handle() else {
            promise.set(Err(ChannelError::Closed));
            return;
        };
        channel.request_write(token, promise, move |transport, ctx, inner| {
            transport.write_impl(ctx, data, inner)
        });
    }

    fn sink_write_to(&self, token: &InLoop<'_>, data: Bytes, to: SocketAddr, promise: OpPromise) {
        let Some(channel) = self.handle() else {
            promise.set(Err(ChannelError::Closed));
            return;
        };
        channel.request_write(token, promise, move |transport, ctx, inner| {
            transport.write_to_impl(ctx, data, to, inner)
        });
    }

    fn sink_close(&self, token: &InLoop<'_>, promise: OpPromise) {
        match self.handle() {
            Some(channel) => channel.request_close(token, promise),
            None => {
                promise.set(Err(ChannelError::Closed));
            }
        }
    }

    fn sink_close_read(&self, token: &InLoop<'_>, promise: OpPromise) {
        match self.handle() {
            Some(channel) => channel.request_half_close(token, Direction::Read, promise),
            None => {
                promise.set(Err(ChannelError::Closed));
            }
        }
    }

    fn sink_close_write(&self, token: &InLoop<'_>, promise: OpPromise) {
        match self.handle() {
            Some(channel) => channel.request_half_close(token, Direction::Write, promise),
            None => {
                promise.set(Err(ChannelError::Closed));
            }
        }
    }

    fn describe(&self) -> String {
        format!("#{} {}", self.id(), self.info())
    }
}

impl<T: Transport> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("event_loop", &self.event_loop.name())
            .field("state", &self.snapshot())
            .finish()
    }
}

fn size_to_op(promise: SizePromise) -> OpPromise {
    let op = OpPromise::new();
    let target = op.clone();
    promise.if_done(move |result| {
        target.set(result.clone().map(|_| ()));
    });
    op
}

/// 全部完成后，以提交顺序中的第一个失败或 `Ok(())` 兑现。
fn join_ops(parts: Vec<OpPromise>) -> OpPromise {
    if parts.is_empty() {
        return OpPromise::resolved(Ok(()));
    }
    let joined = OpPromise::new();
    let remaining = Arc::new(AtomicUsize::new(parts.len()));
    let parts = Arc::new(parts);
    for part in parts.iter() {
        let remaining = Arc::clone(&remaining);
        let all = Arc::clone(&parts);
        let joined = joined.clone();
        part.if_done(move |_| {
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let outcome = all
                    .iter()
                    .filter_map(Promise::try_get)
                    .find(Result::is_err)
                    .unwrap_or(Ok(()));
                joined.set(outcome);
            }
        });
    }
    joined
}

/// 传输实现在循环线程上看到的通道视图。
///
/// 持有通道 `Arc` 与循环令牌，提供事件派发与阶段标记的辅助方法。
pub struct ChannelCtx<'a, T: Transport> {
    channel: &'a Arc<Channel<T>>,
    token: InLoop<'a>,
}

impl<'a, T: Transport> ChannelCtx<'a, T> {
    /// 以令牌构造视图；令牌必须来自该通道的循环。
    #[track_caller]
    pub fn new(channel: &'a Arc<Channel<T>>, token: InLoop<'a>) -> Self {
        token.check(&*channel.event_loop);
        Self { channel, token }
    }

    pub fn channel(&self) -> &Arc<Channel<T>> {
        self.channel
    }

    pub fn token(&self) -> &InLoop<'a> {
        &self.token
    }

    fn update(&self, f: impl FnOnce(&mut ChannelState)) {
        self.channel.with_core(|core| {
            f(&mut core.state);
            core.state.check_invariants(false);
        });
    }

    fn with_pipeline(&self, f: impl FnOnce(&ChannelPipeline)) {
        if let Some(pipeline) = self.channel.pipeline.load_full() {
            f(&*pipeline);
        }
    }

    pub fn set_active(&self) {
        self.update(|state| state.axes.role = Role::Active);
    }

    pub fn set_connecting(&self) {
        self.update(|state| state.axes.connect = ConnectPhase::Connecting);
    }

    pub fn set_connected(&self) {
        self.update(|state| state.axes.connect = ConnectPhase::Connected);
    }

    pub fn set_listening(&self) {
        self.update(|state| state.axes.connect = ConnectPhase::Listening);
    }

    /// 派发 `connected`，每轮生命周期至多一次。
    pub fn fire_connected(&self) {
        let mut first = false;
        self.update(|state| first = state.mark_fired(FiredEvents::CONNECTED));
        if first {
            self.with_pipeline(|pipeline| pipeline.fire_connected(&self.token));
        }
    }

    /// 派发入站数据；读方向已关闭时丢弃。
    pub fn fire_read(&self, data: Bytes) {
        if self.channel.snapshot().read.contains(ReadFlags::SHUTDOWN) {
            trace!(channel = self.channel.id(), "read after read shutdown dropped");
            return;
        }
        self.with_pipeline(|pipeline| pipeline.fire_read(&self.token, data));
    }

    /// 派发带来源地址的入站数据报；读方向已关闭时丢弃。
    pub fn fire_readfrom(&self, data: Bytes, from: SocketAddr) {
        if self.channel.snapshot().read.contains(ReadFlags::SHUTDOWN) {
            trace!(channel = self.channel.id(), "readfrom after read shutdown dropped");
            return;
        }
        self.with_pipeline(|pipeline| pipeline.fire_readfrom(&self.token, data, from));
    }

    /// 记录读错误；尚未建连时同时经 Pipeline 派发错误事件。
    pub fn report_read_error(&self, error: ChannelError) {
        warn!(channel = self.channel.id(), op = "read", %error, "read failed");
        let connected = self.channel.with_core(|core| {
            core.record_error(Direction::Read, &error);
            matches!(core.state.axes.connect, ConnectPhase::Connected)
        });
        if !connected {
            self.with_pipeline(|pipeline| pipeline.fire_error(&self.token, error));
        }
    }

    /// 建连/握手阶段的失败经 Pipeline 派发；已建连后只记录，返回是否派发。
    pub fn fire_error(&self, error: ChannelError) -> bool {
        let connected = self.channel.with_core(|core| {
            core.last_error = Some(error.clone());
            matches!(core.state.axes.connect, ConnectPhase::Connected)
        });
        if connected {
            debug!(channel = self.channel.id(), %error, "error after connect recorded");
            return false;
        }
        self.with_pipeline(|pipeline| pipeline.fire_error(&self.token, error));
        true
    }

    /// 收到对端 FIN。
    pub fn fin_received(&self) {
        self.update(|state| state.axes.write.insert(WriteFlags::FIN_RECEIVED));
    }

    pub fn set_write_barrier(&self, on: bool) {
        self.update(|state| state.axes.write.set(WriteFlags::BARRIER, on));
    }

    /// 标记限速定时器或通用定时器槽位。
    pub fn set_timer(&self, timer: RateFlags, armed: bool) {
        self.update(|state| state.axes.rate.set(timer & !RateFlags::LIMITED, armed));
    }

    pub fn loop_begin(&self) {
        self.update(|state| state.axes.event_loop.insert(LoopFlags::BEGINNING));
    }

    pub fn loop_begin_done(&self, ok: bool) {
        self.update(|state| {
            let flags = &mut state.axes.event_loop;
            flags.remove(LoopFlags::BEGINNING);
            flags.insert(if ok {
                LoopFlags::BEGIN_DONE
            } else {
                LoopFlags::BEGIN_FAILED
            });
        });
    }

    pub fn loop_notify_terminating(&self) {
        self.update(|state| state.axes.event_loop.insert(LoopFlags::NOTIFY_TERMINATING));
    }
}
