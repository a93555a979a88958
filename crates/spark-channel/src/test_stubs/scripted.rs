use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    net::SocketAddr,
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    channel::{AioCallback, ChannelCtx, ChannelId},
    error::ChannelError,
    promise::{OpPromise, OpResult, SizePromise},
    transport::Transport,
};

#[derive(Clone, Copy)]
enum AioSlot {
    Read,
    Write,
    Connect,
}

/// `ScriptedTransport` 记录的调用种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportOp {
    Write,
    WriteTo,
    CloseRead,
    CloseWrite,
    Close,
    SetReadBuffer,
    GetReadBuffer,
    SetWriteBuffer,
    GetWriteBuffer,
    SetNodelay,
    BandwidthLimit,
    AioRead,
    AioEndRead,
    AioWrite,
    AioEndWrite,
    AioConnect,
    AioEndConnect,
}

#[derive(Default)]
struct Script {
    calls: Vec<TransportOp>,
    written: Vec<(Option<SocketAddr>, Bytes)>,
    deferred: HashSet<TransportOp>,
    failures: HashMap<TransportOp, VecDeque<ChannelError>>,
    pending: VecDeque<(TransportOp, OpPromise)>,
    read_buffer: u32,
    write_buffer: u32,
    nodelay: bool,
    bandwidth_limit: u32,
    read_callback: Option<AioCallback>,
    write_callback: Option<AioCallback>,
    connect_callback: Option<AioCallback>,
}

impl Script {
    fn slot(&mut self, slot: AioSlot) -> &mut Option<AioCallback> {
        match slot {
            AioSlot::Read => &mut self.read_callback,
            AioSlot::Write => &mut self.write_callback,
            AioSlot::Connect => &mut self.connect_callback,
        }
    }
}

/// 可编排的传输桩。
///
/// # 契约说明（What）
/// - 每次调用都按顺序记录到 `calls`；
/// - 默认立即以 `Ok` 兑现，`defer(op)` 后该类操作的 Promise 进入待完成队列，由 `complete_next` 兑现；
/// - `fail_next(op, error)` 让下一次该类操作以 `error` 兑现（优先于 `defer`）；
/// - 流式实例不支持 `write_to`，数据报实例（[`ScriptedTransport::datagram`]）支持。
pub struct ScriptedTransport {
    id: ChannelId,
    datagram: bool,
    script: Mutex<Script>,
}

impl ScriptedTransport {
    /// 面向流的传输。
    pub fn stream(id: ChannelId) -> Self {
        Self::with_kind(id, false)
    }

    /// 数据报传输，支持 `write_to`。
    pub fn datagram(id: ChannelId) -> Self {
        Self::with_kind(id, true)
    }

    fn with_kind(id: ChannelId, datagram: bool) -> Self {
        Self {
            id,
            datagram,
            script: Mutex::new(Script {
                read_buffer: 64 * 1024,
                write_buffer: 64 * 1024,
                ..Script::default()
            }),
        }
    }

    /// 之后的 `op` 调用改为手动完成。
    pub fn defer(self, op: TransportOp) -> Self {
        self.script.lock().deferred.insert(op);
        self
    }

    /// 下一次 `op` 调用以 `error` 失败。
    pub fn fail_next(&self, op: TransportOp, error: ChannelError) {
        self.script
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// 以 `result` 兑现最早一个待完成的 `op`，没有待完成项时返回 `false`。
    pub fn complete_next(&self, op: TransportOp, result: OpResult) -> bool {
        let promise = {
            let mut script = self.script.lock();
            let position = script.pending.iter().position(|(pending, _)| *pending == op);
            position.and_then(|index| script.pending.remove(index))
        };
        match promise {
            Some((_, promise)) => promise.set(result),
            None => false,
        }
    }

    /// 待完成的 `op` 数量。
    pub fn pending(&self, op: TransportOp) -> usize {
        self.script
            .lock()
            .pending
            .iter()
            .filter(|(pending, _)| *pending == op)
            .count()
    }

    pub fn calls(&self) -> Vec<TransportOp> {
        self.script.lock().calls.clone()
    }

    /// `op` 被调用的次数。
    pub fn count(&self, op: TransportOp) -> usize {
        self.script.lock().calls.iter().filter(|call| **call == op).count()
    }

    /// 已写出的数据及目标地址。
    pub fn written(&self) -> Vec<(Option<SocketAddr>, Bytes)> {
        self.script.lock().written.clone()
    }

    pub fn nodelay(&self) -> bool {
        self.script.lock().nodelay
    }

    pub fn bandwidth_limit(&self) -> u32 {
        self.script.lock().bandwidth_limit
    }

    /// 模拟可读事件，调用 `aio_read` 注册的回调；未注册时返回 `false`。
    pub fn trigger_read(&self, result: OpResult) -> bool {
        self.trigger(AioSlot::Read, result)
    }

    /// 模拟可写事件。
    pub fn trigger_write(&self, result: OpResult) -> bool {
        self.trigger(AioSlot::Write, result)
    }

    /// 模拟建连完成事件。
    pub fn trigger_connect(&self, result: OpResult) -> bool {
        self.trigger(AioSlot::Connect, result)
    }

    /// 回调在锁外执行；执行期间若未重新注册，则放回原回调。
    fn trigger(&self, slot: AioSlot, result: OpResult) -> bool {
        let taken = self.script.lock().slot(slot).take();
        let Some(mut callback) = taken else {
            return false;
        };
        callback(result);
        let mut script = self.script.lock();
        let registered = script.slot(slot);
        if registered.is_none() {
            *registered = Some(callback);
        }
        true
    }

    fn record(&self, op: TransportOp) {
        self.script.lock().calls.push(op);
    }

    /// 记录调用并按脚本兑现。
    fn settle(&self, op: TransportOp, promise: OpPromise) {
        let outcome = {
            let mut script = self.script.lock();
            script.calls.push(op);
            let failure = script.failures.get_mut(&op).and_then(VecDeque::pop_front);
            match failure {
                Some(error) => Some(Err(error)),
                None if script.deferred.contains(&op) => {
                    script.pending.push_back((op, promise.clone()));
                    None
                }
                None => Some(Ok(())),
            }
        };
        if let Some(result) = outcome {
            promise.set(result);
        }
    }

    fn settle_size(&self, op: TransportOp, value: u32, promise: SizePromise) {
        let failure = {
            let mut script = self.script.lock();
            script.calls.push(op);
            script.failures.get_mut(&op).and_then(VecDeque::pop_front)
        };
        promise.set(failure.map_or(Ok(value), Err));
    }
}

impl Transport for ScriptedTransport {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn info(&self) -> String {
        let kind = if self.datagram { "datagram" } else { "stream" };
        format!("scripted-{kind}")
    }

    fn set_read_buffer_size(&self, _ctx: &ChannelCtx<'_, Self>, size: u32, promise: SizePromise) {
        self.script.lock().read_buffer = size;
        self.settle_size(TransportOp::SetReadBuffer, size, promise);
    }

    fn get_read_buffer_size(&self, _ctx: &ChannelCtx<'_, Self>, promise: SizePromise) {
        let size = self.script.lock().read_buffer;
        self.settle_size(TransportOp::GetReadBuffer, size, promise);
    }

    fn set_write_buffer_size(&self, _ctx: &ChannelCtx<'_, Self>, size: u32, promise: SizePromise) {
        self.script.lock().write_buffer = size;
        self.settle_size(TransportOp::SetWriteBuffer, size, promise);
    }

    fn get_write_buffer_size(&self, _ctx: &ChannelCtx<'_, Self>, promise: SizePromise) {
        let size = self.script.lock().write_buffer;
        self.settle_size(TransportOp::GetWriteBuffer, size, promise);
    }

    fn set_nodelay(&self, _ctx: &ChannelCtx<'_, Self>, nodelay: bool, promise: OpPromise) {
        self.script.lock().nodelay = nodelay;
        self.settle(TransportOp::SetNodelay, promise);
    }

    fn set_bandwidth_limit(&self, _ctx: &ChannelCtx<'_, Self>, limit: u32) {
        let mut script = self.script.lock();
        script.calls.push(TransportOp::BandwidthLimit);
        script.bandwidth_limit = limit;
    }

    fn write_impl(&self, _ctx: &ChannelCtx<'_, Self>, data: Bytes, promise: OpPromise) {
        self.script.lock().written.push((None, data));
        self.settle(TransportOp::Write, promise);
    }

    fn write_to_impl(
        &self,
        _ctx: &ChannelCtx<'_, Self>,
        data: Bytes,
        to: SocketAddr,
        promise: OpPromise,
    ) {
        if !self.datagram {
            self.record(TransportOp::WriteTo);
            promise.set(Err(ChannelError::Unsupported("write_to")));
            return;
        }
        self.script.lock().written.push((Some(to), data));
        self.settle(TransportOp::WriteTo, promise);
    }

    fn close_read_impl(&self, _ctx: &ChannelCtx<'_, Self>, promise: OpPromise) {
        self.settle(TransportOp::CloseRead, promise);
    }

    fn close_write_impl(&self, _ctx: &ChannelCtx<'_, Self>, promise: OpPromise) {
        self.settle(TransportOp::CloseWrite, promise);
    }

    fn close_impl(&self, _ctx: &ChannelCtx<'_, Self>, promise: OpPromise) {
        self.settle(TransportOp::Close, promise);
    }

    fn aio_read(&self, _ctx: &ChannelCtx<'_, Self>, callback: AioCallback) {
        let mut script = self.script.lock();
        script.calls.push(TransportOp::AioRead);
        script.read_callback = Some(callback);
    }

    fn aio_end_read(&self, _ctx: &ChannelCtx<'_, Self>) {
        let mut script = self.script.lock();
        script.calls.push(TransportOp::AioEndRead);
        script.read_callback = None;
    }

    fn aio_write(&self, _ctx: &ChannelCtx<'_, Self>, callback: AioCallback) {
        let mut script = self.script.lock();
        script.calls.push(TransportOp::AioWrite);
        script.write_callback = Some(callback);
    }

    fn aio_end_write(&self, _ctx: &ChannelCtx<'_, Self>) {
        let mut script = self.script.lock();
        script.calls.push(TransportOp::AioEndWrite);
        script.write_callback = None;
    }

    fn aio_connect(&self, _ctx: &ChannelCtx<'_, Self>, callback: AioCallback) {
        let mut script = self.script.lock();
        script.calls.push(TransportOp::AioConnect);
        script.connect_callback = Some(callback);
    }

    fn aio_end_connect(&self, _ctx: &ChannelCtx<'_, Self>) {
        let mut script = self.script.lock();
        script.calls.push(TransportOp::AioEndConnect);
        script.connect_callback = None;
    }
}

impl fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let script = self.script.lock();
        f.debug_struct("ScriptedTransport")
            .field("id", &self.id)
            .field("datagram", &self.datagram)
            .field("calls", &script.calls.len())
            .field("pending", &script.pending.len())
            .finish()
    }
}
