use std::{fmt, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    error::ChannelError,
    pipeline::{ChannelHandler, HandlerContext},
};

/// `RecordingHandler` 记录到的事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Added,
    Removed,
    Connected,
    Read(Bytes),
    ReadFrom(Bytes, SocketAddr),
    ReadClosed,
    WriteClosed,
    Closed,
    Error(ChannelError),
}

/// 记录全部入站事件后原样转发的 Handler。
pub struct RecordingHandler {
    name: String,
    events: Mutex<Vec<ChannelEvent>>,
}

impl RecordingHandler {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            events: Mutex::new(Vec::new()),
        })
    }

    /// 按发生顺序返回事件副本。
    pub fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().clone()
    }

    /// 与 `event` 相等的事件数量。
    pub fn count(&self, event: &ChannelEvent) -> usize {
        self.events.lock().iter().filter(|seen| *seen == event).count()
    }

    /// 清空已记录事件。
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, event: ChannelEvent) {
        self.events.lock().push(event);
    }
}

impl ChannelHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn added(&self, _ctx: &HandlerContext<'_>) {
        self.record(ChannelEvent::Added);
    }

    fn removed(&self, _ctx: &HandlerContext<'_>) {
        self.record(ChannelEvent::Removed);
    }

    fn connected(&self, ctx: &HandlerContext<'_>) {
        self.record(ChannelEvent::Connected);
        ctx.fire_connected();
    }

    fn read(&self, ctx: &HandlerContext<'_>, data: Bytes) {
        self.record(ChannelEvent::Read(data.clone()));
        ctx.fire_read(data);
    }

    fn readfrom(&self, ctx: &HandlerContext<'_>, data: Bytes, from: SocketAddr) {
        self.record(ChannelEvent::ReadFrom(data.clone(), from));
        ctx.fire_readfrom(data, from);
    }

    fn read_closed(&self, ctx: &HandlerContext<'_>) {
        self.record(ChannelEvent::ReadClosed);
        ctx.fire_read_closed();
    }

    fn write_closed(&self, ctx: &HandlerContext<'_>) {
        self.record(ChannelEvent::WriteClosed);
        ctx.fire_write_closed();
    }

    fn closed(&self, ctx: &HandlerContext<'_>) {
        self.record(ChannelEvent::Closed);
        ctx.fire_closed();
    }

    fn error(&self, ctx: &HandlerContext<'_>, error: ChannelError) {
        self.record(ChannelEvent::Error(error.clone()));
        ctx.fire_error(error);
    }
}

impl fmt::Debug for RecordingHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingHandler")
            .field("name", &self.name)
            .field("events", &self.events.lock().len())
            .finish()
    }
}
