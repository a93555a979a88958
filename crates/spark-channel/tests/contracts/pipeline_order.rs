use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use spark_channel::{
    ChannelError, ChannelHandler, ClosePhase, HandlerContext, OpPromise,
    test_stubs::{ChannelEvent, RecordingHandler, ScriptedTransport, TransportOp},
};

use super::support::Harness;

type Journal = Arc<Mutex<Vec<String>>>;

/// 记录经过自身的事件名后原样转发。
struct Tag {
    name: &'static str,
    journal: Journal,
}

impl Tag {
    fn install(name: &'static str, journal: &Journal) -> Arc<dyn ChannelHandler> {
        Arc::new(Self {
            name,
            journal: Arc::clone(journal),
        })
    }

    fn note(&self, event: &str) {
        self.journal.lock().push(format!("{}:{event}", self.name));
    }
}

impl ChannelHandler for Tag {
    fn name(&self) -> &str {
        self.name
    }

    fn read(&self, ctx: &HandlerContext<'_>, data: Bytes) {
        self.note("read");
        ctx.fire_read(data);
    }

    fn error(&self, ctx: &HandlerContext<'_>, error: ChannelError) {
        self.note("error");
        ctx.fire_error(error);
    }

    fn write(&self, ctx: &HandlerContext<'_>, data: Bytes, promise: OpPromise) {
        self.note("write");
        ctx.write(data, promise);
    }

    fn close(&self, ctx: &HandlerContext<'_>, promise: OpPromise) {
        self.note("close");
        ctx.close(promise);
    }
}

/// 吞掉所有写操作并自行兑现。
struct Swallow;

impl ChannelHandler for Swallow {
    fn name(&self) -> &str {
        "swallow"
    }

    fn write(&self, _ctx: &HandlerContext<'_>, _data: Bytes, promise: OpPromise) {
        promise.set(Ok(()));
    }
}

/// 为每个出站帧加上方括号。
struct Framer;

impl ChannelHandler for Framer {
    fn name(&self) -> &str {
        "framer"
    }

    fn write(&self, ctx: &HandlerContext<'_>, data: Bytes, promise: OpPromise) {
        let mut framed = Vec::with_capacity(data.len() + 2);
        framed.push(b'[');
        framed.extend_from_slice(&data);
        framed.push(b']');
        ctx.write(Bytes::from(framed), promise);
    }
}

/// 收到 `BYE` 时在读回调内关闭通道。
struct HangUp;

impl ChannelHandler for HangUp {
    fn name(&self) -> &str {
        "hang-up"
    }

    fn read(&self, ctx: &HandlerContext<'_>, data: Bytes) {
        if data.as_ref() == b"BYE" {
            ctx.close(OpPromise::new());
            return;
        }
        ctx.fire_read(data);
    }
}

#[test]
fn inbound_flows_head_to_tail_and_outbound_tail_to_head() {
    let journal = Journal::default();
    let harness = Harness::with_handlers(ScriptedTransport::stream(7), |pipeline| {
        pipeline.add_last(Tag::install("codec", &journal));
        pipeline.add_last(Tag::install("app", &journal));
    });
    assert_eq!(
        harness.channel.pipeline().map(|pipeline| pipeline.names()),
        Some(vec![
            "recorder".to_owned(),
            "codec".to_owned(),
            "app".to_owned()
        ])
    );

    harness.with_ctx(|ctx| ctx.fire_read(Bytes::from_static(b"ping")));
    let write = harness.channel.write(Bytes::from_static(b"pong"));
    harness.run();

    assert_eq!(write.try_get(), Some(Ok(())));
    assert_eq!(
        *journal.lock(),
        vec!["codec:read", "app:read", "app:write", "codec:write"]
    );
}

#[test]
fn errors_before_connect_travel_the_whole_chain() {
    let journal = Journal::default();
    let harness = Harness::with_handlers(ScriptedTransport::stream(7), |pipeline| {
        pipeline.add_last(Tag::install("tls", &journal));
    });

    let failure = ChannelError::Handshake("peer aborted".into());
    harness.with_ctx(|ctx| {
        ctx.set_connecting();
        ctx.fire_error(failure.clone());
    });

    assert_eq!(harness.recorder.count(&ChannelEvent::Error(failure)), 1);
    assert_eq!(*journal.lock(), vec!["tls:error"]);
}

#[test]
fn handler_can_swallow_writes() {
    let harness = Harness::with_handlers(ScriptedTransport::stream(7), |pipeline| {
        pipeline.add_last(Arc::new(Swallow));
    });

    let write = harness.channel.write(Bytes::from_static(b"dropped"));
    harness.run();

    assert_eq!(write.try_get(), Some(Ok(())));
    assert_eq!(harness.transport().count(TransportOp::Write), 0);
    assert!(harness.channel.snapshot().write.is_empty());
}

#[test]
fn handler_can_rewrite_outbound_data() {
    let harness = Harness::with_handlers(ScriptedTransport::stream(7), |pipeline| {
        pipeline.add_last(Arc::new(Framer));
    });

    harness.channel.write(Bytes::from_static(b"REGISTER"));
    harness.run();

    assert_eq!(
        harness.transport().written(),
        vec![(None, Bytes::from_static(b"[REGISTER]"))]
    );
}

#[test]
fn handlers_added_at_runtime_skip_the_added_hook() {
    let harness = Harness::stream();
    let late = RecordingHandler::new("late");
    let pipeline = harness.channel.pipeline().expect("pipeline");
    let handler: Arc<dyn ChannelHandler> = late.clone();
    pipeline.add_first(handler);

    assert_eq!(pipeline.names(), vec!["late".to_owned(), "recorder".to_owned()]);
    assert!(late.events().is_empty());

    harness.with_ctx(|ctx| ctx.fire_read(Bytes::from_static(b"hello")));
    assert_eq!(
        late.events(),
        vec![ChannelEvent::Read(Bytes::from_static(b"hello"))]
    );
    assert_eq!(
        harness.recorder.count(&ChannelEvent::Read(Bytes::from_static(b"hello"))),
        1
    );

    harness.channel.close();
    harness.run();
    assert_eq!(late.count(&ChannelEvent::Removed), 1);
}

#[test]
fn close_from_inside_read_callback_completes_inline() {
    let journal = Journal::default();
    let harness = Harness::with_handlers(ScriptedTransport::stream(7), |pipeline| {
        pipeline.add_last(Tag::install("session", &journal));
        pipeline.add_last(Arc::new(HangUp));
    });
    harness.connect();

    harness.with_ctx(|ctx| {
        ctx.fire_read(Bytes::from_static(b"INFO"));
        ctx.fire_read(Bytes::from_static(b"BYE"));
    });

    assert_eq!(harness.channel.snapshot().close, ClosePhase::Closed);
    assert!(harness.channel.pipeline().is_none());
    assert_eq!(harness.transport().count(TransportOp::Close), 1);
    assert_eq!(harness.recorder.count(&ChannelEvent::Closed), 1);
    assert_eq!(
        *journal.lock(),
        vec!["session:read", "session:read", "session:close"]
    );
}
