use std::{sync::Arc, thread};

use bytes::Bytes;
use spark_channel::{
    ChannelError, ChannelHandler, ChannelInitializer, ChannelPipeline, ClosePhase, FiredEvents,
    ReadFlags, WriteFlags,
    test_stubs::{ChannelEvent, RecordingHandler, ScriptedTransport, TransportOp},
};

use super::support::Harness;

#[test]
fn init_opens_channel_with_pipeline_and_close_promise() {
    let harness = Harness::stream();
    let snapshot = harness.channel.snapshot();

    assert_eq!(snapshot.close, ClosePhase::Open);
    assert!(!snapshot.read.intersects(ReadFlags::SHUTTING_DOWN | ReadFlags::SHUTDOWN));
    assert!(!snapshot.write.intersects(WriteFlags::SHUTTING_DOWN | WriteFlags::SHUTDOWN));
    assert!(snapshot.fired.is_empty());

    let pipeline = harness.channel.pipeline().expect("pipeline after init");
    assert!(pipeline.is_live());
    assert_eq!(pipeline.names(), vec!["recorder".to_owned()]);
    assert!(harness.channel.close_promise().is_some());
    assert_eq!(harness.recorder.events(), vec![ChannelEvent::Added]);
}

#[test]
fn fulfilled_close_promise_releases_pipeline_and_rejects_later_operations() {
    let harness = Harness::stream();
    let close_promise = harness.channel.close_promise().expect("close promise");

    let closing = harness.channel.close();
    harness.run();

    assert_eq!(closing.try_get(), Some(Ok(())));
    assert_eq!(close_promise.try_get(), Some(Ok(())));
    assert!(harness.channel.pipeline().is_none());
    assert!(harness.channel.close_promise().is_none());
    assert_eq!(harness.channel.snapshot().close, ClosePhase::Closed);

    let write = harness.channel.write(Bytes::from_static(b"late"));
    let write_to = harness
        .channel
        .write_to(Bytes::from_static(b"late"), super::support::peer());
    let close_read = harness.channel.close_read();
    let close_write = harness.channel.close_write();
    let close_again = harness.channel.close();
    harness.run();

    for promise in [write, write_to, close_read, close_write, close_again] {
        assert_eq!(promise.try_get(), Some(Err(ChannelError::Closed)));
    }
    assert_eq!(harness.transport().count(TransportOp::Write), 0);
    assert_eq!(harness.transport().count(TransportOp::Close), 1);
}

#[test]
fn teardown_happens_before_close_observers_run() {
    let harness = Harness::stream();
    let close_promise = harness.channel.close_promise().expect("close promise");
    let channel = Arc::downgrade(&harness.channel);
    let seen = Arc::new(parking_lot::Mutex::new(None));
    let slot = Arc::clone(&seen);
    close_promise.if_done(move |_| {
        let pipeline_present = channel
            .upgrade()
            .map(|channel| channel.pipeline().is_some());
        *slot.lock() = pipeline_present;
    });

    harness.channel.close();
    harness.run();

    assert_eq!(*seen.lock(), Some(false));
    assert_eq!(
        harness.recorder.events(),
        vec![
            ChannelEvent::Added,
            ChannelEvent::ReadClosed,
            ChannelEvent::WriteClosed,
            ChannelEvent::Closed,
            ChannelEvent::Removed,
        ]
    );
}

#[test]
fn channel_can_be_reinitialized_after_full_close() {
    let harness = Harness::stream();
    harness.channel.close();
    harness.run();

    let recorder = RecordingHandler::new("second");
    let handler: Arc<dyn ChannelHandler> = recorder.clone();
    harness
        .channel
        .init(&harness.event_loop.token(), move |pipeline| {
            pipeline.add_last(handler)
        });

    let snapshot = harness.channel.snapshot();
    assert_eq!(snapshot.close, ClosePhase::Open);
    assert!(!snapshot.fired.contains(FiredEvents::CLOSED));

    harness.channel.close_read();
    harness.channel.close_write();
    harness.run();

    assert_eq!(recorder.count(&ChannelEvent::Closed), 1);
    assert_eq!(harness.recorder.count(&ChannelEvent::Closed), 1);
    assert_eq!(harness.transport().count(TransportOp::Close), 2);
}

#[test]
fn late_half_close_completion_stays_in_its_own_incarnation() {
    let harness =
        Harness::with_transport(ScriptedTransport::stream(7).defer(TransportOp::CloseRead));
    let close_read = harness.channel.close_read();
    harness.run();
    harness.channel.close();
    harness.run();
    assert!(harness.channel.pipeline().is_none());
    assert_eq!(close_read.try_get(), Some(Ok(())));

    let recorder = RecordingHandler::new("second");
    let handler: Arc<dyn ChannelHandler> = recorder.clone();
    let initializer: ChannelInitializer =
        Box::new(move |pipeline: &ChannelPipeline| pipeline.add_last(handler));
    harness.channel.init(&harness.event_loop.token(), initializer);

    assert!(
        harness
            .transport()
            .complete_next(TransportOp::CloseRead, Ok(()))
    );
    harness.run();

    let snapshot = harness.channel.snapshot();
    assert_eq!(recorder.events(), vec![ChannelEvent::Added]);
    assert!(snapshot.read.is_empty());
    assert!(snapshot.fired.is_empty());
    assert_eq!(snapshot.close, ClosePhase::Open);

    // 新一轮只关闭写方向，不应被旧的读半关闭凑成自动关闭。
    let close_write = harness.channel.close_write();
    harness.run();
    assert_eq!(close_write.try_get(), Some(Ok(())));
    assert_eq!(harness.channel.snapshot().close, ClosePhase::Open);
    assert_eq!(
        recorder.events(),
        vec![ChannelEvent::Added, ChannelEvent::WriteClosed]
    );
    assert_eq!(harness.transport().count(TransportOp::Close), 1);
}

#[test]
#[should_panic(expected = "not closed")]
fn init_twice_is_a_contract_violation() {
    let harness = Harness::stream();
    harness
        .channel
        .init(&harness.event_loop.token(), |_| {});
}

#[test]
fn operations_from_foreign_threads_run_on_the_loop() {
    let harness = Harness::stream();
    let channel = Arc::clone(&harness.channel);
    let promise = thread::spawn(move || channel.write(Bytes::from_static(b"remote")))
        .join()
        .expect("submitter thread");

    assert!(!promise.is_done());
    assert_eq!(harness.transport().count(TransportOp::Write), 0);

    harness.run();
    assert_eq!(futures::executor::block_on(promise), Ok(()));
    assert_eq!(
        harness.transport().written(),
        vec![(None, Bytes::from_static(b"remote"))]
    );
}

#[test]
fn single_submitter_order_is_preserved() {
    let harness = Harness::stream();
    for chunk in [&b"one"[..], b"two", b"three"] {
        harness.channel.write(Bytes::copy_from_slice(chunk));
    }
    harness.run();

    let written: Vec<Bytes> = harness
        .transport()
        .written()
        .into_iter()
        .map(|(_, data)| data)
        .collect();
    assert_eq!(
        written,
        vec![
            Bytes::from_static(b"one"),
            Bytes::from_static(b"two"),
            Bytes::from_static(b"three"),
        ]
    );
}

#[test]
fn terminated_loop_resolves_promises_immediately() {
    let harness = Harness::stream();
    harness.event_loop.terminate();

    let write = harness.channel.write(Bytes::from_static(b"x"));
    let close = harness.channel.close();

    assert_eq!(write.try_get(), Some(Err(ChannelError::LoopTerminated)));
    assert_eq!(close.try_get(), Some(Err(ChannelError::LoopTerminated)));
}

#[test]
fn close_finishing_after_loop_termination_detaches_pipeline() {
    let harness =
        Harness::with_transport(ScriptedTransport::stream(7).defer(TransportOp::Close));
    let closing = harness.channel.close();
    harness.run();
    assert_eq!(harness.transport().pending(TransportOp::Close), 1);

    harness.event_loop.terminate();
    let channel = Arc::clone(&harness.channel);
    thread::spawn(move || {
        channel
            .transport()
            .complete_next(TransportOp::Close, Ok(()))
    })
    .join()
    .expect("completer thread");

    assert_eq!(closing.try_get(), Some(Err(ChannelError::LoopTerminated)));
    assert!(harness.channel.pipeline().is_none());
    assert!(harness.channel.close_promise().is_none());
    assert_eq!(harness.recorder.count(&ChannelEvent::Removed), 0);
    assert_eq!(Arc::strong_count(&harness.recorder), 1);
}

#[test]
fn context_attachment_round_trips_by_type() {
    let harness = Harness::stream();
    assert!(harness.channel.set_ctx(Arc::new(42u32)).is_none());

    assert_eq!(harness.channel.ctx::<u32>().as_deref(), Some(&42));
    assert!(harness.channel.ctx::<String>().is_none());

    let previous = harness.channel.set_ctx(Arc::new(String::from("session")));
    assert!(previous.is_some());
    assert_eq!(
        harness.channel.ctx::<String>().as_deref().map(String::as_str),
        Some("session")
    );
    assert!(harness.channel.take_ctx().is_some());
    assert!(harness.channel.ctx::<String>().is_none());
}

#[test]
fn role_and_listener_queries_follow_transport_marks() {
    let harness = Harness::stream();
    assert!(harness.channel.is_passive());
    assert!(!harness.channel.is_listener());

    harness.with_ctx(|ctx| ctx.set_active());
    assert!(harness.channel.is_active());

    let listener = Harness::stream();
    listener.with_ctx(|ctx| ctx.set_listening());
    assert!(listener.channel.is_listener());
    assert!(listener.channel.is_passive());
}
