use std::{
    io,
    sync::{Arc, Barrier, atomic::Ordering},
    thread,
};

use bytes::Bytes;
use spark_channel::{
    ChannelError, ClosePhase, Direction, OpPromise, ReadFlags, WriteFlags,
    test_stubs::{ChannelEvent, ScriptedTransport, TransportOp},
};

use super::support::{Harness, count_completions};

fn half_close(harness: &Harness, direction: Direction) -> OpPromise {
    match direction {
        Direction::Read => harness.channel.close_read(),
        Direction::Write => harness.channel.close_write(),
    }
}

#[test]
fn dual_half_close_converges_into_one_full_close() {
    for order in [
        [Direction::Read, Direction::Write],
        [Direction::Write, Direction::Read],
    ] {
        let harness = Harness::stream();
        let close_promise = harness.channel.close_promise().expect("close promise");
        let fulfilled = count_completions(&close_promise);

        let first = half_close(&harness, order[0]);
        let second = half_close(&harness, order[1]);
        harness.run();

        assert_eq!(first.try_get(), Some(Ok(())), "{order:?}");
        assert_eq!(second.try_get(), Some(Ok(())), "{order:?}");
        assert_eq!(fulfilled.load(Ordering::SeqCst), 1, "{order:?}");
        assert_eq!(harness.recorder.count(&ChannelEvent::Closed), 1, "{order:?}");
        assert_eq!(harness.recorder.count(&ChannelEvent::ReadClosed), 1);
        assert_eq!(harness.recorder.count(&ChannelEvent::WriteClosed), 1);
        assert_eq!(harness.transport().count(TransportOp::Close), 1);
        assert!(harness.channel.pipeline().is_none());
    }
}

#[test]
fn concurrent_close_invokes_transport_once() {
    let harness = Harness::stream();
    let barrier = Arc::new(Barrier::new(2));
    let submitters: Vec<_> = (0..2)
        .map(|_| {
            let channel = Arc::clone(&harness.channel);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                channel.close()
            })
        })
        .collect();
    let promises: Vec<OpPromise> = submitters
        .into_iter()
        .map(|submitter| submitter.join().expect("submitter thread"))
        .collect();

    harness.run();

    assert_eq!(harness.transport().count(TransportOp::Close), 1);
    assert_eq!(harness.recorder.count(&ChannelEvent::Closed), 1);
    for promise in promises {
        let result = promise.try_get().expect("close promise resolved");
        assert!(
            matches!(result, Ok(()) | Err(ChannelError::Closed)),
            "unexpected close result {result:?}"
        );
    }
}

#[test]
fn close_while_closing_shares_the_close_code() {
    let harness =
        Harness::with_transport(ScriptedTransport::stream(7).defer(TransportOp::Close));
    let first = harness.channel.close();
    harness.run();
    assert_eq!(harness.channel.snapshot().close, ClosePhase::Closing);

    let second = harness.channel.close();
    let read = harness.channel.close_read();
    harness.run();
    assert!(!second.is_done());
    assert!(!read.is_done());

    let code = Err(ChannelError::io(
        "close",
        io::Error::from(io::ErrorKind::ConnectionReset),
    ));
    assert!(harness.transport().complete_next(TransportOp::Close, code.clone()));

    assert_eq!(first.try_get(), Some(code.clone()));
    assert_eq!(second.try_get(), Some(code.clone()));
    assert_eq!(read.try_get(), Some(code));
    assert_eq!(harness.transport().count(TransportOp::Close), 1);
    assert_eq!(harness.recorder.count(&ChannelEvent::Closed), 1);
    assert_eq!(harness.recorder.count(&ChannelEvent::ReadClosed), 1);
    assert!(harness.channel.pipeline().is_none());
}

#[test]
fn repeated_half_close_fires_event_once() {
    let harness = Harness::stream();
    let promises: Vec<OpPromise> = (0..3).map(|_| harness.channel.close_read()).collect();
    harness.run();

    for promise in promises {
        assert_eq!(promise.try_get(), Some(Ok(())));
    }
    assert_eq!(harness.recorder.count(&ChannelEvent::ReadClosed), 1);
    assert_eq!(harness.transport().count(TransportOp::CloseRead), 1);
    assert_eq!(harness.recorder.count(&ChannelEvent::Closed), 0);
    assert_eq!(harness.channel.snapshot().close, ClosePhase::Open);
}

#[test]
fn half_close_in_flight_is_shared_by_later_callers() {
    let harness =
        Harness::with_transport(ScriptedTransport::stream(7).defer(TransportOp::CloseWrite));
    let first = harness.channel.close_write();
    let second = harness.channel.close_write();
    harness.run();

    assert!(harness
        .channel
        .snapshot()
        .write
        .contains(WriteFlags::SHUTTING_DOWN));
    assert_eq!(harness.transport().count(TransportOp::CloseWrite), 1);
    assert!(!first.is_done() && !second.is_done());

    assert!(harness.transport().complete_next(TransportOp::CloseWrite, Ok(())));
    assert_eq!(first.try_get(), Some(Ok(())));
    assert_eq!(second.try_get(), Some(Ok(())));
    assert_eq!(harness.recorder.count(&ChannelEvent::WriteClosed), 1);
    let write = harness.channel.snapshot().write;
    assert!(write.contains(WriteFlags::SHUTDOWN));
    assert!(!write.contains(WriteFlags::SHUTTING_DOWN));
}

#[test]
fn failed_half_close_sets_error_without_event() {
    let harness = Harness::stream();
    let error = ChannelError::io("shutdown", io::Error::from(io::ErrorKind::NotConnected));
    harness
        .transport()
        .fail_next(TransportOp::CloseRead, error.clone());

    let promise = harness.channel.close_read();
    harness.run();

    assert_eq!(promise.try_get(), Some(Err(error.clone())));
    let read = harness.channel.snapshot().read;
    assert!(read.contains(ReadFlags::ERROR));
    assert!(!read.intersects(ReadFlags::SHUTTING_DOWN | ReadFlags::SHUTDOWN));
    assert_eq!(harness.recorder.count(&ChannelEvent::ReadClosed), 0);
    assert_eq!(harness.channel.last_error(), Some(error));
}

#[test]
fn write_error_then_half_closes_close_the_channel_implicitly() {
    let harness = Harness::stream();
    harness.connect();
    let broken = ChannelError::io("write", io::Error::from(io::ErrorKind::BrokenPipe));
    harness
        .transport()
        .fail_next(TransportOp::Write, broken.clone());

    let failed = harness.channel.write(Bytes::from_static(b"payload"));
    harness.run();
    assert_eq!(failed.try_get(), Some(Err(broken.clone())));
    assert!(harness.channel.snapshot().write.contains(WriteFlags::ERROR));
    assert_eq!(harness.channel.snapshot().close, ClosePhase::Open);

    let rejected = harness.channel.write(Bytes::from_static(b"again"));
    harness.run();
    assert_eq!(rejected.try_get(), Some(Err(broken)));
    assert_eq!(harness.transport().count(TransportOp::Write), 1);

    let close_write = harness.channel.close_write();
    harness.run();
    assert_eq!(close_write.try_get(), Some(Ok(())));
    assert_eq!(harness.transport().count(TransportOp::Close), 0);

    harness.with_ctx(|ctx| {
        ctx.fin_received();
        ctx.channel().close_read();
    });
    harness.run();

    assert_eq!(harness.transport().count(TransportOp::Close), 1);
    assert_eq!(harness.recorder.count(&ChannelEvent::Closed), 1);
    assert_eq!(
        harness.recorder.events(),
        vec![
            ChannelEvent::Added,
            ChannelEvent::Connected,
            ChannelEvent::WriteClosed,
            ChannelEvent::ReadClosed,
            ChannelEvent::Closed,
            ChannelEvent::Removed,
        ]
    );
}

#[test]
fn close_requested_while_writing_waits_for_the_write() {
    let harness =
        Harness::with_transport(ScriptedTransport::stream(7).defer(TransportOp::Write));
    let write = harness.channel.write(Bytes::from_static(b"last words"));
    let close = harness.channel.close();
    harness.run();

    assert_eq!(harness.channel.snapshot().close, ClosePhase::ClosePending);
    assert!(harness.channel.snapshot().write.contains(WriteFlags::WRITING));
    assert_eq!(harness.transport().count(TransportOp::Close), 0);

    let late = harness.channel.write(Bytes::from_static(b"too late"));
    harness.run();
    assert_eq!(late.try_get(), Some(Err(ChannelError::Closed)));

    assert!(harness.transport().complete_next(TransportOp::Write, Ok(())));
    assert_eq!(write.try_get(), Some(Ok(())));
    assert_eq!(close.try_get(), Some(Ok(())));
    assert_eq!(harness.transport().count(TransportOp::Close), 1);
    assert!(harness.channel.pipeline().is_none());
}

#[test]
fn write_shutdown_waits_for_in_flight_writes() {
    let harness =
        Harness::with_transport(ScriptedTransport::stream(7).defer(TransportOp::Write));
    let first = harness.channel.write(Bytes::from_static(b"a"));
    let second = harness.channel.write(Bytes::from_static(b"b"));
    let shutdown = harness.channel.close_write();
    harness.run();

    assert!(harness
        .channel
        .snapshot()
        .write
        .contains(WriteFlags::SHUTDOWN_PENDING | WriteFlags::WRITING));
    assert_eq!(harness.transport().count(TransportOp::CloseWrite), 0);

    assert!(harness.transport().complete_next(TransportOp::Write, Ok(())));
    assert_eq!(harness.transport().count(TransportOp::CloseWrite), 0);
    assert!(harness.transport().complete_next(TransportOp::Write, Ok(())));

    assert_eq!(first.try_get(), Some(Ok(())));
    assert_eq!(second.try_get(), Some(Ok(())));
    assert_eq!(shutdown.try_get(), Some(Ok(())));
    assert_eq!(harness.transport().count(TransportOp::CloseWrite), 1);
    let write = harness.channel.snapshot().write;
    assert!(write.contains(WriteFlags::SHUTDOWN));
    assert!(!write.intersects(WriteFlags::SHUTDOWN_PENDING | WriteFlags::WRITING));
}

#[test]
fn write_after_write_shutdown_is_rejected() {
    let harness = Harness::stream();
    harness.channel.close_write();
    harness.run();

    let write = harness.channel.write(Bytes::from_static(b"x"));
    harness.run();

    assert_eq!(write.try_get(), Some(Err(ChannelError::WriteShutdown)));
    assert_eq!(harness.transport().count(TransportOp::Write), 0);
}

#[test]
fn failed_close_still_reports_closed() {
    let harness = Harness::stream();
    let reset = ChannelError::io("close", io::Error::from(io::ErrorKind::ConnectionReset));
    harness.transport().fail_next(TransportOp::Close, reset.clone());
    let close_promise = harness.channel.close_promise().expect("close promise");

    let close = harness.channel.close();
    harness.run();

    assert_eq!(close.try_get(), Some(Err(reset.clone())));
    assert_eq!(close_promise.try_get(), Some(Err(reset)));
    assert_eq!(harness.recorder.count(&ChannelEvent::Closed), 1);
    assert!(harness.channel.pipeline().is_none());
}
