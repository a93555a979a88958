use bytes::Bytes;
use spark_channel::test_stubs::TransportOp;
use tracing_test::traced_test;

use super::support::Harness;

#[traced_test]
#[test]
fn lifecycle_transitions_are_logged() {
    let harness = Harness::stream();
    harness.channel.close();
    harness.run();

    assert!(logs_contain("channel initialized"));
    assert!(logs_contain("closing channel"));
    assert!(logs_contain("channel closed"));
    assert!(logs_contain("channel deinitialized"));
}

#[traced_test]
#[test]
fn failed_writes_are_logged_with_channel_id() {
    let harness = Harness::stream();
    harness.transport().fail_next(
        TransportOp::Write,
        spark_channel::ChannelError::io(
            "write",
            std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        ),
    );

    harness.channel.write(Bytes::from_static(b"x"));
    harness.run();

    assert!(logs_contain("write failed"));
    assert!(logs_contain("channel=7"));
}

#[traced_test]
#[test]
fn rejected_jobs_are_logged() {
    let harness = Harness::stream();
    harness.event_loop.terminate();

    harness.channel.close_read();

    assert!(logs_contain("event loop rejected job"));
}
