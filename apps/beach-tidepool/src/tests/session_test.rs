use super::{data_of, drain, settle, Harness};
use crate::terminal::resize::ResizeIgnored;
use crate::terminal::session::CONNECTION_QUEUE_DEPTH;
use crate::terminal::{ResizeOutcome, SessionEvent, SessionOptions};

#[test_timeout::tokio_timeout_test(paused)]
async fn five_thousand_chars_arrive_in_two_flushes() {
    let harness = Harness::new();
    let session = harness.registry.create(SessionOptions::default()).unwrap();
    let mut viewer = session.attach(CONNECTION_QUEUE_DEPTH).unwrap();
    assert!(viewer.scrollback.is_empty());

    let chunk: String = (0..5000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    harness.process().emit(&chunk);
    settle(50).await;

    let batches = data_of(&drain(&mut viewer.events));
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].len(), 4096);
    assert_eq!(batches[1].len(), 904);
    assert_eq!(batches.concat(), chunk);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn output_after_bind_arrives_as_data_not_scrollback() {
    let harness = Harness::new();
    let session = harness.registry.create(SessionOptions::default()).unwrap();
    harness.process().emit("$ ");
    settle(20).await;

    let mut viewer = session.attach(CONNECTION_QUEUE_DEPTH).unwrap();
    assert_eq!(viewer.scrollback, "$ ");

    harness.process().emit("0123456789");
    settle(20).await;
    assert_eq!(
        drain(&mut viewer.events),
        vec![SessionEvent::Data("0123456789".into())]
    );
}

#[test_timeout::tokio_timeout_test(paused)]
async fn pending_output_is_never_duplicated_to_a_new_viewer() {
    let harness = Harness::new();
    let session = harness.registry.create(SessionOptions::default()).unwrap();
    let mut early = session.attach(CONNECTION_QUEUE_DEPTH).unwrap();

    harness.process().emit("build ok\r\n");
    // Let the pump run, but bind before the 4ms flush fires.
    settle(1).await;
    let mut late = session.attach(CONNECTION_QUEUE_DEPTH).unwrap();
    assert_eq!(late.scrollback, "build ok\r\n");
    settle(20).await;

    assert!(drain(&mut late.events).is_empty());
    assert_eq!(data_of(&drain(&mut early.events)), vec!["build ok\r\n"]);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn reconnect_replays_scrollback_without_live_duplicates() {
    let harness = Harness::new();
    let session = harness.registry.create(SessionOptions::default()).unwrap();

    let first = session.attach(CONNECTION_QUEUE_DEPTH).unwrap();
    harness.process().emit("one");
    assert!(session.detach(first.subscriber));
    settle(20).await;

    let mut second = session.attach(CONNECTION_QUEUE_DEPTH).unwrap();
    assert_eq!(second.scrollback, "one");
    settle(20).await;
    assert!(drain(&mut second.events).is_empty());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn first_resize_is_applied_without_suppression() {
    let harness = Harness::new();
    let session = harness.registry.create(SessionOptions::default()).unwrap();

    assert_eq!(
        session.resize(120, 40, true),
        ResizeOutcome::Applied { suppressed: false }
    );
    assert!(!session.is_suppressing_output());
    assert_eq!(harness.process().journal().resizes, vec![(120, 40)]);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn duplicate_resize_applies_once_with_one_settle_cycle() {
    let harness = Harness::new();
    let session = harness.registry.create(SessionOptions::default()).unwrap();
    session.resize(80, 24, true);
    settle(200).await;

    assert_eq!(
        session.resize(100, 30, true),
        ResizeOutcome::Applied { suppressed: true }
    );
    assert_eq!(
        session.resize(100, 30, true),
        ResizeOutcome::Ignored(ResizeIgnored::RateLimited)
    );
    assert!(session.is_suppressing_output());

    settle(149).await;
    assert!(session.is_suppressing_output());
    settle(2).await;
    assert!(!session.is_suppressing_output());

    settle(200).await;
    assert_eq!(
        session.resize(100, 30, true),
        ResizeOutcome::Ignored(ResizeIgnored::Unchanged)
    );
    assert_eq!(harness.process().journal().resizes, vec![(80, 24), (100, 30)]);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn resize_storm_collapses_to_one_apply() {
    let harness = Harness::new();
    let session = harness.registry.create(SessionOptions::default()).unwrap();

    let applied = (0..10)
        .filter(|i| session.resize(80 + i, 24, true).is_applied())
        .count();
    assert_eq!(applied, 1);

    settle(100).await;
    assert!(session.resize(132, 43, true).is_applied());
    assert_eq!(harness.process().journal().resizes, vec![(80, 24), (132, 43)]);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn zero_columns_is_ignored_silently() {
    let harness = Harness::new();
    let session = harness.registry.create(SessionOptions::default()).unwrap();
    let mut viewer = session.attach(CONNECTION_QUEUE_DEPTH).unwrap();

    assert_eq!(
        session.resize(0, 24, true),
        ResizeOutcome::Ignored(ResizeIgnored::OutOfBounds)
    );
    settle(20).await;
    assert!(harness.process().journal().resizes.is_empty());
    assert!(drain(&mut viewer.events).is_empty());

    // Still counts as the first resize afterwards.
    assert_eq!(
        session.resize(80, 24, true),
        ResizeOutcome::Applied { suppressed: false }
    );
}

#[test_timeout::tokio_timeout_test(paused)]
async fn output_is_dropped_while_resize_settles() {
    let harness = Harness::new();
    let session = harness.registry.create(SessionOptions::default()).unwrap();
    let mut viewer = session.attach(CONNECTION_QUEUE_DEPTH).unwrap();
    session.resize(80, 24, true);
    settle(200).await;

    session.resize(100, 30, true);
    harness.process().emit("redrawn prompt$ ");
    settle(20).await;
    assert!(drain(&mut viewer.events).is_empty());

    settle(200).await;
    harness.process().emit("after");
    settle(20).await;
    assert_eq!(data_of(&drain(&mut viewer.events)), vec!["after"]);

    let replay = session.attach(CONNECTION_QUEUE_DEPTH).unwrap();
    assert_eq!(replay.scrollback, "after");
}

#[test_timeout::tokio_timeout_test(paused)]
async fn failed_resize_clears_suppression() {
    let harness = Harness::new();
    let session = harness.registry.create(SessionOptions::default()).unwrap();
    session.resize(80, 24, true);
    settle(200).await;

    harness.process().fail_resizes(true);
    assert_eq!(session.resize(100, 30, true), ResizeOutcome::Failed);
    assert!(!session.is_suppressing_output());

    harness.process().fail_resizes(false);
    assert!(session.resize(100, 30, true).is_applied());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn reconnecting_viewer_does_not_reset_first_resize() {
    let harness = Harness::new();
    let session = harness.registry.create(SessionOptions::default()).unwrap();

    let viewer = session.attach(CONNECTION_QUEUE_DEPTH).unwrap();
    session.resize(80, 24, true);
    session.detach(viewer.subscriber);
    settle(200).await;

    let _again = session.attach(CONNECTION_QUEUE_DEPTH).unwrap();
    assert_eq!(
        session.resize(90, 24, true),
        ResizeOutcome::Applied { suppressed: true }
    );
}

#[test_timeout::tokio_timeout_test(paused)]
async fn scrollback_stays_within_ceiling() {
    let harness = Harness::with(|config| config.settings.output.scrollback_limit = 64);
    let session = harness.registry.create(SessionOptions::default()).unwrap();

    let mut fed = String::new();
    for line in 0..40 {
        let text = format!("line {line}\r\n");
        fed.push_str(&text);
        harness.process().emit(&text);
    }
    settle(50).await;

    let viewer = session.attach(CONNECTION_QUEUE_DEPTH).unwrap();
    assert_eq!(viewer.scrollback.chars().count(), 64);
    assert!(fed.ends_with(&viewer.scrollback));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn write_reaches_the_process() {
    let harness = Harness::new();
    let session = harness.registry.create(SessionOptions::default()).unwrap();

    assert!(harness.registry.write(session.id(), b"ls -la\r"));
    assert!(!harness.registry.write("missing", b"ls\r"));
    assert_eq!(harness.process().journal().writes, vec![b"ls -la\r".to_vec()]);
}
