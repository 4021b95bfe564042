//! Integration tests for reconnection, replay and session resumption.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use common::{
    connected, count_op, fast_config, next_event, test_feed, test_feed_with, wait_for_ops,
};
use market_stream::application::services::listener;
use market_stream::infrastructure::feed::ClientFrame;
use market_stream::{
    ConnectionStatus, EventKind, FeedEvent, FileSessionStore, Interval, MemorySessionStore,
    SessionStore,
};
use parking_lot::Mutex;

#[tokio::test]
async fn dropped_link_replays_each_active_key_before_connected() {
    let mut t = test_feed();
    let _one = t.feed.kline_consumer("SOL", Interval::OneMinute);
    let _five = t.feed.kline_consumer("SOL", Interval::FiveMinutes);
    let _trades = t.feed.trade_consumer("BONK");

    t.feed.connect();
    let first = connected(&mut t.events).await;
    assert!(matches!(first, FeedEvent::Connected { replayed: 3, .. }));
    wait_for_ops(&t.server, "subscribe", 3).await;

    t.server.clear_frames();
    let at_connected = Arc::new(Mutex::new(None));
    let server = t.server.clone();
    let seen = Arc::clone(&at_connected);
    t.feed.bus().on(
        EventKind::Connected,
        listener(move |_| {
            *seen.lock() = Some(count_op(&server.frames(), "subscribe"));
        }),
    );

    t.server.drop_connection();
    next_event(&mut t.events, |e| matches!(e, FeedEvent::Reconnecting { .. })).await;
    let second = connected(&mut t.events).await;

    assert!(matches!(second, FeedEvent::Connected { replayed: 3, .. }));
    assert_eq!(*at_connected.lock(), Some(3));
    assert_eq!(count_op(&t.server.frames(), "subscribe"), 3);
    assert_eq!(t.server.connections(), 2);
}

#[tokio::test]
async fn disconnect_preserves_registry_for_next_connect() {
    let mut t = test_feed();
    let _candles = t.feed.kline_consumer("SOL", Interval::OneMinute);
    t.feed.connect();
    connected(&mut t.events).await;

    t.feed.disconnect();
    next_event(&mut t.events, |e| matches!(e, FeedEvent::Disconnected)).await;

    let diagnostics = t.feed.diagnostics();
    assert_eq!(diagnostics.status, ConnectionStatus::Disconnected);
    assert!(!diagnostics.link_up);
    assert_eq!(diagnostics.subscriptions, vec!["SOL:kline:1m".to_string()]);
    assert_eq!(count_op(&t.server.frames(), "unsubscribe"), 0);

    assert!(t.feed.connect());
    let event = connected(&mut t.events).await;
    assert!(matches!(event, FeedEvent::Connected { replayed: 1, .. }));
    wait_for_ops(&t.server, "subscribe", 2).await;
}

#[tokio::test]
async fn subscriptions_made_while_down_are_sent_once_on_connect() {
    let mut t = test_feed();
    let _first = t.feed.trade_consumer("SOL");
    let _second = t.feed.trade_consumer("SOL");
    assert!(t.server.frames().is_empty());

    t.feed.connect();
    let event = connected(&mut t.events).await;

    assert!(matches!(event, FeedEvent::Connected { replayed: 1, .. }));
    wait_for_ops(&t.server, "subscribe", 1).await;
}

#[tokio::test]
async fn session_id_is_resumed_by_a_new_feed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");

    let mut first = test_feed_with(fast_config(), Arc::new(FileSessionStore::new(&path)));
    first.feed.connect();
    let FeedEvent::Connected { connection_id, .. } = connected(&mut first.events).await else {
        unreachable!()
    };
    first.feed.disconnect();
    assert_eq!(
        FileSessionStore::new(&path).load().as_deref(),
        Some(connection_id.as_str())
    );

    let mut second = test_feed_with(fast_config(), Arc::new(FileSessionStore::new(&path)));
    second.feed.connect();
    let resumed = connected(&mut second.events).await;

    assert_eq!(
        second.server.frames().first(),
        Some(&ClientFrame::Hello {
            connection_id: Some(connection_id.clone())
        })
    );
    assert!(matches!(
        resumed,
        FeedEvent::Connected { connection_id: ref id, .. } if *id == connection_id
    ));
}

#[tokio::test]
async fn exhausted_retries_surface_as_error_status() {
    let mut config = fast_config();
    config.reconnect.max_attempts = 2;
    let mut t = test_feed_with(config, Arc::new(MemorySessionStore::new()));
    let status = t.feed.status_consumer();

    t.server.refuse_all(true);
    t.feed.connect();
    next_event(&mut t.events, |e| matches!(e, FeedEvent::ConnectionError { .. })).await;

    assert_eq!(status.status(), ConnectionStatus::Error);
    assert!(!status.is_connected());
    assert!(t.feed.state().last_error.is_some());

    // An explicit connect starts over.
    t.server.refuse_all(false);
    assert!(t.feed.connect());
    connected(&mut t.events).await;
    assert!(status.is_connected());
    assert_eq!(t.server.connections(), 1);
}
