//! Shared fixtures for the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use market_stream::infrastructure::feed::{ClientFrame, HeartbeatConfig, ReconnectConfig};
use market_stream::{
    ConnectionConfig, EventKind, EventStream, FeedEvent, LoopbackConnector, LoopbackServer,
    MarketFeed, MemorySessionStore, RouteSettings, SessionStore,
};

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(2);

/// A feed on a loopback transport plus a recorder of every bus event.
pub struct TestFeed {
    pub feed: MarketFeed,
    pub server: LoopbackServer,
    pub events: EventStream,
}

pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        heartbeat: HeartbeatConfig::new(Duration::from_secs(3600), Duration::from_secs(5)),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 5,
        },
        handshake_timeout: Duration::from_millis(500),
    }
}

pub fn test_feed() -> TestFeed {
    test_feed_with(fast_config(), Arc::new(MemorySessionStore::new()))
}

pub fn test_feed_with(config: ConnectionConfig, session: Arc<dyn SessionStore>) -> TestFeed {
    let (connector, server) = LoopbackConnector::new();
    let feed = MarketFeed::new(Arc::new(connector), session, config, RouteSettings::default());
    let events = feed.events(EventKind::all());
    TestFeed {
        feed,
        server,
        events,
    }
}

/// Wait for the next event matching `predicate`, skipping others.
pub async fn next_event(
    events: &mut EventStream,
    predicate: impl Fn(&FeedEvent) -> bool,
) -> FeedEvent {
    tokio::time::timeout(WAIT, async {
        while let Some(event) = events.next().await {
            if predicate(&event) {
                return event;
            }
        }
        panic!("event stream ended");
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn connected(events: &mut EventStream) -> FeedEvent {
    next_event(events, |e| matches!(e, FeedEvent::Connected { .. })).await
}

/// Number of recorded frames with operation `op`.
pub fn count_op(frames: &[ClientFrame], op: &str) -> usize {
    frames.iter().filter(|f| f.op() == op).count()
}

/// Wait until exactly `count` frames with operation `op` have been sent.
pub async fn wait_for_ops(server: &LoopbackServer, op: &str, count: usize) {
    assert!(
        server.wait_for(WAIT, |frames| count_op(frames, op) >= count).await,
        "expected {count} {op} frames, saw {:?}",
        server.frames()
    );
    assert_eq!(count_op(&server.frames(), op), count, "too many {op} frames");
}

pub fn kline_json(token: &str, interval: &str, timestamp: i64, close: &str) -> String {
    format!(
        r#"{{"type":"kline_update","token":"{token}","interval":"{interval}","data":{{"timestamp":{timestamp},"open":"1.0","high":"2.0","low":"0.5","close":"{close}","volume":"10"}}}}"#
    )
}

pub fn trade_json(token: &str, trade_id: &str, timestamp: i64, price: &str) -> String {
    format!(
        r#"{{"type":"trade_update","token":"{token}","data":{{"price":"{price}","quantity":"1","timestamp":{timestamp},"isBuyerMaker":false,"tradeId":"{trade_id}"}}}}"#
    )
}
