//! Async view of the event bus.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::application::services::event_bus::{EventBus, EventKind, FeedEvent, Listener, listener};

/// Stream of bus events of the requested kinds.
///
/// Listeners are registered on creation and removed when the stream is
/// dropped.
pub struct EventStream {
    bus: Arc<EventBus>,
    registrations: Vec<(EventKind, Listener)>,
    inner: UnboundedReceiverStream<FeedEvent>,
}

impl EventStream {
    /// Register on `bus` for each of `kinds`.
    #[must_use]
    pub fn new(bus: Arc<EventBus>, kinds: &[EventKind]) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let registrations = kinds
            .iter()
            .map(|&kind| {
                let tx = tx.clone();
                let forward = listener(move |event| {
                    let _ = tx.send(event.clone());
                });
                bus.on(kind, Arc::clone(&forward));
                (kind, forward)
            })
            .collect();

        Self {
            bus,
            registrations,
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<&str> = self.registrations.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("EventStream").field("kinds", &kinds).finish()
    }
}

impl Stream for EventStream {
    type Item = FeedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        for (kind, forward) in self.registrations.drain(..) {
            self.bus.off(kind, &forward);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn yields_requested_kinds_only() {
        let bus = Arc::new(EventBus::new());
        let mut events = EventStream::new(Arc::clone(&bus), &[EventKind::Latency]);

        bus.emit(&FeedEvent::Disconnected);
        bus.emit(&FeedEvent::Latency { latency_ms: 7 });

        assert_eq!(
            events.next().await,
            Some(FeedEvent::Latency { latency_ms: 7 })
        );
    }

    #[test]
    fn drop_deregisters_listeners() {
        let bus = Arc::new(EventBus::new());
        let events = EventStream::new(Arc::clone(&bus), EventKind::all());
        assert_eq!(bus.event_names().len(), EventKind::all().len());

        drop(events);

        assert!(bus.event_names().is_empty());
    }
}
