//! Task-spawning delivery dispatcher.
//!
//! The transport pushes [`Delivery`] values into an mpsc channel; the
//! dispatcher spawns one task per delivery. Messages carry no ordering
//! guarantee between each other, even for the same sensor.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::router::MessageRouter;
use crate::transport::Delivery;

/// Counters reported when the dispatcher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Deliveries handed to a task.
    pub dispatched: u64,
    /// Deliveries acknowledged after handling.
    pub acked: u64,
    /// Deliveries left unacknowledged (handler failure, ack failure or panic).
    pub unacked: u64,
}

impl DispatchStats {
    fn record(&mut self, result: Result<bool, JoinError>) {
        match result {
            Ok(true) => self.acked += 1,
            Ok(false) => self.unacked += 1,
            Err(e) => {
                error!(error = %e, "message task failed");
                self.unacked += 1;
            }
        }
    }
}

/// Spawns a routing task per delivery, optionally bounded.
pub struct Dispatcher {
    router: Arc<MessageRouter>,
    limit: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    /// `max_in_flight` bounds concurrently handled messages; `None` means
    /// unbounded.
    #[must_use]
    pub fn new(router: Arc<MessageRouter>, max_in_flight: Option<usize>) -> Self {
        Self {
            router,
            limit: max_in_flight.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// Dispatch until the channel closes or `cancel` fires.
    ///
    /// On stop, no new deliveries are accepted and in-flight tasks are
    /// awaited, never aborted.
    pub async fn run(&self, mut rx: mpsc::Receiver<Delivery>, cancel: CancellationToken) -> DispatchStats {
        let mut tasks = JoinSet::new();
        let mut stats = DispatchStats::default();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(result) = tasks.join_next(), if !tasks.is_empty() => stats.record(result),
                delivery = rx.recv() => {
                    let Some(delivery) = delivery else {
                        debug!("delivery channel closed");
                        break;
                    };

                    let permit = match &self.limit {
                        None => None,
                        Some(limit) => tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!(topic = %delivery.message.topic, "stopping before dispatch; delivery left unacknowledged");
                                break;
                            }
                            permit = Arc::clone(limit).acquire_owned() => match permit {
                                Ok(permit) => Some(permit),
                                Err(_) => break,
                            },
                        },
                    };

                    let router = Arc::clone(&self.router);
                    tasks.spawn(async move {
                        let _permit = permit;
                        router.handle(delivery).await
                    });
                    stats.dispatched += 1;
                }
            }
        }

        drop(rx);
        let draining = tasks.len();
        if draining > 0 {
            info!(in_flight = draining, "waiting for in-flight messages");
        }
        while let Some(result) = tasks.join_next().await {
            stats.record(result);
        }

        info!(
            dispatched = stats.dispatched,
            acked = stats.acked,
            unacked = stats.unacked,
            "dispatcher stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::cache::InactiveEntityCache;
    use crate::error::TransportError;
    use crate::schema::TopicSchemaRegistry;
    use crate::store::InMemorySensorStore;
    use crate::transport::{Acknowledge, InboundMessage};

    struct CountingAck(Arc<AtomicUsize>);

    #[async_trait]
    impl Acknowledge for CountingAck {
        async fn ack(self: Box<Self>) -> Result<(), TransportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn router() -> Arc<MessageRouter> {
        let registry = TopicSchemaRegistry::from_template_list("test/<sensorId>/<metadataName>").unwrap();
        let cache = Arc::new(InactiveEntityCache::default());
        cache.load(Vec::new());
        Arc::new(MessageRouter::new(
            Arc::new(registry),
            cache,
            Arc::new(InMemorySensorStore::new()),
        ))
    }

    #[tokio::test]
    async fn test_dispatch_until_channel_closes() {
        let acks = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(16);
        for i in 0..10 {
            let message = InboundMessage::new(format!("test/{i}/name"), b"n".to_vec());
            tx.send(Delivery::new(message, Box::new(CountingAck(Arc::clone(&acks)))))
                .await
                .unwrap();
        }
        drop(tx);

        let dispatcher = Dispatcher::new(router(), None);
        let stats = dispatcher.run(rx, CancellationToken::new()).await;

        assert_eq!(stats.dispatched, 10);
        assert_eq!(stats.acked, 10);
        assert_eq!(stats.unacked, 0);
        assert_eq!(acks.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_bounded_dispatch_handles_everything() {
        let acks = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(64);
        for i in 0..50 {
            let message = InboundMessage::new(format!("test/s{}/name", i % 5), format!("v{i}").into_bytes());
            tx.send(Delivery::new(message, Box::new(CountingAck(Arc::clone(&acks)))))
                .await
                .unwrap();
        }
        drop(tx);

        let stats = Dispatcher::new(router(), Some(2)).run(rx, CancellationToken::new()).await;
        assert_eq!(stats.dispatched, 50);
        assert_eq!(stats.acked, 50);
    }

    #[tokio::test]
    async fn test_cancel_stops_accepting() {
        let (tx, rx) = mpsc::channel::<Delivery>(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = Dispatcher::new(router(), None).run(rx, cancel).await;
        assert_eq!(stats, DispatchStats::default());
        assert!(tx.is_closed());
    }
}
