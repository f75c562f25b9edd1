//! Event dispatcher: a registry of consumers, each fed through its own queue.
//!
//! `emit` never waits on a consumer. Every consumer has a dedicated worker task
//! that delivers events in order with a timeout, so a slow or failing consumer
//! only ever delays itself.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::events::Event;

pub trait EventConsumer: Send + Sync {
    fn name(&self) -> &str;

    fn deliver(&self, event: Event) -> BoxFuture<'_, anyhow::Result<()>>;
}

struct ConsumerQueue {
    name: String,
    tx: mpsc::Sender<Event>,
    worker: JoinHandle<()>,
}

pub struct EventDispatcher {
    consumers: Vec<ConsumerQueue>,
    queue_capacity: usize,
    delivery_timeout: Duration,
}

impl EventDispatcher {
    pub fn new(queue_capacity: usize, delivery_timeout: Duration) -> Self {
        EventDispatcher {
            consumers: Vec::new(),
            queue_capacity: queue_capacity.max(1),
            delivery_timeout,
        }
    }

    /// Registers a consumer and starts its delivery worker. Must be called
    /// from within a tokio runtime.
    pub fn register(&mut self, consumer: Arc<dyn EventConsumer>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let name = consumer.name().to_string();
        debug!("Registering event consumer {name}");
        let worker = tokio::spawn(deliver_loop(consumer, rx, self.delivery_timeout));
        self.consumers.push(ConsumerQueue { name, tx, worker });
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Hands the event to every consumer queue without waiting.
    pub fn emit(&self, event: &Event) {
        for consumer in &self.consumers {
            if let Err(err) = consumer.tx.try_send(event.clone()) {
                match err {
                    mpsc::error::TrySendError::Full(event) => warn!(
                        "Consumer {} is backed up, dropping {} for {}",
                        consumer.name, event.name, event.device
                    ),
                    mpsc::error::TrySendError::Closed(event) => warn!(
                        "Consumer {} has stopped, dropping {} for {}",
                        consumer.name, event.name, event.device
                    ),
                }
            }
        }
    }
}

impl EventDispatcher {
    /// Closes every queue and waits until each consumer has handled what was
    /// already queued. Bounded by the delivery timeout per queued event.
    pub async fn shutdown(self) {
        for ConsumerQueue { name, tx, worker } in self.consumers {
            drop(tx);
            if let Err(err) = worker.await {
                warn!("Consumer {name} worker ended abnormally: {err}");
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(64, Duration::from_secs(5))
    }
}

async fn deliver_loop(
    consumer: Arc<dyn EventConsumer>,
    mut rx: mpsc::Receiver<Event>,
    delivery_timeout: Duration,
) {
    while let Some(event) = rx.recv().await {
        let name = event.name;
        let delivery = AssertUnwindSafe(async { consumer.deliver(event).await }).catch_unwind();
        match tokio::time::timeout(delivery_timeout, delivery).await {
            Ok(Ok(Ok(()))) => debug!("Delivered {name} to {}", consumer.name()),
            Ok(Ok(Err(err))) => warn!(
                "Consumer {} failed to handle {name}: {err:?}",
                consumer.name()
            ),
            Ok(Err(_)) => warn!("Consumer {} panicked while handling {name}", consumer.name()),
            Err(_) => warn!(
                "Consumer {} did not handle {name} within {delivery_timeout:?}",
                consumer.name()
            ),
        }
    }
    debug!("Event consumer {} finished", consumer.name());
}

/// Logs every event.
#[derive(Debug, Default)]
pub struct LogConsumer;

impl EventConsumer for LogConsumer {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&self, event: Event) -> BoxFuture<'_, anyhow::Result<()>> {
        info!("{} (who: {}, device: {})", event.name, event.tokens.who, event.device);
        async { Ok(()) }.boxed()
    }
}

/// Re-publishes events on an in-process broadcast channel.
///
/// Publishing succeeds even when nobody is subscribed.
#[derive(Debug)]
pub struct BroadcastConsumer {
    sender: broadcast::Sender<Event>,
}

impl BroadcastConsumer {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        BroadcastConsumer { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl EventConsumer for BroadcastConsumer {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn deliver(&self, event: Event) -> BoxFuture<'_, anyhow::Result<()>> {
        // only fails without receivers
        let _ = self.sender.send(event);
        async { Ok(()) }.boxed()
    }
}
