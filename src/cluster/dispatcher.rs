//! Event Dispatcher
//!
//! Routes each `(event, listener)` pair either to the ordered worker, a
//! single dedicated thread that runs callbacks one at a time in enqueue
//! order, or to the [`OutOfBandNotifier`] when the listener asks for it.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use super::listeners::{ClusterListener, Delivery, notify_listener};
use super::notifier::{NotifierStats, OutOfBandNotifier};
use super::types::ClusterEvent;
use crate::cluster::config::ClusterConfig;

enum OrderedItem {
    Deliver {
        event: ClusterEvent,
        listener: Arc<dyn ClusterListener>,
    },
    Barrier(oneshot::Sender<()>),
    Stop,
}

pub struct EventDispatcher {
    ordered: mpsc::UnboundedSender<OrderedItem>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<OrderedItem>>>,
    notifier: OutOfBandNotifier,
    worker_name: String,
}

impl EventDispatcher {
    pub fn new(config: &ClusterConfig) -> Self {
        let (ordered, pending) = mpsc::unbounded_channel();
        Self {
            ordered,
            pending: Mutex::new(Some(pending)),
            notifier: OutOfBandNotifier::new(config.oob_join_timeout()),
            worker_name: config.ordered_worker_name.clone(),
        }
    }

    /// Starts the ordered worker thread and the out-of-band dispatch loop.
    pub fn start(&self, runtime: &Handle) -> Result<()> {
        let Some(mut queue) = self.pending.lock().take() else {
            anyhow::bail!("event dispatcher already started");
        };

        thread::Builder::new()
            .name(self.worker_name.clone())
            .spawn(move || {
                tracing::debug!("Ordered event worker started");
                while let Some(item) = queue.blocking_recv() {
                    match item {
                        OrderedItem::Deliver { event, listener } => {
                            tracing::trace!("Delivering {}", event);
                            notify_listener(listener.as_ref(), &event);
                        }
                        OrderedItem::Barrier(reached) => {
                            let _ = reached.send(());
                        }
                        OrderedItem::Stop => break,
                    }
                }
                tracing::debug!("Ordered event worker stopped");
            })
            .with_context(|| format!("failed to spawn {} thread", self.worker_name))?;

        self.notifier.start(runtime)
    }

    /// Routes one event to one listener.
    pub fn dispatch(&self, event: &ClusterEvent, listener: &Arc<dyn ClusterListener>) {
        match listener.delivery(event) {
            Delivery::OutOfBand => {
                let event = event.clone();
                let listener = listener.clone();
                self.notifier
                    .submit(Box::new(move || notify_listener(listener.as_ref(), &event)));
            }
            Delivery::Ordered => {
                let item = OrderedItem::Deliver {
                    event: event.clone(),
                    listener: listener.clone(),
                };
                if self.ordered.send(item).is_err() {
                    tracing::trace!("Ordered worker gone, dropping {}", event);
                }
            }
        }
    }

    pub fn broadcast(&self, event: &ClusterEvent, listeners: &[Arc<dyn ClusterListener>]) {
        tracing::debug!("Firing {} to {} listener(s)", event, listeners.len());
        for listener in listeners {
            self.dispatch(event, listener);
        }
    }

    /// Resolves once every ordered delivery enqueued before this call has
    /// run. Returns early if the worker has stopped; never resolves before
    /// `start`.
    pub async fn flush_ordered(&self) {
        let (reached, barrier) = oneshot::channel();
        if self.ordered.send(OrderedItem::Barrier(reached)).is_err() {
            return;
        }
        let _ = barrier.await;
    }

    /// Stops both delivery paths. Ordered items enqueued before this call are
    /// still delivered; nothing waits for them.
    pub fn shutdown(&self) {
        let _ = self.ordered.send(OrderedItem::Stop);
        self.notifier.shutdown();
    }

    pub fn notifier_stats(&self) -> NotifierStats {
        self.notifier.stats()
    }
}
