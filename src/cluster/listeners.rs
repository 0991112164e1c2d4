//! Listener Registry
//!
//! Subscribers implement [`ClusterListener`], one callback per event type.
//! A listener may opt individual events out of ordered delivery through
//! [`ClusterListener::delivery`]; the dispatcher asks at dispatch time.

use parking_lot::RwLock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use super::types::{ClusterEvent, EventType};

/// Failure reported by a listener callback.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The platform the listener depends on has already stopped.
    #[error("platform is not running")]
    PlatformNotRunning,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub type ListenerResult = Result<(), ListenerError>;

/// Channel a listener wants a given event delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Single ordered worker; all events in enqueue order.
    #[default]
    Ordered,
    /// Best effort, time-bounded, possibly reordered.
    OutOfBand,
}

pub trait ClusterListener: Send + Sync {
    fn node_joined(&self, _event: &ClusterEvent) -> ListenerResult {
        Ok(())
    }

    fn node_left(&self, _event: &ClusterEvent) -> ListenerResult {
        Ok(())
    }

    fn operations_enabled(&self, _event: &ClusterEvent) -> ListenerResult {
        Ok(())
    }

    fn operations_disabled(&self, _event: &ClusterEvent) -> ListenerResult {
        Ok(())
    }

    fn node_rejoined(&self, _event: &ClusterEvent) -> ListenerResult {
        Ok(())
    }

    fn node_error(&self, _event: &ClusterEvent) -> ListenerResult {
        Ok(())
    }

    fn delivery(&self, _event: &ClusterEvent) -> Delivery {
        Delivery::Ordered
    }
}

/// Invokes the callback matching `event.kind`.
///
/// Errors and panics raised by the listener stop here: they are logged and
/// never reach the delivery thread's loop or the firing thread.
pub fn notify_listener(listener: &dyn ClusterListener, event: &ClusterEvent) {
    let outcome = catch_unwind(AssertUnwindSafe(|| match event.kind {
        EventType::NodeJoin => listener.node_joined(event),
        EventType::NodeLeft => listener.node_left(event),
        EventType::OperationsEnabled => listener.operations_enabled(event),
        EventType::OperationsDisabled => listener.operations_disabled(event),
        EventType::NodeRejoined => listener.node_rejoined(event),
        EventType::NodeError => listener.node_error(event),
    }));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(ListenerError::PlatformNotRunning)) => {
            tracing::info!("Platform not running while firing cluster event: {}", event);
        }
        Ok(Err(ListenerError::Failed(e))) => {
            tracing::error!("Problem firing the cluster event: {}: {:#}", event, e);
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Listener panicked on cluster event {}: {}", event, reason);
        }
    }
}

/// Compares listeners by allocation, ignoring vtable identity.
pub fn same_listener(a: &Arc<dyn ClusterListener>, b: &Arc<dyn ClusterListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Copy-on-write listener list: dispatch iterates an `Arc` snapshot while
/// add/remove swap in a new vector.
pub struct ListenerRegistry {
    listeners: RwLock<Arc<Vec<Arc<dyn ClusterListener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Returns `false` if the same listener instance is already subscribed.
    pub fn add(&self, listener: Arc<dyn ClusterListener>) -> bool {
        let mut current = self.listeners.write();
        if current.iter().any(|existing| same_listener(existing, &listener)) {
            return false;
        }
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(listener);
        *current = Arc::new(next);
        true
    }

    pub fn remove(&self, listener: &Arc<dyn ClusterListener>) -> bool {
        let mut current = self.listeners.write();
        if !current.iter().any(|existing| same_listener(existing, listener)) {
            return false;
        }
        let next: Vec<Arc<dyn ClusterListener>> = current
            .iter()
            .filter(|existing| !same_listener(existing, listener))
            .cloned()
            .collect();
        *current = Arc::new(next);
        true
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn ClusterListener>>> {
        self.listeners.read().clone()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::{NodeId, NodeRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl ClusterListener for Counting {
        fn node_joined(&self, _event: &ClusterEvent) -> ListenerResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl ClusterListener for Failing {
        fn node_joined(&self, _event: &ClusterEvent) -> ListenerResult {
            Err(anyhow::anyhow!("nodeJoined").into())
        }

        fn node_left(&self, _event: &ClusterEvent) -> ListenerResult {
            Err(ListenerError::PlatformNotRunning)
        }

        fn operations_enabled(&self, _event: &ClusterEvent) -> ListenerResult {
            panic!("operationsEnabled");
        }
    }

    fn event(kind: EventType) -> ClusterEvent {
        ClusterEvent::new(kind, Arc::new(NodeRecord::remote(NodeId(1))))
    }

    #[test]
    fn test_add_deduplicates_by_identity() {
        let registry = ListenerRegistry::new();
        let listener: Arc<dyn ClusterListener> = Arc::new(Counting(AtomicUsize::new(0)));
        let other: Arc<dyn ClusterListener> = Arc::new(Counting(AtomicUsize::new(0)));

        assert!(registry.add(listener.clone()));
        assert!(!registry.add(listener.clone()));
        assert!(registry.add(other));
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(&listener));
        assert!(!registry.remove(&listener));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_mutation() {
        let registry = ListenerRegistry::new();
        let listener: Arc<dyn ClusterListener> = Arc::new(Counting(AtomicUsize::new(0)));
        registry.add(listener.clone());

        let snapshot = registry.snapshot();
        registry.remove(&listener);

        assert_eq!(snapshot.len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_notify_routes_to_matching_callback() {
        let listener = Counting(AtomicUsize::new(0));

        notify_listener(&listener, &event(EventType::NodeJoin));
        notify_listener(&listener, &event(EventType::NodeLeft));

        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_notify_swallows_errors_and_panics() {
        let listener = Failing;

        notify_listener(&listener, &event(EventType::NodeJoin));
        notify_listener(&listener, &event(EventType::NodeLeft));
        notify_listener(&listener, &event(EventType::OperationsEnabled));
        notify_listener(&listener, &event(EventType::NodeError));
    }

    #[test]
    fn test_default_delivery_is_ordered() {
        let listener = Counting(AtomicUsize::new(0));
        assert_eq!(listener.delivery(&event(EventType::NodeJoin)), Delivery::Ordered);
    }
}
