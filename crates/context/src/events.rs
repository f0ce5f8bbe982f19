//! Typed publish/subscribe channel for context events.
//!
//! Subscribers register an async handler, optionally filtered by event
//! kind, and get back a subscription id for later removal. Delivery is
//! concurrent fan-out with independent failure isolation: each event spawns
//! one task per subscriber, a failing (or panicking) subscriber is logged
//! and never affects the others, and emission returns without waiting on
//! any of them.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use loupe_core::event::ContextEvent;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

/// An async event handler. Errors are logged, never propagated.
pub type EventHandler =
    Arc<dyn Fn(ContextEvent) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Opaque handle for removing a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Subscriber {
    handler: EventHandler,
    /// Event kind names this subscriber wants; `None` means everything.
    kinds: Option<Vec<String>>,
}

/// The subscriber registry backing one context state manager.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, optionally filtered to specific event kinds
    /// (names from [`loupe_core::event::EventKind::name`]).
    pub async fn subscribe(
        &self,
        handler: EventHandler,
        kinds: Option<Vec<String>>,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.subscribers
            .write()
            .await
            .insert(id.clone(), Subscriber { handler, kinds });
        id
    }

    /// Remove a subscription. Returns `true` if it existed.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.subscribers.write().await.remove(id).is_some()
    }

    /// Fan an event out to every matching subscriber.
    ///
    /// Fire-and-forget: one spawned task per subscriber, failures logged
    /// and isolated. Returns as soon as the tasks are spawned.
    pub async fn emit(&self, event: ContextEvent) {
        let kind_name = event.kind.name();
        let handlers: Vec<(SubscriptionId, EventHandler)> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .filter(|(_, s)| {
                    s.kinds
                        .as_ref()
                        .is_none_or(|kinds| kinds.iter().any(|k| k == kind_name))
                })
                .map(|(id, s)| (id.clone(), s.handler.clone()))
                .collect()
        };

        for (id, handler) in handlers {
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(reason) = handler(event).await {
                    warn!(subscription = %id, %reason, "Context event subscriber failed");
                }
            });
        }
    }

    /// Number of registered subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loupe_core::event::{ContextChange, EventKind};
    use loupe_core::item::ContextItemType;
    use loupe_core::session::SessionId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn updated_event() -> ContextEvent {
        ContextEvent::new(
            SessionId::from("s1"),
            EventKind::ContextUpdated {
                item_type: Some(ContextItemType::Insight),
                change: ContextChange::Added,
                count: 1,
            },
        )
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        Arc::new(move |_event| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let registry = SubscriberRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.subscribe(counting_handler(counter.clone()), None).await;

        registry.emit(updated_event()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn kind_filter_respected() {
        let registry = SubscriberRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry
            .subscribe(
                counting_handler(counter.clone()),
                Some(vec!["context_validated".into()]),
            )
            .await;

        registry.emit(updated_event()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        registry
            .emit(ContextEvent::new(
                SessionId::from("s1"),
                EventKind::ContextValidated { invalid_count: 2 },
            ))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_subscriber_is_isolated() {
        let registry = SubscriberRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let failing: EventHandler =
            Arc::new(|_| Box::pin(async { Err("subscriber exploded".to_string()) }));
        registry.subscribe(failing, None).await;
        registry.subscribe(counting_handler(counter.clone()), None).await;

        registry.emit(updated_event()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The healthy subscriber still got the event.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_subscriber_is_isolated() {
        let registry = SubscriberRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let panicking: EventHandler = Arc::new(|_| Box::pin(async { panic!("boom") }));
        registry.subscribe(panicking, None).await;
        registry.subscribe(counting_handler(counter.clone()), None).await;

        registry.emit(updated_event()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let registry = SubscriberRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = registry.subscribe(counting_handler(counter.clone()), None).await;

        assert!(registry.unsubscribe(&id).await);
        assert!(!registry.unsubscribe(&id).await);
        assert_eq!(registry.subscriber_count().await, 0);

        registry.emit(updated_event()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
