//! Subscription registry and delivery.

use crate::records::Change;
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{
    DropReason, LiveQueryEvent, Query, QueryResult, SubscriptionHandle, SubscriptionId,
};

pub(crate) type Callback = Box<dyn FnMut(&QueryResult) + Send>;

/// Where notifications for a subscription go.
#[derive(Clone)]
enum Sink {
    Callback(Arc<Mutex<Callback>>),
    Channel(Sender<LiveQueryEvent>),
}

/// Internal subscription state.
struct Subscription {
    query: Query,
    sink: Sink,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Check if a committed change touches this subscription's matching set.
    fn affected_by(&self, change: &Change) -> bool {
        change.before.as_ref().is_some_and(|t| self.query.matches(t))
            || change.after.as_ref().is_some_and(|t| self.query.matches(t))
    }

    fn deactivate(&self, reason: DropReason) {
        self.active.store(false, Ordering::SeqCst);
        if let Sink::Channel(ref sender) = self.sink {
            // Best effort; the receiver may be gone or full.
            let _ = sender.try_send(LiveQueryEvent::Dropped { reason });
        }
    }
}

/// Manages live query subscriptions.
///
/// The registry itself never calls user code while holding its lock, so
/// callbacks may unsubscribe themselves or other subscriptions.
pub struct SubscriptionManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a callback subscription.
    pub(crate) fn register_callback(
        &self,
        query: Query,
        callback: Callback,
    ) -> (SubscriptionId, Arc<AtomicBool>) {
        let id = self.next_id();
        let active = Arc::new(AtomicBool::new(true));

        self.subscriptions.write().insert(
            id,
            Subscription {
                query,
                sink: Sink::Callback(Arc::new(Mutex::new(callback))),
                active: Arc::clone(&active),
            },
        );

        debug!(subscription = id.0, "callback subscription registered");
        (id, active)
    }

    /// Register a channel subscription. `initial` is queued as the first event.
    pub(crate) fn register_channel(
        &self,
        query: Query,
        buffer_size: usize,
        initial: QueryResult,
    ) -> SubscriptionHandle {
        let id = self.next_id();
        // The channel is empty, so the initial snapshot always fits.
        let (sender, receiver) = bounded(buffer_size.max(1));
        let _ = sender.try_send(LiveQueryEvent::Snapshot { result: initial });

        self.subscriptions.write().insert(
            id,
            Subscription {
                query,
                sink: Sink::Channel(sender),
                active: Arc::new(AtomicBool::new(true)),
            },
        );

        debug!(subscription = id.0, "channel subscription registered");
        SubscriptionHandle { id, receiver }
    }

    /// Unsubscribe and clean up.
    ///
    /// Returns false if no such subscription was active.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscriptions.write().remove(&id);
        match removed {
            Some(sub) => {
                sub.deactivate(DropReason::Unsubscribed);
                debug!(subscription = id.0, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Drop every subscription.
    pub(crate) fn close_all(&self, reason: DropReason) {
        let drained: Vec<_> = self.subscriptions.write().drain().collect();
        for (_, sub) in &drained {
            sub.deactivate(reason.clone());
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), ?reason, "closed all subscriptions");
        }
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Subscriptions whose matching set is touched by any of `changes`.
    pub(crate) fn affected(&self, changes: &[Change]) -> Vec<(SubscriptionId, Query)> {
        let subs = self.subscriptions.read();
        let mut targets: Vec<_> = subs
            .iter()
            .filter(|(_, sub)| changes.iter().any(|c| sub.affected_by(c)))
            .map(|(id, sub)| (*id, sub.query.clone()))
            .collect();
        // Registration order, so delivery order is stable.
        targets.sort_by_key(|(id, _)| id.0);
        targets
    }

    /// Deliver a result to one subscription.
    ///
    /// Subscriptions removed since `affected` was computed are skipped.
    pub(crate) fn deliver(&self, id: SubscriptionId, result: QueryResult) {
        let (sink, active) = {
            let subs = self.subscriptions.read();
            match subs.get(&id) {
                Some(sub) => (sub.sink.clone(), Arc::clone(&sub.active)),
                None => return,
            }
        };

        if !active.load(Ordering::SeqCst) {
            return;
        }

        match sink {
            Sink::Callback(callback) => {
                let mut callback = callback.lock();
                (*callback)(&result);
            }
            Sink::Channel(sender) => match sender.try_send(LiveQueryEvent::Snapshot { result }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.drop_slow(id),
                Err(TrySendError::Disconnected(_)) => self.drop_disconnected(id),
            },
        }
    }

    fn drop_slow(&self, id: SubscriptionId) {
        let removed = self.subscriptions.write().remove(&id);
        if let Some(sub) = removed {
            warn!(subscription = id.0, "dropping slow subscriber");
            sub.deactivate(DropReason::BufferOverflow);
        }
    }

    /// Remove a channel subscription whose receiver is gone.
    fn drop_disconnected(&self, id: SubscriptionId) {
        let removed = self.subscriptions.write().remove(&id);
        if let Some(sub) = removed {
            debug!(subscription = id.0, "receiver dropped, removing subscription");
            sub.active.store(false, Ordering::SeqCst);
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Sequence, Timestamp, Todo, TodoFields, TodoId};
    use std::time::Duration;

    fn todo(id: &str, done: bool) -> Todo {
        let mut fields = TodoFields::new(id, Timestamp(1));
        fields.done = done;
        Todo::from_fields(TodoId::new(id), fields)
    }

    fn created(todo: Todo) -> Change {
        Change {
            id: todo.id.clone(),
            before: None,
            after: Some(todo),
        }
    }

    fn result(seq: u64) -> QueryResult {
        QueryResult {
            todos: vec![],
            sequence: Sequence(seq),
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let manager = SubscriptionManager::new();

        let (id, active) = manager.register_callback(Query::all(), Box::new(|_| {}));
        assert_eq!(manager.subscription_count(), 1);

        assert!(manager.unsubscribe(id));
        assert!(!active.load(Ordering::SeqCst));
        assert_eq!(manager.subscription_count(), 0);
        assert!(!manager.unsubscribe(id));
    }

    #[test]
    fn test_affected_filters_by_query() {
        let manager = SubscriptionManager::new();
        let (done_id, _) = manager.register_callback(Query::done(true), Box::new(|_| {}));
        let (open_id, _) = manager.register_callback(Query::done(false), Box::new(|_| {}));

        let targets = manager.affected(&[created(todo("a", false))]);
        let ids: Vec<_> = targets.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![open_id]);

        // A toggle leaves one set and enters the other.
        let toggled = Change {
            id: TodoId::new("a"),
            before: Some(todo("a", false)),
            after: Some(todo("a", true)),
        };
        let ids: Vec<_> = manager
            .affected(&[toggled])
            .iter()
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(ids, vec![done_id, open_id]);
    }

    #[test]
    fn test_initial_snapshot_is_first_channel_event() {
        let manager = SubscriptionManager::new();
        let handle = manager.register_channel(Query::all(), 4, result(7));

        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            LiveQueryEvent::Snapshot { result } => assert_eq!(result.sequence, Sequence(7)),
            other => panic!("Expected Snapshot event, got {:?}", other),
        }
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let manager = SubscriptionManager::new();
        let handle = manager.register_channel(Query::all(), 2, result(0));

        for i in 1..10 {
            manager.deliver(handle.id, result(i));
        }

        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_dropped_receiver_is_removed() {
        let manager = SubscriptionManager::new();
        let handle = manager.register_channel(Query::all(), 4, result(0));
        let id = handle.id;
        drop(handle);

        manager.deliver(id, result(1));
        assert_eq!(manager.subscription_count(), 0);
        assert!(!manager.unsubscribe(id));
    }

    #[test]
    fn test_unsubscribe_sends_dropped() {
        let manager = SubscriptionManager::new();
        let handle = manager.register_channel(Query::all(), 4, result(0));
        manager.unsubscribe(handle.id);

        let events: Vec<_> = handle.receiver.try_iter().collect();
        assert!(matches!(
            events.last(),
            Some(LiveQueryEvent::Dropped {
                reason: DropReason::Unsubscribed
            })
        ));
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let manager = Arc::new(SubscriptionManager::new());
        let weak = Arc::downgrade(&manager);
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let own_id = Arc::new(Mutex::new(None::<SubscriptionId>));
        let own_id_inner = Arc::clone(&own_id);

        let (id, _) = manager.register_callback(
            Query::all(),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let (Some(manager), Some(id)) = (weak.upgrade(), *own_id_inner.lock()) {
                    manager.unsubscribe(id);
                }
            }),
        );
        *own_id.lock() = Some(id);

        manager.deliver(id, result(1));
        manager.deliver(id, result(2));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.subscription_count(), 0);
    }
}
