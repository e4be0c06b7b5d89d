use serde_json::Value as Json;

use crate::core::{EntityId, RecordRef};

use super::DroppedItem;

/// Handle returned by [`Signal::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fired once per top-level item before anything is resolved.
#[derive(Debug, Clone)]
pub struct BeforePersist {
    pub item: EntityId,
    /// Flat representation of the item, `Json::Null` when snapshots are
    /// disabled in the persist config.
    pub snapshot: Json,
}

/// Fired once per top-level item, dropped or not. A dropped item is not in
/// its own `resolved` list, but entities reachable from it may be.
#[derive(Debug, Clone)]
pub struct AfterPersist {
    pub item: EntityId,
    /// Resolved entities reachable from the item, in resolution order.
    pub resolved: Vec<EntityId>,
    /// Records of `resolved`, flattened in the same order.
    pub records: Vec<RecordRef>,
}

type Subscriber<E> = Box<dyn FnMut(&E)>;

/// Synchronous notification channel. Subscribers run in registration order.
pub struct Signal<E> {
    subscribers: Vec<(SubscriptionId, Subscriber<E>)>,
    next_id: u64,
}

impl<E> Signal<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 0,
        }
    }

    pub fn subscribe(&mut self, subscriber: impl FnMut(&E) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(subscriber)));
        id
    }

    /// Returns false when the subscription was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub fn emit(&mut self, event: &E) {
        for (_, subscriber) in &mut self.subscribers {
            subscriber(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn clear(&mut self) {
        self.subscribers.clear();
    }
}

impl<E> Default for Signal<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Signal<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// The persister's notification channels.
#[derive(Debug, Default)]
pub struct Signals {
    pub before_persist: Signal<BeforePersist>,
    pub after_persist: Signal<AfterPersist>,
    pub dropped: Signal<DroppedItem>,
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn test_registration_order() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut signal: Signal<u32> = Signal::new();
        for tag in ["a", "b", "c"] {
            let calls = calls.clone();
            signal.subscribe(move |n| calls.borrow_mut().push(format!("{}{}", tag, n)));
        }

        signal.emit(&1);
        assert_eq!(*calls.borrow(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_unsubscribe_affects_later_emits() {
        let count = Rc::new(RefCell::new(0));
        let mut signal: Signal<()> = Signal::new();
        let counter = count.clone();
        let id = signal.subscribe(move |_| *counter.borrow_mut() += 1);

        signal.emit(&());
        assert!(signal.unsubscribe(id));
        assert!(!signal.unsubscribe(id));
        signal.emit(&());

        assert_eq!(*count.borrow(), 1);
        assert!(signal.is_empty());
    }
}
