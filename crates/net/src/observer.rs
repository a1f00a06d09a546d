//! Ordered callback lists with explicit subscribe/unsubscribe.

/// Handle returned by [`ObserverList::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Callbacks invoked in subscription order.
pub struct ObserverList<E> {
    next_id: u64,
    observers: Vec<(ObserverId, Box<dyn FnMut(&E)>)>,
}

impl<E> ObserverList<E> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            next_id: 0,
            observers: Vec::new(),
        }
    }

    /// Add a callback.
    pub fn subscribe(&mut self, callback: impl FnMut(&E) + 'static) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, Box::new(callback)));
        id
    }

    /// Remove a callback. Returns false if it was not subscribed.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer, _)| *observer != id);
        self.observers.len() != before
    }

    /// Invoke every callback with `event`.
    pub fn notify(&mut self, event: &E) {
        for (_, callback) in &mut self.observers {
            callback(event);
        }
    }

    /// Number of subscribers.
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_notify_in_subscription_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut list = ObserverList::<u32>::new();
        let a = log.clone();
        list.subscribe(move |v| a.borrow_mut().push(("a", *v)));
        let b = log.clone();
        list.subscribe(move |v| b.borrow_mut().push(("b", *v)));

        list.notify(&7);
        assert_eq!(*log.borrow(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_unsubscribe() {
        let hits = Rc::new(RefCell::new(0));
        let mut list = ObserverList::<()>::new();
        let h = hits.clone();
        let id = list.subscribe(move |_| *h.borrow_mut() += 1);

        assert!(list.unsubscribe(id));
        assert!(!list.unsubscribe(id));
        list.notify(&());
        assert_eq!(*hits.borrow(), 0);
        assert!(list.is_empty());
    }
}
