//! Mutex-guarded FIFO with predicate-based extraction.

use super::lock;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Outcome of [`WorkQueue::update_first`].
#[derive(Debug, PartialEq, Eq)]
pub enum Updated<T> {
    /// No element matched.
    NotFound,
    /// The matching element was updated and stays queued.
    Kept,
    /// The matching element was updated and then removed.
    Removed(T),
}

/// Thread-safe FIFO.
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Append to the tail.
    pub fn enqueue(&self, item: T) {
        lock(&self.items).push_back(item);
    }

    /// Append to the tail, first removing the oldest element matching
    /// `supersedes`. Returns the element that was replaced.
    pub fn enqueue_replacing<P>(&self, item: T, supersedes: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        let mut items = lock(&self.items);
        let old = items
            .iter()
            .position(|it| supersedes(it))
            .and_then(|pos| items.remove(pos));
        items.push_back(item);
        old
    }

    /// Append to the tail unless an element matching `conflicts` is already
    /// queued, in which case the item is handed back untouched.
    pub fn try_enqueue<P>(&self, item: T, conflicts: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        let mut items = lock(&self.items);
        if items.iter().any(|it| conflicts(it)) {
            return Some(item);
        }
        items.push_back(item);
        None
    }

    /// Remove and return the head.
    pub fn dequeue(&self) -> Option<T> {
        lock(&self.items).pop_front()
    }

    /// Remove and return the first element matching `pred`.
    pub fn dequeue_if<P>(&self, pred: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        let mut items = lock(&self.items);
        let pos = items.iter().position(|it| pred(it))?;
        items.remove(pos)
    }

    /// Non-removing lookup; `f` maps the first match to an owned answer.
    pub fn find_map<R, F>(&self, f: F) -> Option<R>
    where
        F: Fn(&T) -> Option<R>,
    {
        lock(&self.items).iter().find_map(f)
    }

    pub fn contains<P>(&self, pred: P) -> bool
    where
        P: Fn(&T) -> bool,
    {
        lock(&self.items).iter().any(pred)
    }

    /// Apply `f` to the first element matching `pred` under one lock hold.
    /// When `f` returns true the element is removed and handed back.
    pub fn update_first<P, F>(&self, pred: P, f: F) -> Updated<T>
    where
        P: Fn(&T) -> bool,
        F: FnOnce(&mut T) -> bool,
    {
        let mut items = lock(&self.items);
        let Some(pos) = items.iter().position(|it| pred(it)) else {
            return Updated::NotFound;
        };
        let remove = match items.get_mut(pos) {
            Some(item) => f(item),
            None => return Updated::NotFound,
        };
        if remove {
            match items.remove(pos) {
                Some(item) => Updated::Removed(item),
                None => Updated::NotFound,
            }
        } else {
            Updated::Kept
        }
    }

    /// Remove and return every element, oldest first.
    pub fn drain(&self) -> Vec<T> {
        lock(&self.items).drain(..).collect()
    }

    pub fn clear(&self) {
        lock(&self.items).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }
}

impl<T: Clone> WorkQueue<T> {
    /// Clone of the first element matching `pred`.
    pub fn find<P>(&self, pred: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        lock(&self.items).iter().find(|it| pred(it)).cloned()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let q = WorkQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_dequeue_if_takes_first_match() {
        let q = WorkQueue::new();
        for i in [5, 8, 10, 12] {
            q.enqueue(i);
        }
        assert_eq!(q.dequeue_if(|v| v % 2 == 0), Some(8));
        assert_eq!(q.dequeue_if(|v| *v > 100), None);
        assert_eq!(q.drain(), vec![5, 10, 12]);
    }

    #[test]
    fn test_enqueue_replacing_supersedes() {
        let q = WorkQueue::new();
        q.enqueue((1, "a"));
        q.enqueue((2, "b"));
        let old = q.enqueue_replacing((1, "c"), |(k, _)| *k == 1);
        assert_eq!(old, Some((1, "a")));
        assert_eq!(q.drain(), vec![(2, "b"), (1, "c")]);
    }

    #[test]
    fn test_try_enqueue_rejects_conflict() {
        let q = WorkQueue::new();
        assert_eq!(q.try_enqueue(4, |v| *v == 4), None);
        assert_eq!(q.try_enqueue(4, |v| *v == 4), Some(4));
        assert_eq!(q.try_enqueue(5, |v| *v == 5), None);
        assert_eq!(q.drain(), vec![4, 5]);
    }

    #[test]
    fn test_find_does_not_remove() {
        let q = WorkQueue::new();
        q.enqueue(String::from("gdc"));
        assert_eq!(q.find(|s| s == "gdc"), Some("gdc".to_string()));
        assert_eq!(q.find_map(|s| (s.len() == 3).then_some(s.len())), Some(3));
        assert!(q.contains(|s| s.starts_with('g')));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_update_first_keep_and_remove() {
        let q = WorkQueue::new();
        q.enqueue((1u32, 0u32));
        q.enqueue((2, 0));

        let r = q.update_first(|(k, _)| *k == 2, |(_, n)| {
            *n += 1;
            false
        });
        assert_eq!(r, Updated::Kept);

        let r = q.update_first(|(k, _)| *k == 2, |(_, n)| {
            *n += 1;
            *n == 2
        });
        assert_eq!(r, Updated::Removed((2, 2)));
        assert_eq!(q.update_first(|(k, _)| *k == 9, |_| true), Updated::NotFound);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_concurrent_producers() {
        let q = Arc::new(WorkQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = q.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        q.enqueue(t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.len(), 1000);
    }

    proptest! {
        #[test]
        fn test_dequeue_if_preserves_relative_order(
            values in prop::collection::vec(0u32..100, 0..64),
            pick in 0u32..100
        ) {
            let q = WorkQueue::new();
            for v in &values {
                q.enqueue(*v);
            }
            let taken = q.dequeue_if(|v| *v == pick);
            let rest = q.drain();

            let mut expected = values.clone();
            if let Some(pos) = values.iter().position(|v| *v == pick) {
                prop_assert_eq!(taken, Some(pick));
                expected.remove(pos);
            } else {
                prop_assert_eq!(taken, None);
            }
            prop_assert_eq!(rest, expected);
        }
    }
}
