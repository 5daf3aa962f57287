//! Bounded processed-id bookkeeping.

use signal_protocol::SignalId;
use std::collections::{HashSet, VecDeque};

/// Remembers recently processed signal ids.
///
/// Holds at most `capacity` ids. Inserting past capacity keeps only the
/// newest `capacity / 2`, so memory stays bounded for long sessions while
/// the watermark overlap window is still covered.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    seen: HashSet<SignalId>,
    order: VecDeque<SignalId>,
}

impl DedupWindow {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity + 1),
            order: VecDeque::with_capacity(capacity + 1),
        }
    }

    /// Record `id`. Returns `false` if it was already seen.
    pub fn insert(&mut self, id: SignalId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);

        if self.order.len() > self.capacity {
            let keep = self.capacity / 2;
            while self.order.len() > keep {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
        true
    }

    #[must_use]
    pub fn contains(&self, id: &SignalId) -> bool {
        self.seen.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected() {
        let mut window = DedupWindow::new(500);
        let id = SignalId::new();
        assert!(window.insert(id));
        assert!(!window.insert(id));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_prunes_to_newest_half() {
        let mut window = DedupWindow::new(500);
        let ids: Vec<SignalId> = (0..501).map(|_| SignalId::new()).collect();
        for id in &ids {
            assert!(window.insert(*id));
        }

        assert_eq!(window.len(), 250);
        assert!(!window.contains(&ids[0]));
        assert!(!window.contains(&ids[250]));
        assert!(window.contains(&ids[251]));
        assert!(window.contains(&ids[500]));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut window = DedupWindow::new(10);
        for _ in 0..1_000 {
            window.insert(SignalId::new());
            assert!(window.len() <= 10);
        }
    }

    #[test]
    fn test_pruned_id_is_accepted_again() {
        let mut window = DedupWindow::new(4);
        let first = SignalId::new();
        window.insert(first);
        for _ in 0..4 {
            window.insert(SignalId::new());
        }
        assert!(!window.contains(&first));
        assert!(window.insert(first));
    }
}
