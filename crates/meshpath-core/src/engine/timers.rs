//! One deadline per session, ordered by time.

use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

/// Deadline queue keyed by session slot. Scheduling a slot replaces its
/// previous deadline.
#[derive(Debug, Default)]
pub struct TimerQueue {
    queue: BTreeMap<(Instant, u64), usize>,
    armed: HashMap<usize, (Instant, u64)>,
    seq: u64,
}

impl TimerQueue {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `slot`'s deadline, or clear it with `None`. Returns `true` if
    /// the earliest deadline moved earlier.
    pub fn schedule(&mut self, slot: usize, at: Option<Instant>) -> bool {
        let before = self.next_deadline();
        if let Some(key) = self.armed.remove(&slot) {
            self.queue.remove(&key);
        }
        let Some(at) = at else {
            return false;
        };
        self.seq += 1;
        let key = (at, self.seq);
        self.queue.insert(key, slot);
        self.armed.insert(slot, key);
        before.is_none_or(|b| at < b)
    }

    /// Forget `slot`.
    pub fn cancel(&mut self, slot: usize) {
        self.schedule(slot, None);
    }

    /// Earliest deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return every slot due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<usize> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let slot = entry.remove();
            self.armed.remove(&slot);
            due.push(slot);
        }
        due
    }

    /// Number of armed slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// Whether nothing is armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pop_due_in_order() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(1, Some(now + Duration::from_secs(2)));
        q.schedule(2, Some(now + Duration::from_secs(1)));
        q.schedule(3, Some(now + Duration::from_secs(5)));
        assert_eq!(q.next_deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(q.pop_due(now + Duration::from_secs(2)), vec![2, 1]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_reschedule_replaces() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        assert!(q.schedule(1, Some(now + Duration::from_secs(5))));
        assert!(q.schedule(1, Some(now + Duration::from_secs(1))));
        assert!(!q.schedule(1, Some(now + Duration::from_secs(3))));
        assert_eq!(q.len(), 1);
        assert!(q.pop_due(now + Duration::from_secs(2)).is_empty());
        assert_eq!(q.pop_due(now + Duration::from_secs(3)), vec![1]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(7, Some(now));
        q.cancel(7);
        assert!(q.pop_due(now).is_empty());
        assert_eq!(q.next_deadline(), None);
    }

    #[test]
    fn test_equal_deadlines_both_fire() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(1, Some(now));
        q.schedule(2, Some(now));
        assert_eq!(q.pop_due(now), vec![1, 2]);
    }
}
