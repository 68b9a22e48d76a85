use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One accepted reading, immutable once stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: i64,
    pub identity: String,
    pub temperature: f64,
    pub humidity: f64,
}

/// Fixed-capacity FIFO of recent readings across all identities.
///
/// Not synchronized on its own: the collector keeps it inside the hub lock,
/// so `snapshot` never observes a half-applied `append`.
#[derive(Debug)]
pub struct HistoryBuffer {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryBuffer {
    /// A zero capacity is bumped to one entry
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Inserts at the tail, evicting the oldest entry when full
    pub fn append(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Contents in insertion order
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Most recent `limit` entries, still oldest first
    pub fn tail(&self, limit: usize) -> Vec<HistoryEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: i64) -> HistoryEntry {
        HistoryEntry {
            timestamp: n,
            identity: format!("C{}", n % 3),
            temperature: 20.0 + n as f64 / 10.0,
            humidity: 50.0,
        }
    }

    #[test]
    fn test_keeps_most_recent_entries_in_order() {
        let mut history = HistoryBuffer::new(100);
        for n in 0..250 {
            history.append(entry(n));
        }
        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 100);
        assert_eq!(snapshot, (150..250).map(entry).collect::<Vec<_>>());
    }

    #[test]
    fn test_below_capacity_keeps_everything() {
        let mut history = HistoryBuffer::new(5);
        history.append(entry(1));
        history.append(entry(2));
        assert_eq!(history.snapshot(), vec![entry(1), entry(2)]);
        assert_eq!(history.capacity(), 5);
    }

    #[test]
    fn test_tail_returns_latest_entries() {
        let mut history = HistoryBuffer::new(10);
        for n in 0..6 {
            history.append(entry(n));
        }
        assert_eq!(history.tail(2), vec![entry(4), entry(5)]);
        assert_eq!(history.tail(50).len(), 6);
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let mut history = HistoryBuffer::new(0);
        history.append(entry(1));
        history.append(entry(2));
        assert_eq!(history.snapshot(), vec![entry(2)]);
    }
}
