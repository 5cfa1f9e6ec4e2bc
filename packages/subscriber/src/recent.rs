//! Recent Transactions View
//!
//! Small, ordered window over the latest delivered records for display.

use std::cmp::Ordering;

use crate::notifier::DeliveredTransactionRecord;

/// Default number of records kept
pub const RECENT_CAPACITY: usize = 5;

/// Bounded list ordered pending first, then newest round, then highest offset
#[derive(Debug, Clone)]
pub struct RecentTransactions {
    records: Vec<DeliveredTransactionRecord>,
    capacity: usize,
}

impl Default for RecentTransactions {
    fn default() -> Self {
        Self::with_capacity(RECENT_CAPACITY)
    }
}

fn display_order(a: &DeliveredTransactionRecord, b: &DeliveredTransactionRecord) -> Ordering {
    match (a.confirmed_round, b.confirmed_round) {
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (ra, rb) => rb
            .cmp(&ra)
            .then_with(|| b.intra_round_offset.cmp(&a.intra_round_offset)),
    }
}

impl RecentTransactions {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert or replace by id, then reorder and truncate
    ///
    /// A confirmed observation replaces the pending entry for the same id.
    pub fn push(&mut self, record: DeliveredTransactionRecord) {
        self.records.retain(|existing| existing.id != record.id);
        self.records.push(record);
        self.records.sort_by(display_order);
        self.records.truncate(self.capacity);
    }

    pub fn records(&self) -> &[DeliveredTransactionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, round: Option<u64>, offset: Option<u64>) -> DeliveredTransactionRecord {
        let mut record = DeliveredTransactionRecord::pending(id, "SENDER", "turnOn");
        record.confirmed_round = round;
        record.intra_round_offset = offset;
        record
    }

    fn ids(view: &RecentTransactions) -> Vec<&str> {
        view.records().iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_ordering() {
        let mut view = RecentTransactions::default();
        view.push(record("A", Some(10), Some(0)));
        view.push(record("B", Some(12), Some(1)));
        view.push(record("C", None, None));
        view.push(record("D", Some(12), Some(4)));
        assert_eq!(ids(&view), vec!["C", "D", "B", "A"]);
    }

    #[test]
    fn test_capacity() {
        let mut view = RecentTransactions::default();
        for round in 1..=7 {
            view.push(record(&format!("T{round}"), Some(round), Some(0)));
        }
        assert_eq!(view.len(), RECENT_CAPACITY);
        assert_eq!(ids(&view), vec!["T7", "T6", "T5", "T4", "T3"]);
    }

    #[test]
    fn test_id_appears_once() {
        let mut view = RecentTransactions::default();
        view.push(record("TXN2", None, None));
        view.push(record("TXN2", Some(20), Some(2)));
        assert_eq!(view.len(), 1);
        assert_eq!(view.records()[0].confirmed_round, Some(20));
    }

    #[test]
    fn test_empty() {
        let view = RecentTransactions::with_capacity(3);
        assert!(view.is_empty());
    }
}
