//! Transaction Deduplication
//!
//! Remembers which transaction ids have been delivered for one subscription.
//! Shared by the poll task and the direct-submit path.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tracing::trace;

#[derive(Debug, Default)]
struct Seen {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

/// Insert-if-absent set of delivered transaction ids
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: Mutex<Seen>,
    capacity: Option<usize>,
}

impl Deduplicator {
    /// Remembers every id for the lifetime of the subscription
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Keeps at most `capacity` ids, evicting the oldest first
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(Seen::default()),
            capacity: Some(capacity.max(1)),
        }
    }

    /// Build from an optional bound
    pub fn from_capacity(capacity: Option<usize>) -> Self {
        match capacity {
            Some(capacity) => Self::with_capacity(capacity),
            None => Self::unbounded(),
        }
    }

    /// Record `id`; returns `true` only the first time it is seen
    pub fn admit(&self, id: &str) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if seen.ids.contains(id) {
            trace!(txid = %id, "Duplicate observation absorbed");
            return false;
        }

        seen.ids.insert(id.to_string());
        if let Some(capacity) = self.capacity {
            seen.order.push_back(id.to_string());
            while seen.order.len() > capacity {
                if let Some(oldest) = seen.order.pop_front() {
                    seen.ids.remove(&oldest);
                }
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        match self.seen.lock() {
            Ok(seen) => seen.ids.contains(id),
            Err(poisoned) => poisoned.into_inner().ids.contains(id),
        }
    }

    pub fn len(&self) -> usize {
        match self.seen.lock() {
            Ok(seen) => seen.ids.len(),
            Err(poisoned) => poisoned.into_inner().ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
