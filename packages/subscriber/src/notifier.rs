//! Consumer Notification
//!
//! Delivers each matched transaction to the subscription's consumer at most
//! once. The poll path and the direct-submit path both go through
//! [`Notifier::deliver`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use crate::decoder::CandidateTransaction;
use crate::dedup::Deduplicator;

/// Record handed to consumers
///
/// This is the JSON structure emitted to downstream listeners; a pending
/// transaction serializes `confirmedRound` as `null`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredTransactionRecord {
    pub id: String,
    pub sender: String,
    /// `None` while the transaction is still pending
    pub confirmed_round: Option<u64>,
    /// Local observation time, RFC 3339 UTC
    pub observed_at: DateTime<Utc>,
    /// Resolved method name, "unknown" when unresolved
    pub method_name: String,
    pub intra_round_offset: Option<u64>,
}

impl DeliveredTransactionRecord {
    pub fn from_candidate(tx: &CandidateTransaction, method_name: impl Into<String>) -> Self {
        Self {
            id: tx.id.clone(),
            sender: tx.sender.clone(),
            confirmed_round: tx.confirmed_round,
            observed_at: Utc::now(),
            method_name: method_name.into(),
            intra_round_offset: tx.intra_round_offset,
        }
    }

    /// Record for a transaction this process just submitted
    pub fn pending(id: impl Into<String>, sender: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            confirmed_round: None,
            observed_at: Utc::now(),
            method_name: method_name.into(),
            intra_round_offset: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.confirmed_round.is_none()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Receives delivered records; must not block
pub trait TransactionConsumer: Send + Sync {
    fn on_transaction(&self, record: &DeliveredTransactionRecord);
}

impl<F> TransactionConsumer for F
where
    F: Fn(&DeliveredTransactionRecord) + Send + Sync,
{
    fn on_transaction(&self, record: &DeliveredTransactionRecord) {
        self(record)
    }
}

/// Forwards records into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelConsumer {
    sender: UnboundedSender<DeliveredTransactionRecord>,
}

impl ChannelConsumer {
    pub fn new(sender: UnboundedSender<DeliveredTransactionRecord>) -> Self {
        Self { sender }
    }
}

impl TransactionConsumer for ChannelConsumer {
    fn on_transaction(&self, record: &DeliveredTransactionRecord) {
        if self.sender.send(record.clone()).is_err() {
            debug!(txid = %record.id, "Consumer channel closed, dropping record");
        }
    }
}

/// What happened to a record passed to [`Notifier::deliver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Duplicate,
    /// The subscription was stopped
    Closed,
}

/// Dedup-gated delivery to a single consumer
pub struct Notifier {
    open: Mutex<bool>,
    dedup: Deduplicator,
    consumer: Arc<dyn TransactionConsumer>,
}

impl Notifier {
    pub fn new(consumer: Arc<dyn TransactionConsumer>, dedup: Deduplicator) -> Self {
        Self {
            open: Mutex::new(true),
            dedup,
            consumer,
        }
    }

    fn gate(&self) -> MutexGuard<'_, bool> {
        match self.open.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Hand `record` to the consumer unless closed or already delivered
    ///
    /// The gate stays locked for the admit and the callback, so once
    /// [`Notifier::close`] returns no further callback can start.
    pub fn deliver(&self, record: &DeliveredTransactionRecord) -> Delivery {
        let open = self.gate();
        if !*open {
            trace!(txid = %record.id, "Notifier closed, record dropped");
            return Delivery::Closed;
        }
        if !self.dedup.admit(&record.id) {
            return Delivery::Duplicate;
        }

        debug!(txid = %record.id, method = %record.method_name, round = ?record.confirmed_round, "Delivering transaction");
        self.consumer.on_transaction(record);
        Delivery::Delivered
    }

    /// Stop accepting deliveries; waits for an in-progress callback
    pub fn close(&self) {
        *self.gate() = false;
    }

    pub fn is_open(&self) -> bool {
        *self.gate()
    }

    pub fn delivered_count(&self) -> usize {
        self.dedup.len()
    }
}
