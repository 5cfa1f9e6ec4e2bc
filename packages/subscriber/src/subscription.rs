//! Subscription Control
//!
//! Starts and stops one poll task per application id and exposes the
//! direct-submit path that shares the poll task's notifier.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{ClientError, IndexClient, LedgerClient};
use crate::dedup::Deduplicator;
use crate::filter::FilterSet;
use crate::notifier::{DeliveredTransactionRecord, Delivery, Notifier, TransactionConsumer};
use crate::poller::{PollConfig, PollLoop};
use crate::selector::{MethodResolver, UNKNOWN_METHOD};
use crate::types::SubscriptionKey;
use crate::watermark::{WatermarkError, WatermarkStore};

/// Errors returned by subscription setup and control
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Invalid application id: {0}")]
    InvalidKey(u64),

    #[error("Subscription has no filters")]
    EmptyFilterSet,

    #[error("Application {0} already has an active subscription")]
    AlreadyActive(SubscriptionKey),

    #[error("Watermark store failed: {0}")]
    Watermark(#[from] WatermarkError),

    #[error("Submission failed: {0}")]
    Submit(#[from] ClientError),
}

/// Lifecycle of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Subscribing,
    Active,
    /// The last tick failed; the next tick retries
    Degraded,
    Stopped,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionState::Idle => "idle",
            SubscriptionState::Subscribing => "subscribing",
            SubscriptionState::Active => "active",
            SubscriptionState::Degraded => "degraded",
            SubscriptionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Settings applied to every subscription a [`Subscriber`] starts
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    pub poll: PollConfig,
    /// Bound on remembered ids; `None` keeps all of them
    pub dedup_capacity: Option<usize>,
    /// Round to resume after when no watermark is stored yet
    pub start_round: Option<u64>,
}

struct ActiveSubscription {
    token: CancellationToken,
    notifier: Arc<Notifier>,
    task: JoinHandle<()>,
    state: watch::Receiver<SubscriptionState>,
}

type ActiveMap = Arc<Mutex<HashMap<SubscriptionKey, ActiveSubscription>>>;

fn lock_active(active: &ActiveMap) -> MutexGuard<'_, HashMap<SubscriptionKey, ActiveSubscription>> {
    match active.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Close the gate, cancel the task, then wait for it to finish
async fn shutdown(active: &ActiveMap, key: SubscriptionKey) -> bool {
    let entry = lock_active(active).remove(&key);
    let Some(subscription) = entry else {
        return false;
    };

    subscription.notifier.close();
    subscription.token.cancel();
    if let Err(e) = subscription.task.await {
        warn!(app_id = %key, error = %e, "Poll task ended abnormally");
    }
    info!(app_id = %key, "Subscription stopped");
    true
}

/// Owns the collaborators shared by all subscriptions
pub struct Subscriber {
    ledger: Arc<dyn LedgerClient>,
    indexer: Arc<dyn IndexClient>,
    watermarks: Arc<dyn WatermarkStore>,
    resolver: Arc<MethodResolver>,
    options: SubscriptionOptions,
    active: ActiveMap,
}

impl Subscriber {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        indexer: Arc<dyn IndexClient>,
        watermarks: Arc<dyn WatermarkStore>,
        resolver: MethodResolver,
        options: SubscriptionOptions,
    ) -> Self {
        Self {
            ledger,
            indexer,
            watermarks,
            resolver: Arc::new(resolver),
            options,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn resolver(&self) -> &MethodResolver {
        &self.resolver
    }

    /// Subscribe to calls of every known method plus a catch-all
    pub async fn subscribe(
        &self,
        application_id: u64,
        consumer: Arc<dyn TransactionConsumer>,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        let filters = FilterSet::for_methods(application_id, &self.resolver);
        self.subscribe_with_filters(application_id, filters, consumer).await
    }

    /// Subscribe with an explicit filter set
    pub async fn subscribe_with_filters(
        &self,
        application_id: u64,
        filters: FilterSet,
        consumer: Arc<dyn TransactionConsumer>,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        if application_id == 0 {
            return Err(SubscriptionError::InvalidKey(application_id));
        }
        if filters.is_empty() {
            return Err(SubscriptionError::EmptyFilterSet);
        }
        let key = SubscriptionKey(application_id);
        if self.is_active(key) {
            return Err(SubscriptionError::AlreadyActive(key));
        }

        let watermark = self.watermarks.get(key).await?;
        if let Some(start) = self.options.start_round {
            if watermark == 0 && start > 0 {
                self.watermarks.set(key, start).await?;
            }
        }

        let mut active = lock_active(&self.active);
        if active.contains_key(&key) {
            return Err(SubscriptionError::AlreadyActive(key));
        }

        let notifier = Arc::new(Notifier::new(
            consumer,
            Deduplicator::from_capacity(self.options.dedup_capacity),
        ));
        let poll = PollLoop::new(
            key,
            Arc::clone(&self.ledger),
            Arc::clone(&self.indexer),
            Arc::clone(&self.watermarks),
            Arc::new(filters),
            Arc::clone(&self.resolver),
            Arc::clone(&notifier),
            self.options.poll.clone(),
        );

        let token = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Subscribing);
        let task = poll.spawn(token.clone(), state_tx);

        active.insert(
            key,
            ActiveSubscription {
                token,
                notifier: Arc::clone(&notifier),
                task,
                state: state_rx.clone(),
            },
        );
        info!(app_id = %key, watermark, "Subscribed");

        Ok(SubscriptionHandle {
            key,
            notifier,
            ledger: Arc::clone(&self.ledger),
            resolver: Arc::clone(&self.resolver),
            state: state_rx,
            active: Arc::clone(&self.active),
        })
    }

    /// Stop the subscription for `key`, waiting for its task to finish
    ///
    /// # Returns
    /// `false` if nothing was active for `key`
    pub async fn stop(&self, key: SubscriptionKey) -> bool {
        shutdown(&self.active, key).await
    }

    /// Stop every active subscription
    pub async fn stop_all(&self) {
        let keys: Vec<SubscriptionKey> = lock_active(&self.active).keys().copied().collect();
        for key in keys {
            shutdown(&self.active, key).await;
        }
    }

    pub fn is_active(&self, key: SubscriptionKey) -> bool {
        lock_active(&self.active).contains_key(&key)
    }

    /// Current state, `Idle` when not subscribed
    pub fn state(&self, key: SubscriptionKey) -> SubscriptionState {
        lock_active(&self.active)
            .get(&key)
            .map(|s| *s.state.borrow())
            .unwrap_or(SubscriptionState::Idle)
    }
}

/// Details of a call submitted through [`SubscriptionHandle::submit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedCall {
    pub sender: String,
    /// First application argument, used to resolve the method name
    pub first_arg: Option<Vec<u8>>,
}

/// Result of a direct submission
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReceipt {
    pub txid: String,
    pub delivery: Delivery,
}

/// Control surface for one active subscription
///
/// Dropping the handle does not stop the poll task; call
/// [`SubscriptionHandle::unsubscribe`] or [`Subscriber::stop`].
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    notifier: Arc<Notifier>,
    ledger: Arc<dyn LedgerClient>,
    resolver: Arc<MethodResolver>,
    state: watch::Receiver<SubscriptionState>,
    active: ActiveMap,
}

impl SubscriptionHandle {
    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition
    pub fn state_changes(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Submit signed bytes and deliver a pending record right away
    ///
    /// The poll task later observes the confirmed transaction under the
    /// same id; the shared deduplicator absorbs that observation.
    pub async fn submit(&self, signed_txn: &[u8], call: SubmittedCall) -> Result<SubmitReceipt, SubscriptionError> {
        let txid = self.ledger.submit(signed_txn).await?;
        let method = call
            .first_arg
            .as_deref()
            .map(|arg| self.resolver.classify(arg))
            .unwrap_or(UNKNOWN_METHOD);

        let record = DeliveredTransactionRecord::pending(txid.clone(), call.sender, method);
        let delivery = self.notifier.deliver(&record);
        info!(app_id = %self.key, txid = %txid, method, ?delivery, "Submitted transaction");
        Ok(SubmitReceipt { txid, delivery })
    }

    /// Stop this subscription; no callback fires after this returns
    pub async fn unsubscribe(self) -> bool {
        shutdown(&self.active, self.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockIndexClient, MockLedgerClient};
    use crate::watermark::{InMemoryWatermarkStore, MockWatermarkStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const APP_ID: u64 = 739285260;

    fn idle_ledger() -> MockLedgerClient {
        let mut ledger = MockLedgerClient::new();
        ledger.expect_chain_head().returning(|| Ok(0));
        ledger
    }

    fn subscriber_with(ledger: MockLedgerClient, watermarks: Arc<dyn WatermarkStore>, options: SubscriptionOptions) -> Subscriber {
        Subscriber::new(
            Arc::new(ledger),
            Arc::new(MockIndexClient::new()),
            watermarks,
            MethodResolver::led_control(),
            options,
        )
    }

    fn subscriber(ledger: MockLedgerClient) -> Subscriber {
        subscriber_with(ledger, Arc::new(InMemoryWatermarkStore::new()), SubscriptionOptions::default())
    }

    fn counter() -> (Arc<dyn TransactionConsumer>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&calls);
        let consumer = move |_: &DeliveredTransactionRecord| {
            inner.fetch_add(1, Ordering::SeqCst);
        };
        (Arc::new(consumer), calls)
    }

    // ==================== subscribe tests ====================

    #[tokio::test]
    async fn test_subscribe_rejects_zero_key() {
        let subscriber = subscriber(idle_ledger());
        let (consumer, _) = counter();
        let result = subscriber.subscribe(0, consumer).await;
        assert!(matches!(result, Err(SubscriptionError::InvalidKey(0))));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_empty_filters() {
        let subscriber = subscriber(idle_ledger());
        let (consumer, _) = counter();
        let result = subscriber
            .subscribe_with_filters(APP_ID, FilterSet::default(), consumer)
            .await;
        assert!(matches!(result, Err(SubscriptionError::EmptyFilterSet)));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_duplicate_key() {
        let subscriber = subscriber(idle_ledger());
        let (consumer, _) = counter();
        let handle = subscriber.subscribe(APP_ID, Arc::clone(&consumer)).await.unwrap();

        let second = subscriber.subscribe(APP_ID, consumer).await;
        assert!(matches!(second, Err(SubscriptionError::AlreadyActive(_))));

        assert!(handle.unsubscribe().await);
        assert!(!subscriber.is_active(SubscriptionKey(APP_ID)));
    }

    #[tokio::test]
    async fn test_subscribe_reports_watermark_failure() {
        let mut watermarks = MockWatermarkStore::new();
        watermarks
            .expect_get()
            .returning(|_| Err(WatermarkError::Poisoned));
        let subscriber = subscriber_with(idle_ledger(), Arc::new(watermarks), SubscriptionOptions::default());
        let (consumer, _) = counter();

        let result = subscriber.subscribe(APP_ID, consumer).await;
        assert!(matches!(result, Err(SubscriptionError::Watermark(_))));
        assert_eq!(subscriber.state(SubscriptionKey(APP_ID)), SubscriptionState::Idle);
    }

    #[tokio::test]
    async fn test_subscribe_seeds_start_round() {
        let watermarks = Arc::new(InMemoryWatermarkStore::new());
        let options = SubscriptionOptions {
            start_round: Some(500),
            ..Default::default()
        };
        let mut ledger = MockLedgerClient::new();
        ledger.expect_chain_head().returning(|| Ok(500));
        let subscriber = subscriber_with(ledger, watermarks.clone(), options);
        let (consumer, _) = counter();

        let handle = subscriber.subscribe(APP_ID, consumer).await.unwrap();
        assert_eq!(watermarks.get(SubscriptionKey(APP_ID)).await.unwrap(), 500);
        handle.unsubscribe().await;
    }

    // ==================== stop tests ====================

    #[tokio::test]
    async fn test_stop_unknown_key() {
        let subscriber = subscriber(idle_ledger());
        assert!(!subscriber.stop(SubscriptionKey(1)).await);
    }

    #[tokio::test]
    async fn test_stop_then_resubscribe() {
        let subscriber = subscriber(idle_ledger());
        let (consumer, _) = counter();
        let first = subscriber.subscribe(APP_ID, Arc::clone(&consumer)).await.unwrap();
        let mut states = first.state_changes();

        assert!(subscriber.stop(SubscriptionKey(APP_ID)).await);
        assert_eq!(*states.borrow_and_update(), SubscriptionState::Stopped);
        assert_eq!(subscriber.state(SubscriptionKey(APP_ID)), SubscriptionState::Idle);

        let second = subscriber.subscribe(APP_ID, consumer).await.unwrap();
        second.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_stop_all() {
        let subscriber = subscriber(idle_ledger());
        let (consumer, _) = counter();
        subscriber.subscribe(1, Arc::clone(&consumer)).await.unwrap();
        subscriber.subscribe(2, consumer).await.unwrap();
        subscriber.stop_all().await;
        assert!(!subscriber.is_active(SubscriptionKey(1)));
        assert!(!subscriber.is_active(SubscriptionKey(2)));
    }

    // ==================== submit tests ====================

    #[tokio::test]
    async fn test_submit_delivers_pending_record() {
        let mut ledger = idle_ledger();
        ledger
            .expect_submit()
            .times(1)
            .returning(|_| Ok("TXN2".to_string()));
        let subscriber = subscriber(ledger);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let consumer = Arc::new(crate::notifier::ChannelConsumer::new(tx));
        let handle = subscriber.subscribe(APP_ID, consumer).await.unwrap();

        let receipt = handle
            .submit(
                b"signed",
                SubmittedCall {
                    sender: "SENDER".to_string(),
                    first_arg: Some(vec![0x31, 0xdb, 0x47, 0x45]),
                },
            )
            .await
            .unwrap();
        assert_eq!(receipt.txid, "TXN2");
        assert_eq!(receipt.delivery, Delivery::Delivered);

        let record = rx.recv().await.unwrap();
        assert!(record.is_pending());
        assert_eq!(record.method_name, "turnOff");
        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_submit_failure_delivers_nothing() {
        let mut ledger = idle_ledger();
        ledger.expect_submit().returning(|_| {
            Err(ClientError::Status {
                endpoint: "algod".to_string(),
                status: 400,
            })
        });
        let subscriber = subscriber(ledger);
        let (consumer, calls) = counter();
        let handle = subscriber.subscribe(APP_ID, consumer).await.unwrap();

        let result = handle
            .submit(
                b"signed",
                SubmittedCall {
                    sender: "SENDER".to_string(),
                    first_arg: None,
                },
            )
            .await;
        assert!(matches!(result, Err(SubscriptionError::Submit(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        handle.unsubscribe().await;
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SubscriptionState::Degraded.to_string(), "degraded");
        assert_eq!(SubscriptionState::Idle.to_string(), "idle");
    }
}
