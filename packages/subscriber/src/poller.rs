//! Poll Loop
//!
//! Periodically scans newly confirmed rounds for a subscription. Stale
//! rounds are served by the index, the newest rounds by the ledger; every
//! matching transaction is resolved and handed to the notifier in
//! (round, intra-round offset) order, then the watermark is advanced.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::{ClientError, IndexClient, LedgerClient};
use crate::decoder::CandidateTransaction;
use crate::filter::{FilterOutcome, FilterSet};
use crate::notifier::{DeliveredTransactionRecord, Delivery, Notifier};
use crate::selector::MethodResolver;
use crate::subscription::SubscriptionState;
use crate::types::{RoundRange, SubscriptionKey};
use crate::watermark::{WatermarkError, WatermarkStore};

/// Default polling cadence in milliseconds
pub const DEFAULT_FREQUENCY_MS: u64 = 5_000;

/// Newest rounds served directly by the ledger
pub const DEFAULT_MAX_ROUNDS_TO_SYNC: u64 = 10;

/// Upper bound on rounds requested from the index in one tick
pub const DEFAULT_MAX_INDEXER_ROUNDS_TO_SYNC: u64 = 100_000;

/// Errors from a single poll tick
#[derive(Error, Debug)]
pub enum PollError {
    #[error("Ledger request failed: {0}")]
    Ledger(#[source] ClientError),

    #[error("Index request failed: {0}")]
    Index(#[source] ClientError),

    #[error("Watermark store failed: {0}")]
    Watermark(#[from] WatermarkError),

    #[error("Watermark {watermark} is {behind} rounds behind head {head}")]
    Stale { watermark: u64, head: u64, behind: u64 },
}

/// How to handle a watermark more than `max_rounds_to_sync` behind head
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncBehaviour {
    /// Older rounds through the index, newest through the ledger
    #[default]
    CatchupWithIndexer,
    /// Ledger only, oldest rounds first
    SyncOldest,
    /// Ledger only, jump to the newest rounds
    SkipSyncNewest,
    /// Treat a stale watermark as an error
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub frequency: Duration,
    pub max_rounds_to_sync: u64,
    pub max_indexer_rounds_to_sync: Option<u64>,
    pub sync_behaviour: SyncBehaviour,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            frequency: Duration::from_millis(DEFAULT_FREQUENCY_MS),
            max_rounds_to_sync: DEFAULT_MAX_ROUNDS_TO_SYNC,
            max_indexer_rounds_to_sync: Some(DEFAULT_MAX_INDEXER_ROUNDS_TO_SYNC),
            sync_behaviour: SyncBehaviour::default(),
        }
    }
}

/// Rounds to fetch in one tick, split by source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub indexer: Option<RoundRange>,
    pub ledger: Option<RoundRange>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.indexer.is_none() && self.ledger.is_none()
    }
}

/// Split `[watermark + 1, head]` into index and ledger portions
pub fn plan_sync(watermark: u64, head: u64, config: &PollConfig) -> Result<SyncPlan, PollError> {
    let Some(pending) = RoundRange::new(watermark.saturating_add(1), head) else {
        return Ok(SyncPlan::default());
    };

    let max_rounds = config.max_rounds_to_sync.max(1);
    if pending.round_count() <= max_rounds {
        return Ok(SyncPlan {
            indexer: None,
            ledger: Some(pending),
        });
    }

    let newest_start = head - max_rounds + 1;
    let plan = match config.sync_behaviour {
        SyncBehaviour::Fail => {
            return Err(PollError::Stale {
                watermark,
                head,
                behind: pending.round_count(),
            })
        }
        SyncBehaviour::SyncOldest => SyncPlan {
            indexer: None,
            ledger: RoundRange::new(pending.start, pending.start + max_rounds - 1),
        },
        SyncBehaviour::SkipSyncNewest => SyncPlan {
            indexer: None,
            ledger: RoundRange::new(newest_start, head),
        },
        SyncBehaviour::CatchupWithIndexer => {
            let stale_end = newest_start - 1;
            match config.max_indexer_rounds_to_sync {
                // the ledger portion waits until the index has caught up to it
                Some(limit) if stale_end - pending.start + 1 > limit => SyncPlan {
                    indexer: RoundRange::new(pending.start, pending.start + limit.max(1) - 1),
                    ledger: None,
                },
                _ => SyncPlan {
                    indexer: RoundRange::new(pending.start, stale_end),
                    ledger: RoundRange::new(newest_start, head),
                },
            }
        }
    };
    Ok(plan)
}

/// Summary of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Rounds fully scanned this tick
    pub scanned: Option<RoundRange>,
    pub matched: usize,
    pub delivered: usize,
    /// Watermark after the tick
    pub watermark: u64,
    /// Chain head observed at the start of the tick
    pub head: u64,
}

impl TickOutcome {
    /// Progress was made but rounds up to `head` remain
    pub fn is_behind(&self) -> bool {
        self.scanned.is_some() && self.watermark < self.head
    }
}

/// Per-subscription poller
pub struct PollLoop {
    key: SubscriptionKey,
    ledger: Arc<dyn LedgerClient>,
    indexer: Arc<dyn IndexClient>,
    watermarks: Arc<dyn WatermarkStore>,
    filters: Arc<FilterSet>,
    resolver: Arc<MethodResolver>,
    notifier: Arc<Notifier>,
    config: PollConfig,
}

impl PollLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: SubscriptionKey,
        ledger: Arc<dyn LedgerClient>,
        indexer: Arc<dyn IndexClient>,
        watermarks: Arc<dyn WatermarkStore>,
        filters: Arc<FilterSet>,
        resolver: Arc<MethodResolver>,
        notifier: Arc<Notifier>,
        config: PollConfig,
    ) -> Self {
        Self {
            key,
            ledger,
            indexer,
            watermarks,
            filters,
            resolver,
            notifier,
            config,
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    async fn fetch_from_ledger(&self, range: RoundRange) -> Result<Vec<CandidateTransaction>, ClientError> {
        let mut fetched = Vec::new();
        for query in self.filters.queries() {
            fetched.extend(self.ledger.recent_transactions(&query, range).await?);
        }
        Ok(fetched)
    }

    /// Run one poll cycle
    ///
    /// # Returns
    /// What was scanned and delivered. An index failure leaves the watermark
    /// untouched; a ledger failure after a successful index fetch advances it
    /// to the top of the index portion before the error is returned.
    pub async fn tick(&self) -> Result<TickOutcome, PollError> {
        let watermark = self.watermarks.get(self.key).await?;
        let head = self.ledger.chain_head().await.map_err(PollError::Ledger)?;

        let plan = plan_sync(watermark, head, &self.config)?;
        if plan.is_empty() {
            trace!(app_id = %self.key, round = head, "No new rounds");
            return Ok(TickOutcome {
                watermark,
                head,
                ..Default::default()
            });
        }

        let mut candidates = Vec::new();
        let mut scanned_to = watermark;
        let mut ledger_error = None;
        let mut ledger_range = plan.ledger;

        if let Some(range) = plan.indexer {
            let batch = self
                .indexer
                .search_ingested(&self.filters.queries(), range)
                .await
                .map_err(PollError::Index)?;
            let covered_to = batch.covered_to.map(|end| end.min(range.end));
            candidates.extend(batch.transactions);
            if let Some(end) = covered_to {
                scanned_to = end;
            }
            // a lagging index defers the ledger portion so rounds stay contiguous
            if covered_to != Some(range.end) {
                warn!(app_id = %self.key, covered = ?covered_to, wanted = range.end, "Index is lagging, deferring newer rounds");
                ledger_range = None;
            }
        }

        if let Some(range) = ledger_range {
            match self.fetch_from_ledger(range).await {
                Ok(fetched) => {
                    candidates.extend(fetched);
                    scanned_to = range.end;
                }
                Err(e) => ledger_error = Some(e),
            }
        }

        candidates.sort_by_key(|tx| (tx.confirmed_round.unwrap_or(u64::MAX), tx.intra_round_offset.unwrap_or(0)));

        let mut matched = 0;
        let mut delivered = 0;
        let mut interrupted = false;
        for tx in &candidates {
            let method = match self.filters.resolve(tx, &self.resolver) {
                FilterOutcome::Matched { method, .. } => method,
                FilterOutcome::Malformed | FilterOutcome::NoMatch => continue,
            };
            matched += 1;

            let record = DeliveredTransactionRecord::from_candidate(tx, method);
            match self.notifier.deliver(&record) {
                Delivery::Delivered => delivered += 1,
                Delivery::Duplicate => {}
                Delivery::Closed => {
                    interrupted = true;
                    break;
                }
            }
        }

        if interrupted {
            debug!(app_id = %self.key, "Subscription closed mid-tick, watermark left at {}", watermark);
            return Ok(TickOutcome {
                watermark,
                head,
                matched,
                delivered,
                ..Default::default()
            });
        }

        if scanned_to > watermark {
            self.watermarks.set(self.key, scanned_to).await?;
        }

        let scanned = RoundRange::new(watermark + 1, scanned_to);
        if let Some(range) = scanned {
            info!(app_id = %self.key, "Polled rounds {}, found {} matching", range, matched);
        }

        if let Some(e) = ledger_error {
            return Err(PollError::Ledger(e));
        }

        Ok(TickOutcome {
            scanned,
            matched,
            delivered,
            watermark: scanned_to,
            head,
        })
    }

    /// Tick on the configured cadence until `token` is cancelled
    ///
    /// While a bounded catch-up leaves rounds below the head, the next tick
    /// starts immediately instead of waiting for the interval.
    pub async fn run(self, token: CancellationToken, state: watch::Sender<SubscriptionState>) {
        let mut ticker = interval(self.config.frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut behind = false;

        loop {
            if behind {
                tokio::task::yield_now().await;
                if token.is_cancelled() {
                    break;
                }
            } else {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                result = self.tick() => result,
            };

            behind = matches!(&result, Ok(outcome) if outcome.is_behind());
            if behind {
                debug!(app_id = %self.key, "Still behind the chain head, polling again");
            }

            match result {
                Ok(_) => {
                    state.send_if_modified(|current| {
                        let changed = *current != SubscriptionState::Active;
                        *current = SubscriptionState::Active;
                        changed
                    });
                }
                Err(e) => {
                    warn!(app_id = %self.key, error = %e, "Poll tick failed, retrying next interval");
                    state.send_replace(SubscriptionState::Degraded);
                }
            }
        }

        state.send_replace(SubscriptionState::Stopped);
        debug!(app_id = %self.key, "Poll loop stopped");
    }

    /// Spawn [`PollLoop::run`] on the current runtime
    pub fn spawn(self, token: CancellationToken, state: watch::Sender<SubscriptionState>) -> JoinHandle<()> {
        tokio::spawn(self.run(token, state))
    }
}
