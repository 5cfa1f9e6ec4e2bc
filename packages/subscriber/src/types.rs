//! Core identifiers shared across the subscription engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one subscription target: an application id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey(pub u64);

impl SubscriptionKey {
    pub fn app_id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive range of rounds `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundRange {
    pub start: u64,
    pub end: u64,
}

impl RoundRange {
    /// Returns `None` when `start > end`
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Number of rounds covered
    pub fn round_count(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, round: u64) -> bool {
        (self.start..=self.end).contains(&round)
    }
}

impl fmt::Display for RoundRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Algorand transaction types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionType {
    Payment,
    KeyRegistration,
    AssetConfig,
    AssetTransfer,
    AssetFreeze,
    ApplicationCall,
    StateProof,
    Heartbeat,
    Other(String),
}

impl TransactionType {
    /// Wire name used by algod and the indexer (e.g. "appl")
    pub fn as_str(&self) -> &str {
        match self {
            TransactionType::Payment => "pay",
            TransactionType::KeyRegistration => "keyreg",
            TransactionType::AssetConfig => "acfg",
            TransactionType::AssetTransfer => "axfer",
            TransactionType::AssetFreeze => "afrz",
            TransactionType::ApplicationCall => "appl",
            TransactionType::StateProof => "stpf",
            TransactionType::Heartbeat => "hb",
            TransactionType::Other(other) => other,
        }
    }
}

impl From<&str> for TransactionType {
    fn from(value: &str) -> Self {
        match value {
            "pay" => TransactionType::Payment,
            "keyreg" => TransactionType::KeyRegistration,
            "acfg" => TransactionType::AssetConfig,
            "axfer" => TransactionType::AssetTransfer,
            "afrz" => TransactionType::AssetFreeze,
            "appl" => TransactionType::ApplicationCall,
            "stpf" => TransactionType::StateProof,
            "hb" => TransactionType::Heartbeat,
            other => TransactionType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side query a filter can be narrowed to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionQuery {
    pub tx_type: TransactionType,
    pub application_id: Option<u64>,
}

impl TransactionQuery {
    pub fn app_calls(application_id: u64) -> Self {
        Self {
            tx_type: TransactionType::ApplicationCall,
            application_id: Some(application_id),
        }
    }
}
