//! AlgoBlink Subscriber Library
//!
//! This crate polls Algorand for application calls to the AlgoBlink LED
//! controller, resolves the called method, delivers each transaction to a
//! consumer exactly once, and reads the LED state from application storage.

pub mod client;
pub mod command;
pub mod config;
pub mod decoder;
pub mod dedup;
pub mod filter;
pub mod notifier;
pub mod poller;
pub mod publisher;
pub mod recent;
pub mod selector;
pub mod state;
pub mod subscription;
pub mod types;
pub mod watermark;

// Re-export commonly used types
pub use client::{AlgodClient, FallbackIndexClient, IndexClient, IndexerClient, LedgerClient};
pub use command::LedCommand;
pub use config::SubscriberConfig;
pub use decoder::CandidateTransaction;
pub use filter::{FilterSet, TransactionFilter};
pub use notifier::{DeliveredTransactionRecord, TransactionConsumer};
pub use poller::{PollConfig, PollLoop, SyncBehaviour};
pub use publisher::{Publisher, StateBroadcast};
pub use selector::{selector_for, LedMethod, MethodResolver, MethodSelector};
pub use state::{LabelDecoder, LedState, StateReader};
pub use subscription::{SubscriptionHandle, SubscriptionState, Subscriber};
pub use types::{RoundRange, SubscriptionKey};
pub use watermark::{InMemoryWatermarkStore, RedisWatermarkStore, WatermarkStore};
