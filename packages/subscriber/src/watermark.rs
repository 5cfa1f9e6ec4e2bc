//! Watermark Store
//!
//! Persists the last fully processed round per subscription so a restarted
//! poll loop resumes where it left off.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::types::SubscriptionKey;

/// Prefix of the Redis key holding a subscription's watermark
pub const REDIS_KEY_PREFIX: &str = "algoblink:watermark";

/// Errors that can occur while reading or writing watermarks
#[derive(Error, Debug)]
pub enum WatermarkError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Watermark store lock poisoned")]
    Poisoned,
}

/// Last processed round per subscription key
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Returns 0 when nothing has been stored for `key`
    async fn get(&self, key: SubscriptionKey) -> Result<u64, WatermarkError>;

    async fn set(&self, key: SubscriptionKey, round: u64) -> Result<(), WatermarkError>;
}

/// Process-local store, lost on restart
#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    rounds: Mutex<HashMap<SubscriptionKey, u64>>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a starting round
    pub fn starting_at(key: SubscriptionKey, round: u64) -> Self {
        let store = Self::default();
        if let Ok(mut rounds) = store.rounds.lock() {
            rounds.insert(key, round);
        }
        store
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn get(&self, key: SubscriptionKey) -> Result<u64, WatermarkError> {
        let rounds = self.rounds.lock().map_err(|_| WatermarkError::Poisoned)?;
        Ok(rounds.get(&key).copied().unwrap_or(0))
    }

    async fn set(&self, key: SubscriptionKey, round: u64) -> Result<(), WatermarkError> {
        let mut rounds = self.rounds.lock().map_err(|_| WatermarkError::Poisoned)?;
        rounds.insert(key, round);
        Ok(())
    }
}

/// Redis-backed store, one string key per subscription
#[derive(Clone)]
pub struct RedisWatermarkStore {
    connection: MultiplexedConnection,
    prefix: String,
}

impl RedisWatermarkStore {
    /// # Arguments
    /// * `connection` - An established Redis multiplexed connection
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self::with_prefix(connection, REDIS_KEY_PREFIX)
    }

    pub fn with_prefix(connection: MultiplexedConnection, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
        }
    }

    /// Open a connection to `redis_url` and wrap it
    pub async fn connect(redis_url: &str) -> Result<Self, WatermarkError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(connection))
    }

    pub fn key_for(&self, key: SubscriptionKey) -> String {
        redis_key(&self.prefix, key)
    }
}

fn redis_key(prefix: &str, key: SubscriptionKey) -> String {
    format!("{}:{}", prefix, key.app_id())
}

#[async_trait]
impl WatermarkStore for RedisWatermarkStore {
    async fn get(&self, key: SubscriptionKey) -> Result<u64, WatermarkError> {
        let mut connection = self.connection.clone();
        let round: Option<u64> = connection.get(self.key_for(key)).await?;
        Ok(round.unwrap_or(0))
    }

    async fn set(&self, key: SubscriptionKey, round: u64) -> Result<(), WatermarkError> {
        let mut connection = self.connection.clone();
        connection.set::<_, _, ()>(self.key_for(key), round).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== InMemoryWatermarkStore tests ====================

    #[tokio::test]
    async fn test_in_memory_defaults_to_zero() {
        let store = InMemoryWatermarkStore::new();
        assert_eq!(store.get(SubscriptionKey(42)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_in_memory_set_then_get() {
        let store = InMemoryWatermarkStore::new();
        store.set(SubscriptionKey(42), 1_000).await.unwrap();
        assert_eq!(store.get(SubscriptionKey(42)).await.unwrap(), 1_000);
        assert_eq!(store.get(SubscriptionKey(43)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_in_memory_starting_at() {
        let store = InMemoryWatermarkStore::starting_at(SubscriptionKey(7), 55);
        assert_eq!(store.get(SubscriptionKey(7)).await.unwrap(), 55);
    }

    #[test]
    fn test_in_memory_outside_runtime() {
        let store = InMemoryWatermarkStore::new();
        tokio_test::assert_ok!(tokio_test::block_on(store.set(SubscriptionKey(1), 9)));
        assert_eq!(tokio_test::block_on(store.get(SubscriptionKey(1))).unwrap(), 9);
    }

    // ==================== key format tests ====================

    #[test]
    fn test_redis_key_format() {
        assert_eq!(
            redis_key(REDIS_KEY_PREFIX, SubscriptionKey(739285260)),
            "algoblink:watermark:739285260"
        );
    }

    #[test]
    fn test_watermark_error_display() {
        assert!(WatermarkError::Poisoned.to_string().contains("poisoned"));
    }
}
