//! Redis Publisher
//!
//! Publishes LED state changes for delivered transactions to a Redis pub/sub
//! channel so dashboards can update without polling.

use chrono::{DateTime, SecondsFormat, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::notifier::DeliveredTransactionRecord;
use crate::selector::LedMethod;
use crate::state::LedState;

/// Default Redis channel for LED state broadcasts
pub const DEFAULT_CHANNEL: &str = "ledState";

/// Errors that can occur during publishing
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Method {0} does not change LED state")]
    NotStateChange(String),
}

/// Broadcast event name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateEvent {
    LedOn,
    LedOff,
}

impl StateEvent {
    pub fn state(&self) -> LedState {
        match self {
            StateEvent::LedOn => LedState::On,
            StateEvent::LedOff => LedState::Off,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatePayload {
    pub tx_id: String,
    pub sender: String,
    /// RFC 3339 with millisecond precision
    pub timestamp: String,
    pub state: LedState,
}

/// Message published to the state channel
///
/// ```json
/// {"event":"ledOn","payload":{"txId":"...","sender":"...","timestamp":"...","state":"On"}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateBroadcast {
    pub event: StateEvent,
    pub payload: StatePayload,
}

impl StateBroadcast {
    /// Map a delivered record to a broadcast; `None` unless it is turnOn/turnOff
    pub fn from_record(record: &DeliveredTransactionRecord) -> Option<Self> {
        let event = match LedMethod::from_name(&record.method_name)? {
            LedMethod::TurnOn => StateEvent::LedOn,
            LedMethod::TurnOff => StateEvent::LedOff,
        };

        Some(Self::new(event, &record.id, &record.sender, Utc::now()))
    }

    pub fn new(event: StateEvent, tx_id: &str, sender: &str, at: DateTime<Utc>) -> Self {
        Self {
            event,
            payload: StatePayload {
                tx_id: tx_id.to_string(),
                sender: sender.to_string(),
                timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
                state: event.state(),
            },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Redis publisher for state broadcasts
pub struct Publisher {
    connection: MultiplexedConnection,
    channel: String,
}

impl Publisher {
    /// # Arguments
    /// * `connection` - An established Redis multiplexed connection
    /// * `channel` - The pub/sub channel name to publish to
    pub fn new(connection: MultiplexedConnection, channel: impl Into<String>) -> Self {
        Self {
            connection,
            channel: channel.into(),
        }
    }

    pub fn with_default_channel(connection: MultiplexedConnection) -> Self {
        Self::new(connection, DEFAULT_CHANNEL)
    }

    /// Publish the state change carried by a delivered record
    ///
    /// # Returns
    /// The number of subscribers that received the message
    pub async fn publish(&mut self, record: &DeliveredTransactionRecord) -> Result<i64, PublishError> {
        let broadcast = StateBroadcast::from_record(record)
            .ok_or_else(|| PublishError::NotStateChange(record.method_name.clone()))?;
        self.publish_broadcast(&broadcast).await
    }

    pub async fn publish_broadcast(&mut self, broadcast: &StateBroadcast) -> Result<i64, PublishError> {
        let json = broadcast.to_json()?;
        let subscribers: i64 = self.connection.publish(&self.channel, &json).await?;
        info!(channel = %self.channel, txid = %broadcast.payload.tx_id, subscribers, "Broadcast LED state");
        Ok(subscribers)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(method: &str) -> DeliveredTransactionRecord {
        DeliveredTransactionRecord::pending("TXN1", "SENDER", method)
    }

    // ==================== StateBroadcast tests ====================

    #[test]
    fn test_turn_on_maps_to_led_on() {
        let broadcast = StateBroadcast::from_record(&record("turnOn")).unwrap();
        assert_eq!(broadcast.event, StateEvent::LedOn);
        assert_eq!(broadcast.payload.state, LedState::On);
        assert_eq!(broadcast.payload.tx_id, "TXN1");
    }

    #[test]
    fn test_turn_off_maps_to_led_off() {
        let broadcast = StateBroadcast::from_record(&record("turnOff")).unwrap();
        assert_eq!(broadcast.event, StateEvent::LedOff);
        assert_eq!(broadcast.payload.state, LedState::Off);
    }

    #[test]
    fn test_other_methods_are_not_state_changes() {
        assert!(StateBroadcast::from_record(&record("unknown")).is_none());
        assert!(StateBroadcast::from_record(&record("TurnOn")).is_none());
    }

    #[test]
    fn test_broadcast_json_shape() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let broadcast = StateBroadcast::new(StateEvent::LedOff, "TXN9", "SENDER", at);
        let json = broadcast.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"event":"ledOff","payload":{"txId":"TXN9","sender":"SENDER","timestamp":"2024-03-01T12:00:00.000Z","state":"Off"}}"#
        );
        assert_eq!(StateBroadcast::from_json(&json).unwrap(), broadcast);
    }

    #[test]
    fn test_publish_error_display() {
        let err = PublishError::NotStateChange("unknown".to_string());
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn test_default_channel() {
        assert_eq!(DEFAULT_CHANNEL, "ledState");
    }
}
