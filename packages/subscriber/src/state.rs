//! Application State Reader
//!
//! Reads an application's current global state from a ranked list of index
//! endpoints and decodes the configured entry.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::{ClientError, IndexClient};
use crate::decoder::ApplicationState;

/// Global-state key holding the LED label
pub const DEFAULT_STATE_KEY: &str = "led";

/// Width of the big-endian length prefix in front of a label
pub const LABEL_LENGTH_PREFIX: usize = 2;

/// TEAL value type tag for byte strings
const TEAL_BYTES: u8 = 1;

/// One endpoint's failure, kept for [`StateError::Exhausted`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    pub endpoint: String,
    pub error: String,
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.error)
    }
}

fn join_failures(failures: &[EndpointFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Errors that can occur while reading application state
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Global state key {0} not found")]
    MissingKey(String),

    #[error("Global state value for {0} is not a byte string")]
    NotBytes(String),

    #[error("Failed to decode base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Malformed label: {0}")]
    Framing(String),

    #[error("Label is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Endpoint request failed: {0}")]
    Client(#[from] ClientError),

    #[error("No state endpoints configured")]
    NoEndpoints,

    #[error("All {} state endpoints failed: {}", .0.len(), join_failures(.0))]
    Exhausted(Vec<EndpointFailure>),
}

/// Turns an application's global state into a display value
pub trait GlobalStateDecoder: Send + Sync {
    fn decode(&self, state: &ApplicationState) -> Result<String, StateError>;
}

/// Decodes a length-prefixed UTF-8 label stored under one key
///
/// The stored bytes are a 2-byte big-endian length followed by exactly that
/// many bytes of UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelDecoder {
    key_b64: String,
}

impl Default for LabelDecoder {
    fn default() -> Self {
        Self::for_key(DEFAULT_STATE_KEY)
    }
}

impl LabelDecoder {
    /// Decoder for a raw (not yet base64-encoded) key name
    pub fn for_key(key: &str) -> Self {
        Self {
            key_b64: STANDARD.encode(key.as_bytes()),
        }
    }

    pub fn key_b64(&self) -> &str {
        &self.key_b64
    }
}

/// Strip and verify the length prefix of a stored label
pub fn decode_label(bytes: &[u8]) -> Result<String, StateError> {
    if bytes.len() < LABEL_LENGTH_PREFIX {
        return Err(StateError::Framing(format!(
            "{} bytes is shorter than the length prefix",
            bytes.len()
        )));
    }

    let (prefix, body) = bytes.split_at(LABEL_LENGTH_PREFIX);
    let declared = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
    if declared != body.len() {
        return Err(StateError::Framing(format!(
            "declared length {} but {} bytes follow",
            declared,
            body.len()
        )));
    }

    Ok(String::from_utf8(body.to_vec())?)
}

impl GlobalStateDecoder for LabelDecoder {
    fn decode(&self, state: &ApplicationState) -> Result<String, StateError> {
        let entry = state
            .entry(&self.key_b64)
            .ok_or_else(|| StateError::MissingKey(self.key_b64.clone()))?;
        if entry.value.value_type != TEAL_BYTES {
            return Err(StateError::NotBytes(self.key_b64.clone()));
        }

        let raw = STANDARD.decode(&entry.value.bytes)?;
        decode_label(&raw)
    }
}

/// On/off state of the LED application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedState {
    On,
    Off,
}

impl LedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedState::On => "On",
            LedState::Off => "Off",
        }
    }

    /// Parse a decoded label, case-insensitively
    pub fn from_label(label: &str) -> Option<Self> {
        if label.eq_ignore_ascii_case("on") {
            Some(LedState::On)
        } else if label.eq_ignore_ascii_case("off") {
            Some(LedState::Off)
        } else {
            None
        }
    }
}

impl fmt::Display for LedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-demand state reads with ranked fallback
#[derive(Clone)]
pub struct StateReader {
    endpoints: Vec<Arc<dyn IndexClient>>,
    decoder: Arc<dyn GlobalStateDecoder>,
}

impl StateReader {
    /// # Arguments
    /// * `endpoints` - Index endpoints in rank order; index 0 is tried first
    /// * `decoder` - Applied to each endpoint's response
    pub fn new(endpoints: Vec<Arc<dyn IndexClient>>, decoder: Arc<dyn GlobalStateDecoder>) -> Self {
        Self { endpoints, decoder }
    }

    /// Reader using the default [`LabelDecoder`]
    pub fn with_label_decoder(endpoints: Vec<Arc<dyn IndexClient>>) -> Self {
        Self::new(endpoints, Arc::new(LabelDecoder::default()))
    }

    async fn read_from(&self, endpoint: &dyn IndexClient, application_id: u64) -> Result<String, StateError> {
        let state = endpoint.lookup_application(application_id).await?;
        self.decoder.decode(&state)
    }

    /// Read and decode the current state of `application_id`
    ///
    /// # Returns
    /// The first endpoint's successful decode; later endpoints are not
    /// contacted. [`StateError::Exhausted`] lists every failure when none
    /// succeeds.
    pub async fn read_current_state(&self, application_id: u64) -> Result<String, StateError> {
        if self.endpoints.is_empty() {
            return Err(StateError::NoEndpoints);
        }

        let mut failures = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            match self.read_from(endpoint.as_ref(), application_id).await {
                Ok(value) => {
                    debug!(app_id = application_id, endpoint = %endpoint.endpoint(), value = %value, "Read application state");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(app_id = application_id, endpoint = %endpoint.endpoint(), error = %e, "State read failed, trying next endpoint");
                    failures.push(EndpointFailure {
                        endpoint: endpoint.endpoint(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Err(StateError::Exhausted(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockIndexClient;
    use crate::decoder::{GlobalStateEntry, TealValue};

    fn state_with(key: &str, bytes: &str) -> ApplicationState {
        ApplicationState {
            application_id: 42,
            global_state: vec![GlobalStateEntry {
                key: key.to_string(),
                value: TealValue {
                    value_type: TEAL_BYTES,
                    bytes: bytes.to_string(),
                    uint: 0,
                },
            }],
        }
    }

    fn failing(name: &'static str) -> MockIndexClient {
        let mut client = MockIndexClient::new();
        client.expect_endpoint().return_const(name.to_string());
        client.expect_lookup_application().times(1).returning(move |_| {
            Err(ClientError::Status {
                endpoint: name.to_string(),
                status: 503,
            })
        });
        client
    }

    fn serving(name: &'static str, bytes: &'static str) -> MockIndexClient {
        let mut client = MockIndexClient::new();
        client.expect_endpoint().return_const(name.to_string());
        client
            .expect_lookup_application()
            .times(1)
            .returning(move |_| Ok(state_with("bGVk", bytes)));
        client
    }

    // ==================== LabelDecoder tests ====================

    #[test]
    fn test_default_key_is_led() {
        assert_eq!(LabelDecoder::default().key_b64(), "bGVk");
    }

    #[test]
    fn test_decode_on_and_off() {
        let decoder = LabelDecoder::default();
        assert_eq!(decoder.decode(&state_with("bGVk", "AAJPbg==")).unwrap(), "On");
        assert_eq!(decoder.decode(&state_with("bGVk", "AANPZmY=")).unwrap(), "Off");
    }

    #[test]
    fn test_decode_missing_key() {
        let decoder = LabelDecoder::default();
        let result = decoder.decode(&state_with("b3RoZXI=", "AAJPbg=="));
        assert!(matches!(result, Err(StateError::MissingKey(_))));
    }

    #[test]
    fn test_decode_uint_value_rejected() {
        let mut state = state_with("bGVk", "");
        state.global_state[0].value.value_type = 2;
        assert!(matches!(
            LabelDecoder::default().decode(&state),
            Err(StateError::NotBytes(_))
        ));
    }

    #[test]
    fn test_decode_label_length_mismatch() {
        assert!(matches!(decode_label(&[0, 3, b'O', b'n']), Err(StateError::Framing(_))));
        assert!(matches!(decode_label(&[0, 1, b'O', b'n']), Err(StateError::Framing(_))));
        assert!(matches!(decode_label(&[0]), Err(StateError::Framing(_))));
    }

    #[test]
    fn test_decode_label_empty_body() {
        assert_eq!(decode_label(&[0, 0]).unwrap(), "");
    }

    #[test]
    fn test_decode_label_invalid_utf8() {
        assert!(matches!(decode_label(&[0, 2, 0xff, 0xfe]), Err(StateError::Utf8(_))));
    }

    #[test]
    fn test_led_state_from_label() {
        assert_eq!(LedState::from_label("On"), Some(LedState::On));
        assert_eq!(LedState::from_label("off"), Some(LedState::Off));
        assert_eq!(LedState::from_label("dim"), None);
        assert_eq!(LedState::Off.to_string(), "Off");
    }

    // ==================== StateReader tests ====================

    #[tokio::test]
    async fn test_primary_success_skips_others() {
        let mut secondary = MockIndexClient::new();
        secondary.expect_lookup_application().never();

        let reader = StateReader::with_label_decoder(vec![
            Arc::new(serving("primary", "AAJPbg==")),
            Arc::new(secondary),
        ]);
        assert_eq!(reader.read_current_state(42).await.unwrap(), "On");
    }

    #[tokio::test]
    async fn test_falls_through_to_secondary() {
        let reader = StateReader::with_label_decoder(vec![
            Arc::new(failing("primary")),
            Arc::new(serving("secondary", "AAJPbg==")),
        ]);
        assert_eq!(reader.read_current_state(42).await.unwrap(), "On");
    }

    #[tokio::test]
    async fn test_decode_failure_falls_through() {
        let reader = StateReader::with_label_decoder(vec![
            Arc::new(serving("primary", "AANPbg==")),
            Arc::new(serving("secondary", "AANPZmY=")),
        ]);
        assert_eq!(reader.read_current_state(42).await.unwrap(), "Off");
    }

    #[tokio::test]
    async fn test_exhausted_lists_every_failure() {
        let reader = StateReader::with_label_decoder(vec![
            Arc::new(failing("a")),
            Arc::new(failing("b")),
            Arc::new(failing("c")),
        ]);
        match reader.read_current_state(42).await {
            Err(StateError::Exhausted(failures)) => {
                let names: Vec<&str> = failures.iter().map(|f| f.endpoint.as_str()).collect();
                assert_eq!(names, vec!["a", "b", "c"]);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_endpoints() {
        let reader = StateReader::with_label_decoder(Vec::new());
        assert!(matches!(reader.read_current_state(42).await, Err(StateError::NoEndpoints)));
    }
}
