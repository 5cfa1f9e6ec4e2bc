//! Command Payloads
//!
//! Base64-encoded JSON commands of the form
//! `{"applicationID":"739285260","command":"turnOn"}` as carried in sign
//! links.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::selector::LedMethod;

/// Errors that can occur while decoding a command payload
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to decode base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid command JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid application id: {0}")]
    InvalidApplicationId(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommandPayload {
    #[serde(rename = "applicationID")]
    application_id: String,
    command: String,
}

/// A decoded LED control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedCommand {
    pub application_id: u64,
    pub command: LedMethod,
}

impl LedCommand {
    pub fn new(application_id: u64, command: LedMethod) -> Self {
        Self {
            application_id,
            command,
        }
    }

    /// Decode a base64 payload as found in a sign link
    ///
    /// Accepts standard base64, a percent-encoded `=` padding, and the
    /// unpadded URL-safe alphabet.
    pub fn decode(encoded: &str) -> Result<Self, CommandError> {
        let encoded = encoded.trim().replace("%3D", "=").replace("%3d", "=");
        let bytes = match STANDARD.decode(&encoded) {
            Ok(bytes) => bytes,
            Err(standard_err) => URL_SAFE_NO_PAD
                .decode(encoded.trim_end_matches('='))
                .map_err(|_| standard_err)?,
        };
        Self::from_json(&bytes)
    }

    fn from_json(bytes: &[u8]) -> Result<Self, CommandError> {
        let payload: CommandPayload = serde_json::from_slice(bytes)?;

        let application_id = payload
            .application_id
            .parse::<u64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| CommandError::InvalidApplicationId(payload.application_id.clone()))?;
        let command =
            LedMethod::from_name(&payload.command).ok_or_else(|| CommandError::UnknownCommand(payload.command.clone()))?;

        Ok(Self::new(application_id, command))
    }

    /// Standard base64 of the JSON payload
    pub fn encode(&self) -> Result<String, CommandError> {
        let payload = CommandPayload {
            application_id: self.application_id.to_string(),
            command: self.command.name().to_string(),
        };
        Ok(STANDARD.encode(serde_json::to_vec(&payload)?))
    }

    /// Argument 0 of the application call this command produces
    pub fn method_arg(&self) -> Vec<u8> {
        self.command.selector().as_bytes().to_vec()
    }
}
