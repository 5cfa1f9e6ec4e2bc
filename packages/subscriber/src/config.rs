//! Subscriber Configuration
//!
//! TOML-backed settings for endpoints, polling, Redis and the known method
//! table. Every field has a default so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::client::{DEFAULT_ALGOD_URL, DEFAULT_INDEXER_URLS, REQUEST_TIMEOUT_MS};
use crate::poller::{
    PollConfig, SyncBehaviour, DEFAULT_FREQUENCY_MS, DEFAULT_MAX_INDEXER_ROUNDS_TO_SYNC, DEFAULT_MAX_ROUNDS_TO_SYNC,
};
use crate::publisher::DEFAULT_CHANNEL;
use crate::selector::{KnownMethod, LedMethod, MethodResolver, MethodSelector, SelectorError};
use crate::state::DEFAULT_STATE_KEY;
use crate::subscription::SubscriptionOptions;

/// Application id of the deployed LED controller on TestNet
pub const DEFAULT_APPLICATION_ID: u64 = 739285260;

/// Config file location relative to the user config directory
pub const CONFIG_FILE: &str = "algoblink/subscriber.toml";

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid method entry: {0}")]
    Method(#[from] SelectorError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgodSettings {
    pub url: String,
    pub token: Option<String>,
}

impl Default for AlgodSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_ALGOD_URL.to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerSettings {
    /// Endpoints in rank order
    pub urls: Vec<String>,
    pub token: Option<String>,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            urls: DEFAULT_INDEXER_URLS.iter().map(|u| u.to_string()).collect(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub frequency_ms: u64,
    pub max_rounds_to_sync: u64,
    /// 0 disables the bound
    pub max_indexer_rounds_to_sync: u64,
    pub sync_behaviour: SyncBehaviour,
    pub request_timeout_ms: u64,
    pub dedup_capacity: Option<usize>,
    pub start_round: Option<u64>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            frequency_ms: DEFAULT_FREQUENCY_MS,
            max_rounds_to_sync: DEFAULT_MAX_ROUNDS_TO_SYNC,
            max_indexer_rounds_to_sync: DEFAULT_MAX_INDEXER_ROUNDS_TO_SYNC,
            sync_behaviour: SyncBehaviour::default(),
            request_timeout_ms: REQUEST_TIMEOUT_MS,
            dedup_capacity: None,
            start_round: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Unset keeps watermarks in memory and disables broadcasts
    pub url: Option<String>,
    pub channel: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            channel: DEFAULT_CHANNEL.to_string(),
        }
    }
}

/// A method the resolver should recognise
///
/// Exactly one of `signature` or `selector` must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodConfig {
    pub name: String,
    /// ARC-4 signature, e.g. "turnOn()void"
    pub signature: Option<String>,
    /// Pinned selector hex
    pub selector: Option<String>,
    /// Extra exact first-argument values, as UTF-8
    pub aliases: Vec<String>,
}

impl MethodConfig {
    fn from_led(method: LedMethod) -> Self {
        Self {
            name: method.name().to_string(),
            signature: None,
            selector: Some(method.selector().hex()),
            aliases: vec![method.name().to_string()],
        }
    }

    pub fn to_known_method(&self) -> Result<KnownMethod, ConfigError> {
        let base = match (&self.signature, &self.selector) {
            (Some(signature), None) => {
                let mut method = KnownMethod::from_signature(signature)?;
                if !self.name.is_empty() {
                    method.name = self.name.clone();
                }
                method
            }
            (None, Some(selector)) => KnownMethod::new(self.name.clone(), MethodSelector::from_hex(selector)?),
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "method '{}' needs exactly one of signature or selector",
                    self.name
                )))
            }
        };

        Ok(self
            .aliases
            .iter()
            .fold(base, |method, alias| method.with_alias(alias.as_bytes())))
    }
}

/// Top-level subscriber configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    pub application_id: u64,
    pub algod: AlgodSettings,
    pub indexer: IndexerSettings,
    pub poll: PollSettings,
    pub redis: RedisSettings,
    /// Raw global-state key holding the LED label
    pub state_key: String,
    pub methods: Vec<MethodConfig>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            application_id: DEFAULT_APPLICATION_ID,
            algod: AlgodSettings::default(),
            indexer: IndexerSettings::default(),
            poll: PollSettings::default(),
            redis: RedisSettings::default(),
            state_key: DEFAULT_STATE_KEY.to_string(),
            methods: LedMethod::ALL.into_iter().map(MethodConfig::from_led).collect(),
        }
    }
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

impl SubscriberConfig {
    /// `<config_dir>/algoblink/subscriber.toml`, if a config dir exists
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let expanded = expand_path(&path.as_ref().to_string_lossy());
        let contents = std::fs::read_to_string(&expanded).map_err(|source| ConfigError::Io {
            path: expanded.clone(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Load `path`, or the default location, falling back to defaults
    /// when no explicit path was given and the default file is absent
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(default) if default.exists() => Self::from_file(default),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_id == 0 {
            return Err(ConfigError::Invalid("application_id must be positive".to_string()));
        }
        if self.algod.url.is_empty() {
            return Err(ConfigError::Invalid("algod.url cannot be empty".to_string()));
        }
        if self.indexer.urls.iter().any(String::is_empty) {
            return Err(ConfigError::Invalid("indexer.urls cannot contain empty entries".to_string()));
        }
        if self.indexer.urls.is_empty() {
            warn!("No indexer endpoints configured; catch-up and state reads will fail");
        }
        if self.poll.frequency_ms == 0 {
            return Err(ConfigError::Invalid("poll.frequency_ms must be positive".to_string()));
        }
        if self.poll.max_rounds_to_sync == 0 {
            return Err(ConfigError::Invalid("poll.max_rounds_to_sync must be positive".to_string()));
        }
        if self.poll.dedup_capacity == Some(0) {
            return Err(ConfigError::Invalid("poll.dedup_capacity must be positive".to_string()));
        }
        if self.state_key.is_empty() {
            return Err(ConfigError::Invalid("state_key cannot be empty".to_string()));
        }
        if self.methods.is_empty() {
            return Err(ConfigError::Invalid("at least one method is required".to_string()));
        }
        for method in &self.methods {
            method.to_known_method()?;
        }
        Ok(())
    }

    /// Resolver over the configured methods, in file order
    pub fn resolver(&self) -> Result<MethodResolver, ConfigError> {
        let methods = self
            .methods
            .iter()
            .map(MethodConfig::to_known_method)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MethodResolver::new(methods))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.poll.request_timeout_ms)
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            frequency: Duration::from_millis(self.poll.frequency_ms),
            max_rounds_to_sync: self.poll.max_rounds_to_sync,
            max_indexer_rounds_to_sync: match self.poll.max_indexer_rounds_to_sync {
                0 => None,
                limit => Some(limit),
            },
            sync_behaviour: self.poll.sync_behaviour,
        }
    }

    pub fn subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            poll: self.poll_config(),
            dedup_capacity: self.poll.dedup_capacity,
            start_round: self.poll.start_round,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // ==================== defaults tests ====================

    #[test]
    fn test_defaults() {
        let config = SubscriberConfig::default();
        assert_eq!(config.application_id, 739285260);
        assert_eq!(config.algod.url, "https://testnet-api.algonode.cloud");
        assert_eq!(config.indexer.urls.len(), 3);
        assert_eq!(config.indexer.urls[0], "https://testnet-idx.4160.nodely.dev");
        assert_eq!(config.poll.frequency_ms, 5_000);
        assert_eq!(config.poll.max_rounds_to_sync, 10);
        assert_eq!(config.poll.max_indexer_rounds_to_sync, 100_000);
        assert_eq!(config.redis.channel, "ledState");
        assert_eq!(config.state_key, "led");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_resolver_matches_led_methods() {
        let resolver = SubscriberConfig::default().resolver().unwrap();
        assert_eq!(resolver.classify(&[0xf7, 0x8f, 0x4f, 0x2d]), "turnOn");
        assert_eq!(resolver.classify(b"turnOff"), "turnOff");
    }

    #[test]
    fn test_poll_config_conversion() {
        let mut config = SubscriberConfig::default();
        config.poll.max_indexer_rounds_to_sync = 0;
        let poll = config.poll_config();
        assert_eq!(poll.frequency, Duration::from_secs(5));
        assert_eq!(poll.max_indexer_rounds_to_sync, None);
    }

    // ==================== TOML loading tests ====================

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SubscriberConfig::from_toml(
            r#"
            application_id = 42

            [poll]
            frequency_ms = 1000
            sync_behaviour = "sync-oldest"
            "#,
        )
        .unwrap();
        assert_eq!(config.application_id, 42);
        assert_eq!(config.poll.frequency_ms, 1000);
        assert_eq!(config.poll.sync_behaviour, SyncBehaviour::SyncOldest);
        assert_eq!(config.poll.max_rounds_to_sync, 10);
        assert_eq!(config.methods.len(), 2);
    }

    #[test]
    fn test_methods_from_toml() {
        let config = SubscriberConfig::from_toml(
            r#"
            [[methods]]
            name = "setLed"
            signature = "setLed(string)void"

            [[methods]]
            name = "ping"
            selector = "0x01020304"
            aliases = ["ping"]
            "#,
        )
        .unwrap();
        let resolver = config.resolver().unwrap();
        assert_eq!(resolver.classify(&[0xf5, 0x92, 0x05, 0x82]), "setLed");
        assert_eq!(resolver.classify(&[1, 2, 3, 4]), "ping");
        assert_eq!(resolver.classify(b"ping"), "ping");
    }

    #[test]
    fn test_method_needs_one_source() {
        let result = SubscriberConfig::from_toml(
            r#"
            [[methods]]
            name = "broken"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_selector_rejected() {
        let result = SubscriberConfig::from_toml(
            r#"
            [[methods]]
            name = "bad"
            selector = "zz"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Method(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(SubscriberConfig::from_toml("application_id = 0").is_err());
        assert!(SubscriberConfig::from_toml("[poll]\nfrequency_ms = 0").is_err());
        assert!(SubscriberConfig::from_toml("[poll]\ndedup_capacity = 0").is_err());
        assert!(matches!(
            SubscriberConfig::from_toml("application_id = \"x\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[redis]\nurl = \"redis://127.0.0.1:6379\"").unwrap();
        let config = SubscriberConfig::from_file(file.path()).unwrap();
        assert_eq!(config.redis.url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.redis.channel, "ledState");
    }

    #[test]
    fn test_from_missing_file() {
        let result = SubscriberConfig::from_file("/nonexistent/algoblink.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
        assert!(SubscriberConfig::load(Some("/nonexistent/algoblink.toml")).is_err());
    }

    // ==================== expand_path tests ====================

    #[test]
    fn test_expand_path_with_tilde() {
        let expanded = expand_path("~/algoblink/subscriber.toml");
        assert!(!expanded.starts_with("~/"));
        assert!(expanded.ends_with("algoblink/subscriber.toml"));
    }

    #[test]
    fn test_expand_path_tilde_in_middle() {
        let path = "/etc/~algoblink/subscriber.toml";
        assert_eq!(expand_path(path), path);
    }

    #[test]
    fn test_default_path_file_name() {
        if let Some(path) = SubscriberConfig::default_path() {
            assert!(path.ends_with("algoblink/subscriber.toml"));
        }
    }
}
