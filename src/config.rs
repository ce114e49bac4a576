//! Strongly-typed configuration for the tracking service.
//!
//! Values start from [`TrackerConfig::default`] and can be loaded from the
//! process environment (after an optional `.env` file) with
//! [`TrackerConfig::from_env`]. Every variable is optional; malformed values
//! surface as a [`ConfigError`] naming the offending variable.

use std::env;
use std::fmt;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dotenvy::dotenv;
use serde::de::{Deserialize, Deserializer, Error as DeError};
use serde::ser::{Serialize, Serializer};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

type JsonObject = JsonMap<String, JsonValue>;

pub const DEFAULT_CDP_URL: &str = "http://localhost:9222";
/// Upper bound for `TRACKER_CACHE_TTL_DAYS` (about a century).
pub const MAX_CACHE_TTL_DAYS: u64 = 36_500;
pub const DEFAULT_HUB_URL: &str = "http://seacargotracking.net";
pub const DEFAULT_CARRIER: &str = "hmm";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";

/// Shared logger callback signature used by the LLM client.
pub type LoggerCallback = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Verbosity level for tracker logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Minimal,
    Medium,
    Detailed,
}

impl Verbosity {
    pub fn as_u8(self) -> u8 {
        match self {
            Verbosity::Minimal => 0,
            Verbosity::Medium => 1,
            Verbosity::Detailed => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Verbosity::Minimal),
            1 => Some(Verbosity::Medium),
            2 => Some(Verbosity::Detailed),
            _ => None,
        }
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Medium
    }
}

impl Serialize for Verbosity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Verbosity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        Verbosity::from_u8(value).ok_or_else(|| {
            DeError::custom(format!(
                "invalid verbosity value {value}; expected 0, 1, or 2"
            ))
        })
    }
}

/// How the driver obtains a browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserConnection {
    /// Attach to an already running Chrome over the DevTools protocol.
    AttachCdp { url: String },
    /// Launch a local Chrome with a persistent profile.
    Launch {
        chrome_executable: Option<PathBuf>,
        user_data_dir: Option<PathBuf>,
        headless: bool,
    },
}

impl Default for BrowserConnection {
    fn default() -> Self {
        BrowserConnection::AttachCdp {
            url: DEFAULT_CDP_URL.to_string(),
        }
    }
}

/// Model names per oracle role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub reasoning: String,
    pub vision: String,
    pub evaluator: String,
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self {
            reasoning: "gpt-4.1-mini".to_string(),
            vision: "gpt-4o".to_string(),
            evaluator: "gpt-4o-mini".to_string(),
        }
    }
}

/// Configuration values for the tracking service.
#[derive(Clone)]
pub struct TrackerConfig {
    pub model_api_key: Option<String>,
    pub models: ModelSelection,
    pub model_client_options: Option<JsonObject>,
    pub logger: Option<LoggerCallback>,
    pub verbose: Verbosity,
    pub browser: BrowserConnection,
    pub cache_dir: PathBuf,
    pub cache_ttl_days: i64,
    pub log_dir: PathBuf,
    pub save_screenshots: bool,
    pub max_steps: usize,
    pub max_folds: usize,
    pub hub_url: String,
    /// Hosts that generated `navigate` instructions may target.
    pub allowed_hosts: Vec<String>,
    pub default_carrier: String,
    pub bind_addr: String,
    pub click_settle: Duration,
    pub action_settle: Duration,
    pub fold_settle: Duration,
    pub page_load_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            model_api_key: None,
            models: ModelSelection::default(),
            model_client_options: None,
            logger: None,
            verbose: Verbosity::default(),
            browser: BrowserConnection::default(),
            cache_dir: PathBuf::from("cache"),
            cache_ttl_days: 14,
            log_dir: PathBuf::from("logs"),
            save_screenshots: false,
            max_steps: 20,
            max_folds: 6,
            hub_url: DEFAULT_HUB_URL.to_string(),
            allowed_hosts: vec!["seacargotracking.net".to_string()],
            default_carrier: DEFAULT_CARRIER.to_string(),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            click_settle: Duration::from_millis(2_500),
            action_settle: Duration::from_millis(1_500),
            fold_settle: Duration::from_millis(450),
            page_load_timeout: Duration::from_secs(10),
        }
    }
}

impl TrackerConfig {
    /// Construct a configuration by reading relevant environment variables, after
    /// loading a `.env` file if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv();
        let mut config = TrackerConfig::default();

        if let Some(value) = env_var("MODEL_API_KEY").or_else(|| env_var("OPENAI_API_KEY")) {
            config.model_api_key = Some(value);
        }

        if let Some(value) = env_var("MODEL_NAME") {
            config.models.reasoning = value;
        }

        if let Some(value) = env_var("VISION_MODEL_NAME") {
            config.models.vision = value;
        }

        if let Some(value) = env_var("EVALUATOR_MODEL_NAME") {
            config.models.evaluator = value;
        }

        if let Some(value) = env_var("MODEL_CLIENT_OPTIONS") {
            config.model_client_options = Some(parse_json_object("MODEL_CLIENT_OPTIONS", &value)?);
        }

        if let Some(value) = env_var("TRACKER_VERBOSE") {
            let parsed = parse_u8("TRACKER_VERBOSE", &value)?;
            config.verbose = Verbosity::from_u8(parsed).ok_or_else(|| {
                ConfigError::invalid_enum("TRACKER_VERBOSE", parsed.to_string())
            })?;
        }

        let headless = match env_var("TRACKER_HEADLESS") {
            Some(value) => parse_bool("TRACKER_HEADLESS", &value)?,
            None => false,
        };

        if let Some(value) = env_var("TRACKER_CHROME_BIN") {
            config.browser = BrowserConnection::Launch {
                chrome_executable: Some(PathBuf::from(value)),
                user_data_dir: env_var("TRACKER_USER_DATA_DIR").map(PathBuf::from),
                headless,
            };
        } else if let Some(value) = env_var("TRACKER_CDP_URL") {
            config.browser = BrowserConnection::AttachCdp { url: value };
        }

        if let Some(value) = env_var("TRACKER_CACHE_DIR") {
            config.cache_dir = PathBuf::from(value);
        }

        if let Some(value) = env_var("TRACKER_CACHE_TTL_DAYS") {
            config.cache_ttl_days = parse_ttl_days("TRACKER_CACHE_TTL_DAYS", &value)?;
        }

        if let Some(value) = env_var("TRACKER_LOG_DIR") {
            config.log_dir = PathBuf::from(value);
        }

        if let Some(value) = env_var("TRACKER_SAVE_SCREENSHOTS") {
            config.save_screenshots = parse_bool("TRACKER_SAVE_SCREENSHOTS", &value)?;
        }

        if let Some(value) = env_var("TRACKER_MAX_STEPS") {
            config.max_steps = parse_u64("TRACKER_MAX_STEPS", &value)? as usize;
        }

        if let Some(value) = env_var("TRACKER_MAX_FOLDS") {
            config.max_folds = parse_u64("TRACKER_MAX_FOLDS", &value)?.max(1) as usize;
        }

        if let Some(value) = env_var("TRACKER_HUB_URL") {
            config.hub_url = value;
        }

        if let Some(value) = env_var("TRACKER_ALLOWED_HOSTS") {
            config.allowed_hosts = parse_list(&value);
        }

        if let Some(value) = env_var("TRACKER_DEFAULT_CARRIER") {
            config.default_carrier = value.to_ascii_lowercase();
        }

        if let Some(value) = env_var("TRACKER_BIND_ADDR") {
            config.bind_addr = value;
        }

        if let Some(value) = env_var("TRACKER_CLICK_SETTLE_MS") {
            config.click_settle = Duration::from_millis(parse_u64("TRACKER_CLICK_SETTLE_MS", &value)?);
        }

        if let Some(value) = env_var("TRACKER_ACTION_SETTLE_MS") {
            config.action_settle =
                Duration::from_millis(parse_u64("TRACKER_ACTION_SETTLE_MS", &value)?);
        }

        config.ensure_hub_allowed();
        Ok(config)
    }

    /// Zero every settle delay. Used by tests driving scripted browsers.
    pub fn without_delays(mut self) -> Self {
        self.click_settle = Duration::ZERO;
        self.action_settle = Duration::ZERO;
        self.fold_settle = Duration::ZERO;
        self
    }

    /// Host component of the configured hub URL, if it parses.
    pub fn hub_host(&self) -> Option<String> {
        url::Url::parse(&self.hub_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }

    fn ensure_hub_allowed(&mut self) {
        if let Some(host) = self.hub_host() {
            let host = host.trim_start_matches("www.").to_string();
            if !self.allowed_hosts.iter().any(|existing| existing == &host) {
                self.allowed_hosts.push(host);
            }
        }
    }
}

impl fmt::Debug for TrackerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerConfig")
            .field("model_api_key", &self.model_api_key.as_ref().map(|_| "<set>"))
            .field("models", &self.models)
            .field("model_client_options", &self.model_client_options)
            .field("verbose", &self.verbose)
            .field("browser", &self.browser)
            .field("cache_dir", &self.cache_dir)
            .field("cache_ttl_days", &self.cache_ttl_days)
            .field("log_dir", &self.log_dir)
            .field("save_screenshots", &self.save_screenshots)
            .field("max_steps", &self.max_steps)
            .field("max_folds", &self.max_folds)
            .field("hub_url", &self.hub_url)
            .field("allowed_hosts", &self.allowed_hosts)
            .field("default_carrier", &self.default_carrier)
            .field("bind_addr", &self.bind_addr)
            .field("click_settle", &self.click_settle)
            .field("action_settle", &self.action_settle)
            .field("logger_present", &self.logger.is_some())
            .finish()
    }
}

/// Errors that can arise while constructing a [`TrackerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {field}")]
    InvalidEnumVariant { field: &'static str, value: String },
    #[error("invalid boolean '{value}' for {field}")]
    InvalidBool { field: &'static str, value: String },
    #[error("invalid number '{value}' for {field}: {source}")]
    InvalidNumber {
        field: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("{field} must be between 1 and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: String,
        max: u64,
    },
    #[error("{field} must be a JSON object")]
    InvalidJsonType { field: &'static str },
    #[error("invalid JSON for {field}: {source}")]
    InvalidJson {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    fn invalid_enum(field: &'static str, value: String) -> Self {
        ConfigError::InvalidEnumVariant { field, value }
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            field,
            value: value.to_string(),
        }),
    }
}

fn parse_u8(field: &'static str, value: &str) -> Result<u8, ConfigError> {
    value
        .trim()
        .parse::<u8>()
        .map_err(|source| ConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|source| ConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_ttl_days(field: &'static str, value: &str) -> Result<i64, ConfigError> {
    let days = parse_u64(field, value)?;
    if days == 0 || days > MAX_CACHE_TTL_DAYS {
        return Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            max: MAX_CACHE_TTL_DAYS,
        });
    }
    i64::try_from(days).map_err(|_| ConfigError::OutOfRange {
        field,
        value: value.to_string(),
        max: MAX_CACHE_TTL_DAYS,
    })
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_json_object(field: &'static str, value: &str) -> Result<JsonObject, ConfigError> {
    let parsed: JsonValue = serde_json::from_str(value)
        .map_err(|source| ConfigError::InvalidJson { field, source })?;
    match parsed {
        JsonValue::Object(map) => Ok(map),
        _ => Err(ConfigError::InvalidJsonType { field }),
    }
}
