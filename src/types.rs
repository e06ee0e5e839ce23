use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MonaError, Result};

pub const DEFAULT_AUTH_API_TOKEN_URL: &str =
    "https://monalabs.frontegg.com/identity/resources/auth/v1/api-token";
pub const DEFAULT_REFRESH_TOKEN_URL: &str =
    "https://monalabs.frontegg.com/identity/resources/auth/v1/api-token/token/refresh";
pub const DEFAULT_LOGGER_NAME: &str = "mona-logger";

/// Merge policy applied by the backend when a message arrives for a context
/// id that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// Replace the stored value of every field present in the message.
    #[default]
    Overwrite,
    /// Add numeric fields to the stored values.
    Add,
    /// Only set fields that have no stored value yet.
    New,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Overwrite => "OVERWRITE",
            Action::Add => "ADD",
            Action::New => "NEW",
        };
        f.write_str(s)
    }
}

impl FromStr for Action {
    type Err = MonaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "OVERWRITE" => Ok(Action::Overwrite),
            "ADD" => Ok(Action::Add),
            "NEW" => Ok(Action::New),
            other => Err(MonaError::Validation(format!("unknown action '{other}'"))),
        }
    }
}

/// Export timestamp as supplied by the caller: an ISO-8601 string or a Unix
/// epoch in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Epoch(f64),
    Iso(String),
}

impl From<&str> for Timestamp {
    fn from(s: &str) -> Self {
        Timestamp::Iso(s.to_string())
    }
}

impl From<String> for Timestamp {
    fn from(s: String) -> Self {
        Timestamp::Iso(s)
    }
}

impl From<i64> for Timestamp {
    fn from(secs: i64) -> Self {
        Timestamp::Epoch(secs as f64)
    }
}

impl From<f64> for Timestamp {
    fn from(secs: f64) -> Self {
        Timestamp::Epoch(secs)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Timestamp::Iso(dt.to_rfc3339())
    }
}

/// A single message about one context instance.
///
/// `context_id` groups messages into one aggregated record on the backend.
/// When it is omitted a random id is generated at export time, which means
/// the record can never be updated by a later message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleMessage {
    pub context_class: String,
    /// JSON object with the monitored fields.
    pub message: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_timestamp: Option<Timestamp>,
    /// Falls back to the batch default action when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_config_name: Option<String>,
}

impl SingleMessage {
    pub fn new(context_class: impl Into<String>, message: serde_json::Value) -> Self {
        Self {
            context_class: context_class.into(),
            message,
            context_id: None,
            export_timestamp: None,
            action: None,
            sample_config_name: None,
        }
    }

    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn with_timestamp(mut self, ts: impl Into<Timestamp>) -> Self {
        self.export_timestamp = Some(ts.into());
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_sample_config_name(mut self, name: impl Into<String>) -> Self {
        self.sample_config_name = Some(name.into());
        self
    }
}

/// Sampling rates: a default plus per-context-class overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub default_rate: f64,
    pub per_class: HashMap<String, f64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            default_rate: 1.0,
            per_class: HashMap::new(),
        }
    }
}

impl SamplingConfig {
    pub fn new(default_rate: f64, per_class: HashMap<String, f64>) -> Result<Self> {
        let config = Self {
            default_rate,
            per_class,
        };
        config.validate()?;
        Ok(config)
    }

    /// Every rate must lie in [0, 1].
    pub fn validate(&self) -> Result<()> {
        check_rate("default sampling rate", self.default_rate)?;
        for (class, rate) in &self.per_class {
            check_rate(&format!("sampling rate of '{class}'"), *rate)?;
        }
        Ok(())
    }

    pub fn rate_for(&self, context_class: &str) -> f64 {
        self.per_class
            .get(context_class)
            .copied()
            .unwrap_or(self.default_rate)
    }
}

fn check_rate(what: &str, rate: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&rate) {
        return Err(MonaError::Validation(format!(
            "{what} must be within [0, 1], got {rate}"
        )));
    }
    Ok(())
}

/// One message that was not delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFailure {
    /// Position in the exported batch, when the backend identified it.
    pub index: Option<usize>,
    pub context_id: Option<String>,
    pub reason: String,
}

/// Outcome of one `export` / `export_batch` call.
///
/// `total == sent + sampled_out + failed` always holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportResult {
    pub success: bool,
    pub total: usize,
    pub sent: usize,
    pub sampled_out: usize,
    pub failed: usize,
    pub failures: Vec<MessageFailure>,
}

impl ExportResult {
    /// Result for a batch in which nothing could be sent.
    pub(crate) fn all_failed(messages: &[SingleMessage], reason: &str) -> Self {
        Self {
            success: messages.is_empty(),
            total: messages.len(),
            sent: 0,
            sampled_out: 0,
            failed: messages.len(),
            failures: messages
                .iter()
                .enumerate()
                .map(|(index, m)| MessageFailure {
                    index: Some(index),
                    context_id: m.context_id.clone(),
                    reason: reason.to_string(),
                })
                .collect(),
        }
    }

    /// Indices of the failed messages the backend could attribute.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failures.iter().filter_map(|f| f.index).collect()
    }
}

/// Standard envelope returned by every service endpoint wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error_message: String,
}

impl ServiceResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error_message: String::new(),
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error_message: error_message.into(),
        }
    }
}

/// How the client obtains its bearer token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMode {
    /// Api key + secret exchanged for an access token (with refresh tokens).
    #[default]
    Mona,
    /// OAuth2 client-credentials grant.
    Oidc,
    /// Caller-provided token, never refreshed.
    ManualToken,
    /// No Authorization header at all.
    NoAuth,
}

impl FromStr for AuthMode {
    type Err = MonaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MONA" => Ok(AuthMode::Mona),
            "OIDC" => Ok(AuthMode::Oidc),
            "MANUAL_TOKEN" => Ok(AuthMode::ManualToken),
            "NO_AUTH" => Ok(AuthMode::NoAuth),
            other => Err(MonaError::Validation(format!("unknown auth mode '{other}'"))),
        }
    }
}

/// Configuration for the Mona client.
#[derive(Clone)]
pub struct Options {
    /// Api key (client id in OIDC mode).
    pub api_key: String,
    /// Secret matching `api_key`.
    pub secret: String,
    /// Tenant id. In Mona mode it is read from the access token when unset.
    pub user_id: Option<String>,
    /// Bearer token for `AuthMode::ManualToken`.
    pub access_token: Option<String>,
    pub auth_mode: AuthMode,
    pub oidc_scope: Option<String>,
    /// When false the client behaves as `AuthMode::NoAuth`.
    pub should_use_authentication: bool,
    /// Try the refresh-token endpoint before requesting a new token. Mona mode only.
    pub should_use_refresh_tokens: bool,
    pub auth_api_token_url: String,
    pub refresh_token_url: String,
    /// Tokens are refreshed this long before they expire. Default: 30m.
    pub refresh_token_safety_margin: Duration,

    pub raise_authentication_exceptions: bool,
    pub raise_export_exceptions: bool,
    pub raise_service_exceptions: bool,

    /// Retries after the first authentication attempt. Default: 3.
    pub num_of_retries_for_authentication: u32,
    /// Fixed wait between authentication attempts. Default: 2s.
    pub wait_time_for_authentication_retries: Duration,

    /// Log the content of messages that could not be delivered.
    pub log_failed_messages: bool,
    /// Drop null-valued top-level fields before export.
    pub filter_none_fields_on_export: bool,
    /// Default: 1.0 (send everything).
    pub default_sampling_rate: f64,
    pub context_class_to_sampling_rate: HashMap<String, f64>,

    /// Use https for the default and host-overridden urls. Default: true.
    pub should_use_ssl: bool,
    pub override_rest_api_host: Option<String>,
    pub override_rest_api_full_url: Option<String>,
    pub override_app_server_host: Option<String>,
    pub override_app_server_full_url: Option<String>,

    /// Maximum messages per export request. Default: 1000.
    pub max_batch_size: usize,
    /// Concurrent blocking calls allowed by `AsyncClient`. Default: 8.
    pub async_max_workers: usize,
    /// Per-request network timeout. Default: 30s.
    pub request_timeout: Duration,
    pub logger_name: String,
    /// When set, `Client::new` installs the process-wide log subscriber at
    /// this level (see `init_logging`).
    pub logging_level: Option<String>,
}

impl Options {
    /// Create options with credentials only; all others use defaults.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            user_id: None,
            access_token: None,
            auth_mode: AuthMode::Mona,
            oidc_scope: None,
            should_use_authentication: true,
            should_use_refresh_tokens: true,
            auth_api_token_url: DEFAULT_AUTH_API_TOKEN_URL.to_string(),
            refresh_token_url: DEFAULT_REFRESH_TOKEN_URL.to_string(),
            refresh_token_safety_margin: Duration::from_secs(30 * 60),
            raise_authentication_exceptions: false,
            raise_export_exceptions: false,
            raise_service_exceptions: false,
            num_of_retries_for_authentication: 3,
            wait_time_for_authentication_retries: Duration::from_secs(2),
            log_failed_messages: false,
            filter_none_fields_on_export: false,
            default_sampling_rate: 1.0,
            context_class_to_sampling_rate: HashMap::new(),
            should_use_ssl: true,
            override_rest_api_host: None,
            override_rest_api_full_url: None,
            override_app_server_host: None,
            override_app_server_full_url: None,
            max_batch_size: 1000,
            async_max_workers: 8,
            request_timeout: Duration::from_secs(30),
            logger_name: DEFAULT_LOGGER_NAME.to_string(),
            logging_level: None,
        }
    }

    /// Options for a backend without authentication, identified by user id only.
    pub fn unauthenticated(user_id: impl Into<String>) -> Self {
        let mut opts = Self::new("", "");
        opts.user_id = Some(user_id.into());
        opts.auth_mode = AuthMode::NoAuth;
        opts.should_use_authentication = false;
        opts
    }

    /// The auth mode actually in effect.
    pub fn effective_auth_mode(&self) -> AuthMode {
        if self.should_use_authentication {
            self.auth_mode
        } else {
            AuthMode::NoAuth
        }
    }

    pub fn sampling_config(&self) -> Result<SamplingConfig> {
        SamplingConfig::new(
            self.default_sampling_rate,
            self.context_class_to_sampling_rate.clone(),
        )
    }

    /// Check that the options are consistent for the effective auth mode.
    pub fn validate(&self) -> Result<()> {
        self.sampling_config()?;

        if self.max_batch_size == 0 {
            return Err(MonaError::Validation(
                "max_batch_size must be positive".to_string(),
            ));
        }
        if self.async_max_workers == 0 {
            return Err(MonaError::Validation(
                "async_max_workers must be positive".to_string(),
            ));
        }

        let mode = self.effective_auth_mode();
        if mode == AuthMode::Mona || mode == AuthMode::Oidc {
            if self.api_key.is_empty() || self.secret.is_empty() {
                return Err(MonaError::Initialization(
                    "api_key and secret are required for this auth mode".to_string(),
                ));
            }
            if self.auth_api_token_url.is_empty() {
                return Err(MonaError::Initialization(
                    "auth_api_token_url is required for this auth mode".to_string(),
                ));
            }
        }
        if mode == AuthMode::ManualToken
            && self.access_token.as_deref().map_or(true, str::is_empty)
        {
            return Err(MonaError::Initialization(
                "access_token is required in manual token mode".to_string(),
            ));
        }
        if mode != AuthMode::Mona {
            if self.user_id.as_deref().map_or(true, str::is_empty) {
                return Err(MonaError::Initialization(
                    "user_id is required for this auth mode".to_string(),
                ));
            }
            let has_backend = [
                &self.override_rest_api_host,
                &self.override_rest_api_full_url,
                &self.override_app_server_host,
                &self.override_app_server_full_url,
            ]
            .iter()
            .any(|o| o.is_some());
            if !has_backend {
                return Err(MonaError::Initialization(
                    "this auth mode requires a host or a full url override".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("auth_mode", &self.effective_auth_mode())
            .field("should_use_ssl", &self.should_use_ssl)
            .field("override_rest_api_host", &self.override_rest_api_host)
            .field("override_rest_api_full_url", &self.override_rest_api_full_url)
            .field("override_app_server_host", &self.override_app_server_host)
            .field(
                "override_app_server_full_url",
                &self.override_app_server_full_url,
            )
            .field("default_sampling_rate", &self.default_sampling_rate)
            .field("max_batch_size", &self.max_batch_size)
            .finish_non_exhaustive()
    }
}
