use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MonaError, Result};
use crate::types::{AuthMode, Options};

const PREFIX: &str = "MONA_SDK_";

impl Options {
    /// Build options from `MONA_SDK_*` environment variables.
    ///
    /// Unset variables keep their defaults. Booleans accept `true`/`True` and
    /// `false`/`False`; any other value falls back to the default. Numbers
    /// that do not parse are a validation error.
    pub fn from_env() -> Result<Self> {
        let mut opts = Options::new(
            var("API_KEY").unwrap_or_default(),
            var("SECRET").unwrap_or_default(),
        );
        opts.user_id = var("USER_ID");
        opts.access_token = var("ACCESS_TOKEN");
        opts.oidc_scope = var("OIDC_SCOPE");

        if let Some(mode) = var("AUTH_MODE").or_else(|| non_empty(env::var("AUTH_MODE").ok())) {
            opts.auth_mode = mode.parse()?;
        }
        if opts.auth_mode == AuthMode::Oidc {
            if let Some(id) = var("OIDC_CLIENT_ID") {
                opts.api_key = id;
            }
            if let Some(secret) = var("OIDC_CLIENT_SECRET") {
                opts.secret = secret;
            }
        }

        flag("RAISE_AUTHENTICATION_EXCEPTIONS", &mut opts.raise_authentication_exceptions);
        flag("RAISE_EXPORT_EXCEPTIONS", &mut opts.raise_export_exceptions);
        // Older name for the service flag; the newer one wins when both are set.
        flag("RAISE_CONFIG_EXCEPTIONS", &mut opts.raise_service_exceptions);
        flag("RAISE_SERVICE_EXCEPTIONS", &mut opts.raise_service_exceptions);
        flag("LOG_FAILED_MESSAGES", &mut opts.log_failed_messages);
        flag("FILTER_NONE_FIELDS_ON_EXPORT", &mut opts.filter_none_fields_on_export);
        flag("SHOULD_USE_SSL", &mut opts.should_use_ssl);
        flag("SHOULD_USE_AUTHENTICATION", &mut opts.should_use_authentication);
        flag("USE_REFRESH_TOKENS", &mut opts.should_use_refresh_tokens);

        if let Some(n) = number::<u32>("NUM_OF_RETRIES_FOR_AUTHENTICATION")? {
            opts.num_of_retries_for_authentication = n;
        }
        if let Some(secs) = number::<f64>("WAIT_TIME_FOR_AUTHENTICATION_RETRIES_SEC")? {
            opts.wait_time_for_authentication_retries =
                Duration::try_from_secs_f64(secs).map_err(|e| {
                    MonaError::Validation(format!(
                        "{PREFIX}WAIT_TIME_FOR_AUTHENTICATION_RETRIES_SEC: {e}"
                    ))
                })?;
        }
        let margin_var = if var("REFRESH_TOKEN_SAFETY_MARGIN_HOURS").is_some() {
            "REFRESH_TOKEN_SAFETY_MARGIN_HOURS"
        } else {
            "REFRESH_TOKEN_SAFETY_MARGIN"
        };
        if let Some(hours) = number::<f64>(margin_var)? {
            opts.refresh_token_safety_margin = Duration::try_from_secs_f64(hours * 3600.0)
                .map_err(|e| MonaError::Validation(format!("{PREFIX}{margin_var}: {e}")))?;
        }
        if let Some(rate) = number::<f64>("DEFAULT_SAMPLING_RATE")? {
            opts.default_sampling_rate = rate;
        }

        if let Some(url) = var("AUTH_API_TOKEN_URL") {
            opts.auth_api_token_url = url;
        }
        if let Some(url) = var("REFRESH_TOKEN_URL") {
            opts.refresh_token_url = url;
        }
        opts.override_rest_api_host = var("OVERRIDE_REST_API_HOST");
        opts.override_rest_api_full_url = var("OVERRIDE_REST_API_FULL_URL");
        opts.override_app_server_host = var("OVERRIDE_APP_SERVER_HOST");
        opts.override_app_server_full_url = var("OVERRIDE_APP_SERVER_FULL_URL");

        if let Some(name) = var("LOGGER_NAME") {
            opts.logger_name = name;
        }
        opts.logging_level = var("LOGGING_LEVEL");

        Ok(opts)
    }
}

fn var(name: &str) -> Option<String> {
    non_empty(env::var(format!("{PREFIX}{name}")).ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn flag(name: &str, target: &mut bool) {
    match var(name).as_deref() {
        Some("true" | "True") => *target = true,
        Some("false" | "False") => *target = false,
        _ => {}
    }
}

fn number<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                MonaError::Validation(format!("{PREFIX}{name}: cannot parse '{raw}': {e}"))
            })
        })
        .transpose()
}
