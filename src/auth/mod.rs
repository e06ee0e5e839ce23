//! Token lifecycle: acquisition with retries, proactive refresh, and
//! re-authentication when the backend rejects a token.

mod retry;
mod token;

pub use retry::RetryPolicy;
pub use token::AuthToken;

use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{MonaError, Result};
use crate::logging::Logger;
use crate::transport::{HttpRequest, HttpResponse, Transport};
use crate::types::{AuthMode, Options};
use token::{error_string, parse_token, TokenFields, MONA_FIELDS, OIDC_FIELDS};

/// Credentials the client was constructed with. Never change afterwards.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
    pub access_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct TokenState {
    token: Option<AuthToken>,
    last_error: Option<String>,
}

/// Obtains, refreshes and attaches bearer tokens.
///
/// Token state is replaced as a whole under a mutex, and a second lock
/// serializes refreshes so that concurrent callers holding a stale token
/// wait for one refresh instead of each starting their own.
pub struct Authenticator {
    mode: AuthMode,
    credentials: Credentials,
    oidc_scope: Option<String>,
    token_url: String,
    refresh_url: String,
    use_refresh_tokens: bool,
    safety_margin: Duration,
    retry: RetryPolicy,
    transport: Arc<dyn Transport>,
    logger: Logger,
    state: Mutex<TokenState>,
    refresh_lock: Mutex<()>,
}

impl Authenticator {
    pub fn new(opts: &Options, transport: Arc<dyn Transport>, logger: Logger) -> Self {
        let mode = opts.effective_auth_mode();
        let credentials = Credentials {
            api_key: opts.api_key.clone(),
            secret: opts.secret.clone(),
            access_token: opts.access_token.clone(),
        };
        let state = TokenState {
            token: match mode {
                AuthMode::ManualToken => credentials.access_token.clone().map(AuthToken::new),
                AuthMode::NoAuth => Some(AuthToken::anonymous()),
                AuthMode::Mona | AuthMode::Oidc => None,
            },
            last_error: None,
        };
        Self {
            mode,
            credentials,
            oidc_scope: opts.oidc_scope.clone(),
            token_url: opts.auth_api_token_url.clone(),
            refresh_url: opts.refresh_token_url.clone(),
            // Only the Mona token endpoint issues refresh tokens.
            use_refresh_tokens: opts.should_use_refresh_tokens && mode == AuthMode::Mona,
            safety_margin: opts.refresh_token_safety_margin,
            retry: RetryPolicy::new(
                opts.num_of_retries_for_authentication,
                opts.wait_time_for_authentication_retries,
            ),
            transport,
            logger,
            state: Mutex::new(state),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Whether the client holds a usable token.
    pub fn is_active(&self) -> bool {
        self.lock_state()
            .token
            .as_ref()
            .is_some_and(|t| !t.is_expired())
    }

    /// Error recorded by the last failed authentication, if any.
    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    /// Request a new token from the authentication server, replacing the
    /// current one.
    pub fn authenticate(&self) -> Result<AuthToken> {
        let _refresh = lock(&self.refresh_lock);
        self.acquire(None)
    }

    /// Current token, refreshing it first when it is missing or due.
    pub fn current_token(&self) -> Result<AuthToken> {
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }
        let _refresh = lock(&self.refresh_lock);
        // Another caller may have refreshed while we waited.
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }
        let stale = self.lock_state().token.clone();
        match self.acquire(stale.as_ref()) {
            Ok(token) => Ok(token),
            Err(e) => match stale {
                Some(token) if !token.is_expired() => {
                    self.logger
                        .warn(format!("token refresh failed, using current token: {e}"));
                    Ok(token)
                }
                _ => Err(e),
            },
        }
    }

    /// Drop `rejected` if it is still the current token and obtain a new
    /// one. Returns the already refreshed token when another caller got
    /// there first.
    pub fn reauthenticate(&self, rejected: &AuthToken) -> Result<AuthToken> {
        let _refresh = lock(&self.refresh_lock);
        {
            let mut state = self.lock_state();
            match &state.token {
                Some(current) if current != rejected => return Ok(current.clone()),
                _ => state.token = None,
            }
        }
        self.acquire(None)
    }

    /// Send `request` with the bearer token attached.
    ///
    /// A 401/403 answer triggers one re-authentication and a resend; the
    /// second answer is returned as is.
    pub fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let token = self.current_token()?;
        let response = self.transport.send(&token.authorize(request.clone()))?;
        if !response.is_auth_rejection() || !self.can_reauthenticate() {
            return Ok(response);
        }

        self.logger.warn(format!(
            "request to {} was rejected with {}, re-authenticating",
            request.url, response.status
        ));
        let fresh = self.reauthenticate(&token)?;
        self.transport.send(&fresh.authorize(request))
    }

    fn can_reauthenticate(&self) -> bool {
        matches!(self.mode, AuthMode::Mona | AuthMode::Oidc)
    }

    fn fresh_token(&self) -> Option<AuthToken> {
        self.lock_state()
            .token
            .clone()
            .filter(|t| !t.needs_refresh())
    }

    /// Obtain a token and store it. Caller must hold the refresh lock.
    fn acquire(&self, stale: Option<&AuthToken>) -> Result<AuthToken> {
        let result = match self.mode {
            AuthMode::NoAuth => Ok(AuthToken::anonymous()),
            AuthMode::ManualToken => self
                .credentials
                .access_token
                .clone()
                .map(AuthToken::new)
                .ok_or_else(|| {
                    MonaError::Authentication("manual token mode without a token".to_string())
                }),
            AuthMode::Mona | AuthMode::Oidc => {
                match stale.and_then(AuthToken::refresh_token) {
                    Some(refresh_token) if self.use_refresh_tokens => {
                        self.refresh_with_fallback(refresh_token)
                    }
                    _ => self.request_access_token(),
                }
            }
        };

        let mut state = self.lock_state();
        match &result {
            Ok(token) => {
                state.token = Some(token.clone());
                state.last_error = None;
                self.logger.info("obtained a new access token");
            }
            Err(e) => {
                state.last_error = Some(e.message().to_string());
            }
        }
        result
    }

    fn refresh_with_fallback(&self, refresh_token: &str) -> Result<AuthToken> {
        let request = HttpRequest::post_json(
            &self.refresh_url,
            json!({ "refreshToken": refresh_token }),
        );
        match self.token_exchange(&request, MONA_FIELDS) {
            Ok(token) => Ok(token),
            Err(e) => {
                self.logger.warn(format!(
                    "Failed to refresh the access token, trying to get a new one. {e}"
                ));
                self.request_access_token()
            }
        }
    }

    fn request_access_token(&self) -> Result<AuthToken> {
        let (request, fields) = match self.mode {
            AuthMode::Oidc => {
                let mut form = vec![
                    ("client_id".to_string(), self.credentials.api_key.clone()),
                    ("client_secret".to_string(), self.credentials.secret.clone()),
                    ("grant_type".to_string(), "client_credentials".to_string()),
                ];
                if let Some(scope) = &self.oidc_scope {
                    form.push(("scope".to_string(), scope.clone()));
                }
                (HttpRequest::post_form(&self.token_url, form), OIDC_FIELDS)
            }
            _ => (
                HttpRequest::post_json(
                    &self.token_url,
                    json!({
                        "clientId": self.credentials.api_key,
                        "secret": self.credentials.secret,
                    }),
                ),
                MONA_FIELDS,
            ),
        };
        self.token_exchange(&request, fields)
    }

    /// One token request with retries. Transport failures and non-JSON
    /// bodies are retried; a well-formed rejection is final.
    fn token_exchange(&self, request: &HttpRequest, fields: TokenFields) -> Result<AuthToken> {
        let (response, body) = self.retry.run(&self.logger, || {
            let response = self.transport.send(request)?;
            let body: Value = serde_json::from_str(&response.body).map_err(|e| {
                MonaError::Transport(format!(
                    "authentication server returned a non-JSON body ({}): {e}",
                    response.status
                ))
            })?;
            Ok((response, body))
        })?;

        if !response.is_success() {
            return Err(MonaError::Authentication(format!(
                "could not authenticate. errors: {}",
                error_string(Some(&body))
            )));
        }
        parse_token(&body, fields, self.safety_margin).ok_or_else(|| {
            MonaError::Authentication(format!(
                "authentication response is missing '{}'",
                fields.access_token
            ))
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, TokenState> {
        lock(&self.state)
    }
}

/// Token state is always replaced as a whole, so a poisoned lock still
/// holds a consistent value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
