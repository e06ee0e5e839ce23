use crate::error::{MonaError, Result};
use crate::types::Options;

/// Resolved base urls of the two Mona hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Full url messages are POSTed to.
    pub export_url: String,
    /// Base url of the config/service API, without trailing slash.
    pub app_server_url: String,
}

impl Endpoints {
    /// Resolve both hosts for `user_id`.
    ///
    /// Precedence per host: full url override, then host override, then the
    /// tenant default. `should_use_ssl` picks the scheme for the latter two.
    pub fn resolve(opts: &Options, user_id: &str) -> Result<Self> {
        let scheme = if opts.should_use_ssl { "https" } else { "http" };

        let export_url = match (&opts.override_rest_api_full_url, &opts.override_rest_api_host) {
            (Some(url), _) => validate_endpoint(url)?,
            (None, Some(host)) => validate_endpoint(&format!("{scheme}://{host}/export"))?,
            (None, None) => format!("{scheme}://incoming{user_id}.monalabs.io/export"),
        };

        let app_server_url =
            match (&opts.override_app_server_full_url, &opts.override_app_server_host) {
                (Some(url), _) => validate_endpoint(url)?,
                (None, Some(host)) => validate_endpoint(&format!("{scheme}://{host}"))?,
                (None, None) => format!("{scheme}://api{user_id}.monalabs.io"),
            };

        Ok(Self {
            export_url,
            app_server_url: app_server_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Validate an override url.
///
/// Rejects:
///   - schemes other than http/https
///   - embedded credentials
///   - empty hosts and malformed urls
pub fn validate_endpoint(endpoint: &str) -> Result<String> {
    if endpoint.is_empty() {
        return Err(MonaError::Initialization(
            "endpoint url must not be empty".to_string(),
        ));
    }

    let url = url_parse(endpoint)?;

    if url.scheme != "https" && url.scheme != "http" {
        return Err(MonaError::Initialization(format!(
            "endpoint must use http or https: {endpoint}"
        )));
    }

    if url.has_credentials {
        return Err(MonaError::Initialization(
            "endpoint url must not contain credentials".to_string(),
        ));
    }

    Ok(endpoint.to_string())
}

struct ParsedUrl {
    scheme: String,
    has_credentials: bool,
}

fn url_parse(endpoint: &str) -> Result<ParsedUrl> {
    let invalid = || MonaError::Initialization(format!("invalid endpoint url: {endpoint}"));

    let (scheme, rest) = endpoint.split_once("://").ok_or_else(invalid)?;

    let authority = rest.split('/').next().unwrap_or(rest);
    let has_credentials = authority.contains('@');

    let host_port = if has_credentials {
        authority.rsplit_once('@').map_or(authority, |(_, hp)| hp)
    } else {
        authority
    };

    // Strip port
    let host = if host_port.starts_with('[') {
        // IPv6: [::1]:8080
        host_port
            .split(']')
            .next()
            .unwrap_or(host_port)
            .trim_start_matches('[')
    } else {
        host_port.split(':').next().unwrap_or(host_port)
    };

    if host.is_empty() {
        return Err(invalid());
    }

    Ok(ParsedUrl {
        scheme: scheme.to_lowercase(),
        has_credentials,
    })
}
