use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{MonaError, Result};
use crate::sampling::should_sample;
use crate::types::{Action, SamplingConfig, SingleMessage, Timestamp};

/// Fields starting with this prefix are reserved by the backend.
pub const RESERVED_PREFIX: &str = "MONA_";
/// Prepended to reserved field names before transmission.
pub const ESCAPE_PREFIX: &str = "MY_";

/// Message in the shape the export endpoint expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// The backend still calls the context class `arcClass`.
    pub arc_class: String,
    pub context_id: String,
    pub message: Map<String, Value>,
    pub export_timestamp: String,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_config_name: Option<String>,
}

/// Outcome of normalizing one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Send(OutgoingMessage),
    SampledOut,
}

/// Applies defaults, reserved-name escaping, null filtering and sampling.
#[derive(Debug, Clone)]
pub struct Normalizer {
    sampling: SamplingConfig,
    filter_none_fields: bool,
}

impl Normalizer {
    pub fn new(sampling: SamplingConfig, filter_none_fields: bool) -> Self {
        Self {
            sampling,
            filter_none_fields,
        }
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    /// Normalize `msg`, stamping it with `now` when it carries no timestamp.
    ///
    /// `filter_none_fields` overrides the client-wide null filtering for this
    /// call when set.
    pub fn normalize(
        &self,
        msg: &SingleMessage,
        default_action: Action,
        filter_none_fields: Option<bool>,
        now: DateTime<Utc>,
    ) -> Result<Normalized> {
        if msg.context_class.trim().is_empty() {
            return Err(MonaError::Validation(
                "context_class is required".to_string(),
            ));
        }
        let Value::Object(fields) = &msg.message else {
            return Err(MonaError::Validation(format!(
                "message must be a JSON object, got {}",
                json_type_name(&msg.message)
            )));
        };

        let given_id = msg.context_id.as_deref().filter(|id| !id.is_empty());
        let rate = self.sampling.rate_for(&msg.context_class);
        if !should_sample(given_id, rate) {
            return Ok(Normalized::SampledOut);
        }

        let export_timestamp = match &msg.export_timestamp {
            Some(ts) => canonical_timestamp(ts)?,
            None => format_timestamp(now),
        };

        let filter = filter_none_fields.unwrap_or(self.filter_none_fields);

        Ok(Normalized::Send(OutgoingMessage {
            arc_class: msg.context_class.clone(),
            context_id: given_id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            message: escape_fields(fields, filter),
            export_timestamp,
            action: msg.action.unwrap_or(default_action),
            sample_config_name: msg.sample_config_name.clone(),
        }))
    }
}

/// Rename reserved top-level fields (`MONA_x` -> `MY_MONA_x`), optionally
/// dropping null values. Matching is case-sensitive.
///
/// If the message already has a `MY_MONA_x` field, the escaped `MONA_x`
/// value replaces it.
pub fn escape_fields(fields: &Map<String, Value>, filter_none: bool) -> Map<String, Value> {
    let kept = |value: &Value| !(filter_none && value.is_null());
    let mut out = Map::with_capacity(fields.len());
    for (key, value) in fields {
        if !key.starts_with(RESERVED_PREFIX) && kept(value) {
            out.insert(key.clone(), value.clone());
        }
    }
    // Escaped keys go in last so they win a collision.
    for (key, value) in fields {
        if key.starts_with(RESERVED_PREFIX) && kept(value) {
            out.insert(format!("{ESCAPE_PREFIX}{key}"), value.clone());
        }
    }
    out
}

/// Convert a caller timestamp to RFC 3339 UTC with millisecond precision.
///
/// Strings may be RFC 3339, a naive date-time (taken as UTC) or a plain
/// date. Numbers are Unix seconds.
pub fn canonical_timestamp(ts: &Timestamp) -> Result<String> {
    let invalid = |raw: &dyn std::fmt::Display| {
        MonaError::Validation(format!("invalid export timestamp '{raw}'"))
    };

    let dt = match ts {
        Timestamp::Epoch(secs) => {
            if !secs.is_finite() {
                return Err(invalid(secs));
            }
            let millis = (secs * 1000.0).round() as i64;
            DateTime::from_timestamp_millis(millis).ok_or_else(|| invalid(secs))?
        }
        Timestamp::Iso(raw) => parse_iso(raw.trim()).ok_or_else(|| invalid(raw))?,
    };
    Ok(format_timestamp(dt))
}

fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
