use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::Authenticator;
use crate::error::{MonaError, Result};
use crate::logging::Logger;
use crate::transport::HttpRequest;
use crate::types::ServiceResponse;

const ERROR_BODY_PREVIEW: usize = 200;

/// Query for `get_insights`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InsightsQuery {
    pub context_class: String,
    pub min_segment_size: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insight_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_name: Option<String>,
    /// `[from, to]` in epoch seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range_seconds: Option<[i64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_discovered_on_range_seconds: Option<[i64; 2]>,
}

impl InsightsQuery {
    pub fn new(context_class: impl Into<String>, min_segment_size: f64) -> Self {
        Self {
            context_class: context_class.into(),
            min_segment_size,
            ..Self::default()
        }
    }
}

/// Query for `get_aggregated_data_of_a_specific_segment`.
///
/// Segments are passed through as JSON, e.g.
/// `{"occupation": [{"value": "retail"}]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SegmentDataQuery {
    pub context_class: String,
    pub timestamp_from: i64,
    pub timestamp_to: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_series_resolutions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_histogram: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_segments: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_segments: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_segment: Option<Value>,
}

impl SegmentDataQuery {
    pub fn new(context_class: impl Into<String>, timestamp_from: i64, timestamp_to: i64) -> Self {
        Self {
            context_class: context_class.into(),
            timestamp_from,
            timestamp_to,
            ..Self::default()
        }
    }
}

/// Query for `get_aggregated_stats_of_a_specific_segmentation`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SegmentationStatsQuery {
    pub context_class: String,
    /// Field to segment by.
    pub dimension: String,
    pub target_time_range: [i64; 2],
    pub compared_time_range: [i64; 2],
    pub metric_1_field: String,
    pub metric_2_field: String,
    pub metric_1_type: String,
    pub metric_2_type: String,
    pub min_segment_size: f64,
    pub sort_function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_segment: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_segments: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_segments_filter: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compared_segments_filter: Option<Value>,
}

/// Thin wrappers around the app server's configuration and data endpoints.
///
/// Every call POSTs a JSON payload and maps the `response_data` of a 2xx
/// answer into a successful `ServiceResponse`.
pub struct ServiceGateway {
    auth: Arc<Authenticator>,
    app_server_url: String,
    user_id: String,
    author: String,
    raise_service_exceptions: bool,
    logger: Logger,
}

impl ServiceGateway {
    pub fn new(
        auth: Arc<Authenticator>,
        app_server_url: impl Into<String>,
        user_id: impl Into<String>,
        author: impl Into<String>,
        raise_service_exceptions: bool,
        logger: Logger,
    ) -> Self {
        Self {
            auth,
            app_server_url: app_server_url.into(),
            user_id: user_id.into(),
            author: author.into(),
            raise_service_exceptions,
            logger,
        }
    }

    pub fn raises(&self) -> bool {
        self.raise_service_exceptions
    }

    /// Upload a full configuration for the tenant.
    pub fn upload_config(&self, config: Value, commit_message: &str) -> Result<ServiceResponse> {
        let mut by_user = serde_json::Map::new();
        by_user.insert(self.user_id.clone(), config);
        self.request(
            "upload_config",
            json!({
                "config": by_user,
                "author": self.author,
                "commit_message": commit_message,
                "user_id": self.user_id,
            }),
        )
    }

    /// Upload the configuration of a single context class.
    pub fn upload_config_per_context_class(
        &self,
        context_class: &str,
        config: Value,
        commit_message: &str,
    ) -> Result<ServiceResponse> {
        self.request(
            "upload_config_per_context_class",
            json!({
                "author": self.author,
                "commit_message": commit_message,
                "context_class": context_class,
                "config": config,
            }),
        )
    }

    pub fn get_config(&self) -> Result<ServiceResponse> {
        self.request("configs", json!({}))
    }

    pub fn get_config_history(&self, number_of_revisions: u32) -> Result<ServiceResponse> {
        self.request(
            "get_config_history",
            json!({ "number_of_revisions": number_of_revisions }),
        )
    }

    /// Check `config` against the stored data, optionally limited to some
    /// context ids or to the latest `latest_amount` records.
    pub fn validate_config(
        &self,
        config: Value,
        list_of_context_ids: Option<Vec<String>>,
        latest_amount: Option<u64>,
    ) -> Result<ServiceResponse> {
        let mut payload = json!({ "config": config });
        if let Some(ids) = list_of_context_ids {
            payload["list_of_context_ids"] = json!(ids);
        }
        if let Some(amount) = latest_amount {
            payload["latest_amount"] = json!(amount);
        }
        self.request("validate_config", payload)
    }

    pub fn get_suggested_config(&self) -> Result<ServiceResponse> {
        self.request("get_new_config_fields", json!({}))
    }

    pub fn get_suggested_config_from_user_input(&self, events: Value) -> Result<ServiceResponse> {
        self.request(
            "get_suggested_config_from_user_input",
            json!({ "events": events }),
        )
    }

    pub fn get_sampling_factors(&self) -> Result<ServiceResponse> {
        self.request("get_sampling_factors", json!({}))
    }

    pub fn create_sampling_factor(
        &self,
        config_name: &str,
        sampling_factor: f64,
        context_class: Option<&str>,
    ) -> Result<ServiceResponse> {
        let mut payload = json!({
            "config_name": config_name,
            "sampling_factor": sampling_factor,
        });
        if let Some(class) = context_class {
            payload["context_class"] = json!(class);
        }
        self.request("create_sampling_factor", payload)
    }

    pub fn get_insights(&self, query: &InsightsQuery) -> Result<ServiceResponse> {
        self.request_with("get_insights", query)
    }

    pub fn get_aggregated_data_of_a_specific_segment(
        &self,
        query: &SegmentDataQuery,
    ) -> Result<ServiceResponse> {
        self.request_with("get_aggregated_data_of_a_specific_segment", query)
    }

    pub fn get_aggregated_stats_of_a_specific_segmentation(
        &self,
        query: &SegmentationStatsQuery,
    ) -> Result<ServiceResponse> {
        self.request_with("get_aggregated_stats_of_a_specific_segmentation", query)
    }

    pub fn get_ingested_data_for_a_specific_segment(
        &self,
        context_class: &str,
        start_time: i64,
        end_time: i64,
        segment: Value,
    ) -> Result<ServiceResponse> {
        self.request(
            "get_ingested_data_for_a_specific_segment",
            json!({
                "context_class": context_class,
                "start_time": start_time,
                "end_time": end_time,
                "segment": segment,
            }),
        )
    }

    fn request_with<T: Serialize>(&self, path: &str, query: &T) -> Result<ServiceResponse> {
        match serde_json::to_value(query) {
            Ok(payload) => self.request(path, payload),
            Err(e) => self.fail(path, MonaError::Validation(e.to_string())),
        }
    }

    fn request(&self, path: &str, payload: Value) -> Result<ServiceResponse> {
        match self.call(path, payload) {
            Ok(data) => Ok(ServiceResponse::ok(data)),
            Err(e) => self.fail(path, e),
        }
    }

    /// Log the failure, then raise it or fold it into a failed response.
    fn fail(&self, path: &str, err: MonaError) -> Result<ServiceResponse> {
        self.logger.error(format!("{path} failed: {err}"));
        if self.raise_service_exceptions {
            Err(err)
        } else {
            Ok(ServiceResponse::failed(err.message()))
        }
    }

    fn call(&self, path: &str, payload: Value) -> Result<Value> {
        let url = format!("{}/{path}", self.app_server_url);
        let response = self
            .auth
            .send(HttpRequest::post_json(url, payload))
            .map_err(|e| MonaError::Service(format!("could not reach the app server: {e}")))?;

        if !response.is_success() {
            return Err(MonaError::Service(format!(
                "app server returned status {}: {}",
                response.status,
                error_detail(&response.body)
            )));
        }

        response
            .json()
            .and_then(|mut body| body.get_mut("response_data").map(Value::take))
            .ok_or_else(|| {
                MonaError::Service("app server response has no response_data".to_string())
            })
    }
}

/// Best-effort error text from a failed app server response.
fn error_detail(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        for key in ["error_message", "message", "errors", "error"] {
            match parsed.get(key) {
                Some(Value::String(s)) => return s.clone(),
                Some(other) if !other.is_null() => return other.to_string(),
                _ => {}
            }
        }
    }
    body.chars().take(ERROR_BODY_PREVIEW).collect()
}
