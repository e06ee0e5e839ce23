use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::Authenticator;
use crate::error::{MonaError, Result};
use crate::logging::Logger;
use crate::normalizer::{Normalized, Normalizer, OutgoingMessage};
use crate::transport::HttpRequest;
use crate::types::{Action, ExportResult, MessageFailure, SingleMessage};

/// Per-call export settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Action for messages that do not set one.
    pub default_action: Action,
    /// Overrides the client-wide null filtering for this call.
    pub filter_none_fields: Option<bool>,
}

impl ExportOptions {
    pub fn with_action(default_action: Action) -> Self {
        Self {
            default_action,
            filter_none_fields: None,
        }
    }
}

/// Settings the exporter is built from.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub export_url: String,
    pub user_id: String,
    pub max_batch_size: usize,
    pub log_failed_messages: bool,
    pub raise_export_exceptions: bool,
}

/// What happened to one chunk on the wire.
enum ChunkOutcome {
    Sent,
    /// The backend rejected some messages. Reasons carry the chunk-local
    /// position when the backend identified the message.
    Partial {
        failed: usize,
        reasons: Vec<(Option<usize>, String)>,
    },
    Failed(String),
}

/// Normalizes, chunks and sends message batches.
pub struct BatchExporter {
    normalizer: Normalizer,
    auth: Arc<Authenticator>,
    config: ExporterConfig,
    logger: Logger,
}

impl BatchExporter {
    /// Fails with `MonaError::Validation` when `max_batch_size` is zero.
    pub fn new(
        normalizer: Normalizer,
        auth: Arc<Authenticator>,
        config: ExporterConfig,
        logger: Logger,
    ) -> Result<Self> {
        if config.max_batch_size == 0 {
            return Err(MonaError::Validation(
                "max_batch_size must be positive".to_string(),
            ));
        }
        Ok(Self {
            normalizer,
            auth,
            config,
            logger,
        })
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Export `messages`, continuing past failed chunks.
    ///
    /// Returns `Err(MonaError::Export)` describing the first failure only when
    /// `raise_export_exceptions` is set; otherwise failures are reported in the
    /// returned `ExportResult`.
    pub fn export_batch(
        &self,
        messages: &[SingleMessage],
        opts: &ExportOptions,
    ) -> Result<ExportResult> {
        let now = Utc::now();
        let mut result = ExportResult {
            total: messages.len(),
            ..ExportResult::default()
        };

        let mut pending: Vec<(usize, OutgoingMessage)> = Vec::with_capacity(messages.len());
        for (index, msg) in messages.iter().enumerate() {
            match self
                .normalizer
                .normalize(msg, opts.default_action, opts.filter_none_fields, now)
            {
                Ok(Normalized::Send(out)) => pending.push((index, out)),
                Ok(Normalized::SampledOut) => result.sampled_out += 1,
                Err(e) => {
                    result.failed += 1;
                    result.failures.push(MessageFailure {
                        index: Some(index),
                        context_id: msg.context_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        for chunk in pending.chunks(self.config.max_batch_size) {
            match self.send_chunk(chunk) {
                ChunkOutcome::Sent => result.sent += chunk.len(),
                ChunkOutcome::Partial { failed, reasons } => {
                    let failed = failed.clamp(reasons.len().min(chunk.len()), chunk.len());
                    result.sent += chunk.len() - failed;
                    result.failed += failed;
                    for (local, reason) in reasons {
                        let entry = local.and_then(|i| chunk.get(i));
                        result.failures.push(MessageFailure {
                            index: entry.map(|(index, _)| *index),
                            context_id: entry.map(|(_, out)| out.context_id.clone()),
                            reason,
                        });
                    }
                }
                ChunkOutcome::Failed(reason) => {
                    result.failed += chunk.len();
                    for (index, out) in chunk {
                        result.failures.push(MessageFailure {
                            index: Some(*index),
                            context_id: Some(out.context_id.clone()),
                            reason: reason.clone(),
                        });
                    }
                }
            }
        }

        result.failures.sort_by_key(|f| f.index.unwrap_or(usize::MAX));
        result.success = result.failed == 0;
        self.report(messages, &result)?;
        Ok(result)
    }

    fn send_chunk(&self, chunk: &[(usize, OutgoingMessage)]) -> ChunkOutcome {
        let outgoing: Vec<&OutgoingMessage> = chunk.iter().map(|(_, out)| out).collect();
        let body = json!({
            "userId": self.config.user_id,
            "messages": outgoing,
        });

        let response = match self
            .auth
            .send(HttpRequest::post_json(&self.config.export_url, body))
        {
            Ok(r) => r,
            Err(e) => return ChunkOutcome::Failed(format!("Cannot connect to rest-api: {e}")),
        };

        if response.is_success() {
            return ChunkOutcome::Sent;
        }

        let parsed = response.json();
        let Some(failed) = parsed
            .as_ref()
            .and_then(|b| b.get("failed"))
            .and_then(Value::as_u64)
        else {
            return ChunkOutcome::Failed(format!(
                "Failed to send the batch to Mona's servers (status {})",
                response.status
            ));
        };

        let reasons = parsed
            .as_ref()
            .and_then(|b| b.get("failure_reasons"))
            .map(|r| attribute_reasons(r, chunk))
            .unwrap_or_default();

        ChunkOutcome::Partial {
            failed: failed as usize,
            reasons,
        }
    }

    /// Log the outcome and, when configured, turn failures into an error.
    fn report(&self, messages: &[SingleMessage], result: &ExportResult) -> Result<()> {
        if result.success {
            self.logger.info(format!(
                "All {} messages have been sent ({} sampled out).",
                result.sent, result.sampled_out
            ));
            return Ok(());
        }

        self.logger.error(format!(
            "Some messages could not be sent: {} of {} failed",
            result.failed, result.total
        ));
        if self.config.log_failed_messages {
            for failure in &result.failures {
                let content = failure
                    .index
                    .and_then(|i| messages.get(i))
                    .and_then(|m| serde_json::to_string(m).ok())
                    .unwrap_or_default();
                self.logger.error(format!(
                    "Failed to send the following to mona ({}): {content}",
                    failure.reason
                ));
            }
        }

        if self.config.raise_export_exceptions {
            let first = result.failures.first().map_or_else(
                || "unknown failure".to_string(),
                |f| match (f.index, &f.context_id) {
                    (Some(i), Some(id)) => format!("message {i} (context id {id}): {}", f.reason),
                    (Some(i), None) => format!("message {i}: {}", f.reason),
                    _ => f.reason.clone(),
                },
            );
            return Err(MonaError::Export(format!(
                "{} of {} messages failed; first failure: {first}",
                result.failed, result.total
            )));
        }
        Ok(())
    }
}

/// Match backend failure reasons to chunk positions.
///
/// Accepts an object keyed by chunk position or context id, or a list of
/// `{index|contextId, reason}` objects.
fn attribute_reasons(
    reasons: &Value,
    chunk: &[(usize, OutgoingMessage)],
) -> Vec<(Option<usize>, String)> {
    let locate = |key: &str| -> Option<usize> {
        key.parse::<usize>()
            .ok()
            .filter(|i| *i < chunk.len())
            .or_else(|| chunk.iter().position(|(_, out)| out.context_id == key))
    };

    match reasons {
        Value::Object(map) => map
            .iter()
            .map(|(key, reason)| match locate(key) {
                Some(i) => (Some(i), reason_text(reason)),
                None => (None, format!("{key}: {}", reason_text(reason))),
            })
            .collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let local = item
                    .get("index")
                    .and_then(Value::as_u64)
                    .map(|i| i as usize)
                    .filter(|i| *i < chunk.len())
                    .or_else(|| item.get("contextId").and_then(Value::as_str).and_then(locate));
                let reason = item.get("reason").map_or_else(|| reason_text(item), reason_text);
                (local, reason)
            })
            .collect(),
        other => vec![(None, reason_text(other))],
    }
}

fn reason_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;
    use crate::transport::{Body, HttpResponse};
    use crate::types::{Options, SamplingConfig};
    use std::collections::HashMap;
    use tracing_test::traced_test;

    const EXPORT_URL: &str = "https://incoming.test/export";

    fn exporter_with(
        t: Arc<FakeTransport>,
        max_batch_size: usize,
        raise: bool,
        log_failed: bool,
        sampling: SamplingConfig,
    ) -> BatchExporter {
        let mut o = Options::new("key", "secret");
        o.auth_mode = crate::types::AuthMode::ManualToken;
        o.access_token = Some("tok".to_string());
        let auth = Arc::new(Authenticator::new(&o, t, Logger::default()));
        BatchExporter::new(
            Normalizer::new(sampling, false),
            auth,
            config(max_batch_size, raise, log_failed),
            Logger::default(),
        )
        .unwrap()
    }

    fn config(max_batch_size: usize, raise: bool, log_failed: bool) -> ExporterConfig {
        ExporterConfig {
            export_url: EXPORT_URL.to_string(),
            user_id: "tenant".to_string(),
            max_batch_size,
            log_failed_messages: log_failed,
            raise_export_exceptions: raise,
        }
    }

    /// Exporter whose authenticator obtains tokens from `/api-token`.
    fn mona_exporter(t: Arc<FakeTransport>, raise: bool) -> BatchExporter {
        let mut o = Options::new("key", "secret");
        o.auth_api_token_url = "https://auth.test/api-token".to_string();
        o.refresh_token_url = "https://auth.test/token/refresh".to_string();
        o.num_of_retries_for_authentication = 0;
        o.wait_time_for_authentication_retries = std::time::Duration::ZERO;
        let auth = Arc::new(Authenticator::new(&o, t, Logger::default()));
        BatchExporter::new(
            Normalizer::new(SamplingConfig::default(), false),
            auth,
            config(100, raise, false),
            Logger::default(),
        )
        .unwrap()
    }

    fn token_reply(token: &str) -> Result<HttpResponse> {
        Ok(HttpResponse::new(
            200,
            json!({"accessToken": token, "refreshToken": "r", "expiresIn": 3600}).to_string(),
        ))
    }

    fn exporter(t: Arc<FakeTransport>, max_batch_size: usize) -> BatchExporter {
        exporter_with(t, max_batch_size, false, false, SamplingConfig::default())
    }

    fn msgs(n: usize) -> Vec<SingleMessage> {
        (0..n)
            .map(|i| {
                SingleMessage::new("LOANS", json!({"n": i})).with_context_id(format!("c{i}"))
            })
            .collect()
    }

    fn sent_messages(req: &HttpRequest) -> Vec<Value> {
        let Body::Json(body) = &req.body else {
            panic!("expected json body");
        };
        body["messages"].as_array().unwrap().clone()
    }

    #[test]
    fn single_request_for_small_batch() {
        let t = Arc::new(FakeTransport::new());
        t.push("/export", Ok(HttpResponse::new(200, "{}")));
        let result = exporter(t.clone(), 100)
            .export_batch(&msgs(3), &ExportOptions::default())
            .unwrap();

        assert!(result.success);
        assert_eq!((result.total, result.sent, result.failed), (3, 3, 0));
        let reqs = t.requests_to("/export");
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].header("Authorization"), Some("Bearer tok"));
        let Body::Json(body) = &reqs[0].body else {
            panic!("expected json body");
        };
        assert_eq!(body["userId"], json!("tenant"));
        assert_eq!(sent_messages(&reqs[0]).len(), 3);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let t = Arc::new(FakeTransport::new());
        let auth = Arc::new(Authenticator::new(
            &Options::unauthenticated("tenant"),
            t,
            Logger::default(),
        ));
        let err = BatchExporter::new(
            Normalizer::new(SamplingConfig::default(), false),
            auth,
            config(0, false, false),
            Logger::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, MonaError::Validation(_)));
    }

    #[test]
    fn rejected_token_is_renewed_once_and_chunk_resent() {
        let t = Arc::new(FakeTransport::new());
        t.push("/api-token", token_reply("first"));
        t.push("/api-token", token_reply("second"));
        t.push("/export", Ok(HttpResponse::new(401, "{}")));
        t.push("/export", Ok(HttpResponse::new(200, "{}")));

        let result = mona_exporter(t.clone(), true)
            .export_batch(&msgs(2), &ExportOptions::default())
            .unwrap();

        assert!(result.success);
        assert_eq!((result.sent, result.failed), (2, 0));
        assert_eq!(t.requests_to("/api-token").len(), 2);
        let exports = t.requests_to("/export");
        assert_eq!(exports.len(), 2);
        assert_eq!(exports[0].header("Authorization"), Some("Bearer first"));
        assert_eq!(exports[1].header("Authorization"), Some("Bearer second"));
    }

    #[test]
    fn rejected_reauthentication_fails_the_chunk() {
        let rejected = || {
            let t = Arc::new(FakeTransport::new());
            t.push("/api-token", token_reply("first"));
            t.push(
                "/api-token",
                Ok(HttpResponse::new(
                    401,
                    json!({"errors": ["Invalid authentication"]}).to_string(),
                )),
            );
            t.push("/export", Ok(HttpResponse::new(401, "{}")));
            t
        };

        let t = rejected();
        let err = mona_exporter(t.clone(), true)
            .export_batch(&msgs(1), &ExportOptions::default())
            .unwrap_err();
        let MonaError::Export(message) = err else {
            panic!("expected an export error, got {err:?}");
        };
        assert!(message.starts_with("1 of 1 messages failed"));
        assert!(message.contains("Invalid authentication"));
        assert_eq!(t.requests_to("/export").len(), 1);

        let result = mona_exporter(rejected(), false)
            .export_batch(&msgs(1), &ExportOptions::default())
            .unwrap();
        assert!(!result.success);
        assert_eq!((result.sent, result.failed), (0, 1));
        assert_eq!(result.failed_indices(), vec![0]);
    }

    #[test]
    fn large_batch_is_chunked() {
        let t = Arc::new(FakeTransport::with_handler(|_| {
            Some(Ok(HttpResponse::new(200, "{}")))
        }));
        let result = exporter(t.clone(), 2)
            .export_batch(&msgs(5), &ExportOptions::default())
            .unwrap();
        assert!(result.success);
        let sizes: Vec<_> = t
            .requests_to("/export")
            .iter()
            .map(|r| sent_messages(r).len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn failed_chunk_does_not_stop_the_rest() {
        let t = Arc::new(FakeTransport::new());
        t.push("/export", Ok(HttpResponse::new(200, "{}")));
        t.push("/export", Err(MonaError::Transport("connection reset".to_string())));
        t.push("/export", Ok(HttpResponse::new(200, "{}")));
        let result = exporter(t.clone(), 1)
            .export_batch(&msgs(3), &ExportOptions::default())
            .unwrap();

        assert!(!result.success);
        assert_eq!((result.sent, result.failed), (2, 1));
        assert_eq!(result.failed_indices(), vec![1]);
        assert_eq!(result.failures[0].context_id.as_deref(), Some("c1"));
        assert!(result.failures[0].reason.contains("connection reset"));
        assert_eq!(t.requests_to("/export").len(), 3);
    }

    #[test]
    fn backend_partial_failure_is_attributed() {
        let t = Arc::new(FakeTransport::new());
        t.push(
            "/export",
            Ok(HttpResponse::new(
                400,
                json!({"failed": 1, "failure_reasons": {"1": "missing field"}}).to_string(),
            )),
        );
        let result = exporter(t, 10)
            .export_batch(&msgs(3), &ExportOptions::default())
            .unwrap();
        assert!(!result.success);
        assert_eq!((result.sent, result.failed), (2, 1));
        assert_eq!(result.failed_indices(), vec![1]);
        assert_eq!(result.failures[0].reason, "missing field");
    }

    #[test]
    fn reasons_keyed_by_context_id_are_attributed() {
        let t = Arc::new(FakeTransport::new());
        t.push(
            "/export",
            Ok(HttpResponse::new(
                400,
                json!({"failed": 2, "failure_reasons": [
                    {"contextId": "c2", "reason": "bad type"},
                    {"reason": "unknown"}
                ]})
                .to_string(),
            )),
        );
        let result = exporter(t, 10)
            .export_batch(&msgs(3), &ExportOptions::default())
            .unwrap();
        assert_eq!((result.sent, result.failed), (1, 2));
        assert_eq!(result.failed_indices(), vec![2]);
        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.failures[1].index, None);
    }

    #[test]
    fn malformed_error_fails_whole_chunk() {
        let t = Arc::new(FakeTransport::new());
        t.push("/export", Ok(HttpResponse::new(500, "oops")));
        let result = exporter(t, 10)
            .export_batch(&msgs(2), &ExportOptions::default())
            .unwrap();
        assert_eq!((result.sent, result.failed), (0, 2));
        assert_eq!(result.failed_indices(), vec![0, 1]);
    }

    #[test]
    fn sampled_out_messages_are_counted_not_sent() {
        let t = Arc::new(FakeTransport::with_handler(|_| {
            Some(Ok(HttpResponse::new(200, "{}")))
        }));
        let per_class = HashMap::from([("DROPPED".to_string(), 0.0)]);
        let sampling = SamplingConfig::new(1.0, per_class).unwrap();
        let mut batch = msgs(2);
        batch.push(SingleMessage::new("DROPPED", json!({})).with_context_id("d"));
        let result = exporter_with(t.clone(), 10, false, false, sampling)
            .export_batch(&batch, &ExportOptions::default())
            .unwrap();
        assert!(result.success);
        assert_eq!((result.sent, result.sampled_out, result.failed), (2, 1, 0));
        assert_eq!(sent_messages(&t.requests_to("/export")[0]).len(), 2);
    }

    #[test]
    fn everything_sampled_out_sends_nothing() {
        let t = Arc::new(FakeTransport::new());
        let sampling = SamplingConfig::new(0.0, HashMap::new()).unwrap();
        let result = exporter_with(t.clone(), 10, false, false, sampling)
            .export_batch(&msgs(3), &ExportOptions::default())
            .unwrap();
        assert!(result.success);
        assert_eq!(result.sampled_out, 3);
        assert!(t.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn invalid_message_is_recorded_and_others_sent() {
        let t = Arc::new(FakeTransport::with_handler(|_| {
            Some(Ok(HttpResponse::new(200, "{}")))
        }));
        let mut batch = msgs(2);
        batch.insert(1, SingleMessage::new("LOANS", json!("not an object")));
        let result = exporter(t, 10)
            .export_batch(&batch, &ExportOptions::default())
            .unwrap();
        assert_eq!((result.sent, result.failed), (2, 1));
        assert_eq!(result.failed_indices(), vec![1]);
        assert!(result.failures[0].reason.starts_with("validation error"));
    }

    #[test]
    fn raise_surfaces_first_failure_after_all_chunks() {
        let t = Arc::new(FakeTransport::new());
        t.push("/export", Ok(HttpResponse::new(200, "{}")));
        t.push("/export", Err(MonaError::Transport("boom".to_string())));
        t.push("/export", Ok(HttpResponse::new(200, "{}")));
        let err = exporter_with(t.clone(), 1, true, false, SamplingConfig::default())
            .export_batch(&msgs(3), &ExportOptions::default())
            .unwrap_err();
        let MonaError::Export(msg) = err else {
            panic!("expected export error");
        };
        assert!(msg.contains("message 1 (context id c1)"));
        assert_eq!(t.requests_to("/export").len(), 3);
    }

    #[test]
    fn default_action_and_overwrite_resend_are_identical() {
        let t = Arc::new(FakeTransport::with_handler(|_| {
            Some(Ok(HttpResponse::new(200, "{}")))
        }));
        let exp = exporter(t.clone(), 10);
        let msg = vec![SingleMessage::new("LOANS", json!({"score": 1}))
            .with_context_id("same")
            .with_timestamp(1_700_000_000i64)];
        exp.export_batch(&msg, &ExportOptions::with_action(Action::Overwrite))
            .unwrap();
        exp.export_batch(&msg, &ExportOptions::with_action(Action::Overwrite))
            .unwrap();
        let reqs = t.requests_to("/export");
        assert_eq!(sent_messages(&reqs[0]), sent_messages(&reqs[1]));
        assert_eq!(sent_messages(&reqs[0])[0]["action"], json!("OVERWRITE"));
    }

    #[test]
    #[traced_test]
    fn failed_messages_are_logged_when_enabled() {
        let t = Arc::new(FakeTransport::new());
        t.push("/export", Err(MonaError::Transport("down".to_string())));
        let batch = vec![SingleMessage::new("LOANS", json!({"secret_field": 42}))];
        exporter_with(t, 10, false, true, SamplingConfig::default())
            .export_batch(&batch, &ExportOptions::default())
            .unwrap();
        assert!(logs_contain("Failed to send the following to mona"));
        assert!(logs_contain("secret_field"));
    }

    #[test]
    #[traced_test]
    fn failed_messages_are_not_logged_by_default() {
        let t = Arc::new(FakeTransport::new());
        t.push("/export", Err(MonaError::Transport("down".to_string())));
        let batch = vec![SingleMessage::new("LOANS", json!({"secret_field": 42}))];
        exporter(t, 10)
            .export_batch(&batch, &ExportOptions::default())
            .unwrap();
        assert!(logs_contain("could not be sent"));
        assert!(!logs_contain("secret_field"));
    }
}
