//! Mona monitoring client SDK
//!
//! Authenticates against Mona, normalizes and samples monitoring messages,
//! exports them in batches with per-message failure reporting, and wraps the
//! app server's configuration endpoints. [`Client`] blocks the calling
//! thread; [`AsyncClient`] (feature `async`, on by default) runs the same
//! calls on tokio's blocking pool.

mod auth;
mod client;
mod endpoints;
mod env;
mod error;
mod exporter;
mod logging;
mod normalizer;
mod sampling;
mod service;
mod transport;
mod types;

#[cfg(feature = "async")]
mod async_client;

#[cfg(feature = "async")]
pub use async_client::AsyncClient;
pub use auth::{AuthToken, Authenticator, Credentials, RetryPolicy};
pub use client::Client;
pub use endpoints::{validate_endpoint, Endpoints};
pub use error::{MonaError, Result};
pub use exporter::{BatchExporter, ExportOptions, ExporterConfig};
pub use logging::{init_logging, Logger};
pub use normalizer::{
    canonical_timestamp, escape_fields, Normalized, Normalizer, OutgoingMessage, ESCAPE_PREFIX,
    RESERVED_PREFIX,
};
pub use sampling::{context_id_fraction, should_sample};
pub use service::{InsightsQuery, SegmentDataQuery, SegmentationStatsQuery, ServiceGateway};
pub use transport::{Body, HttpRequest, HttpResponse, Method, Transport, UreqTransport};
pub use types::{
    Action, AuthMode, ExportResult, MessageFailure, Options, SamplingConfig, ServiceResponse,
    SingleMessage, Timestamp, DEFAULT_AUTH_API_TOKEN_URL, DEFAULT_LOGGER_NAME,
    DEFAULT_REFRESH_TOKEN_URL,
};
