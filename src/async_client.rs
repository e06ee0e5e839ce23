use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::error::{MonaError, Result};
use crate::exporter::ExportOptions;
use crate::service::{InsightsQuery, SegmentDataQuery, SegmentationStatsQuery};
use crate::transport::Transport;
use crate::types::{ExportResult, Options, ServiceResponse, SingleMessage};

/// Non-blocking front of [`Client`].
///
/// Each call runs the blocking operation on tokio's blocking pool, with at
/// most `async_max_workers` calls in flight. Results are identical to the
/// blocking client's. Dropping a returned future abandons the result; the
/// call itself still runs to completion on its worker.
#[derive(Clone)]
pub struct AsyncClient {
    inner: Arc<Client>,
    workers: Arc<Semaphore>,
}

impl AsyncClient {
    /// Build and authenticate a client without blocking the runtime.
    pub async fn new(opts: Options) -> Result<Self> {
        join(tokio::task::spawn_blocking(move || Client::new(opts)))
            .await
            .map(Self::from_client)
    }

    pub async fn with_transport(opts: Options, transport: Arc<dyn Transport>) -> Result<Self> {
        join(tokio::task::spawn_blocking(move || {
            Client::with_transport(opts, transport)
        }))
        .await
        .map(Self::from_client)
    }

    pub fn from_client(client: Client) -> Self {
        let workers = Arc::new(Semaphore::new(client.options().async_max_workers));
        Self {
            inner: Arc::new(client),
            workers,
        }
    }

    /// The wrapped blocking client.
    pub fn blocking(&self) -> &Client {
        &self.inner
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub async fn export(&self, message: SingleMessage) -> Result<bool> {
        self.run(move |c| c.export(message)).await
    }

    pub async fn export_batch(&self, messages: Vec<SingleMessage>) -> Result<ExportResult> {
        self.run(move |c| c.export_batch(&messages)).await
    }

    pub async fn export_batch_with(
        &self,
        messages: Vec<SingleMessage>,
        opts: ExportOptions,
    ) -> Result<ExportResult> {
        self.run(move |c| c.export_batch_with(&messages, &opts)).await
    }

    pub async fn upload_config(
        &self,
        config: Value,
        commit_message: impl Into<String>,
    ) -> Result<ServiceResponse> {
        let commit_message = commit_message.into();
        self.run(move |c| c.upload_config(config, &commit_message))
            .await
    }

    pub async fn upload_config_per_context_class(
        &self,
        context_class: impl Into<String>,
        config: Value,
        commit_message: impl Into<String>,
    ) -> Result<ServiceResponse> {
        let context_class = context_class.into();
        let commit_message = commit_message.into();
        self.run(move |c| {
            c.upload_config_per_context_class(&context_class, config, &commit_message)
        })
        .await
    }

    pub async fn get_config(&self) -> Result<ServiceResponse> {
        self.run(Client::get_config).await
    }

    pub async fn get_config_history(&self, number_of_revisions: u32) -> Result<ServiceResponse> {
        self.run(move |c| c.get_config_history(number_of_revisions))
            .await
    }

    pub async fn validate_config(
        &self,
        config: Value,
        list_of_context_ids: Option<Vec<String>>,
        latest_amount: Option<u64>,
    ) -> Result<ServiceResponse> {
        self.run(move |c| c.validate_config(config, list_of_context_ids, latest_amount))
            .await
    }

    pub async fn get_suggested_config(&self) -> Result<ServiceResponse> {
        self.run(Client::get_suggested_config).await
    }

    pub async fn get_suggested_config_from_user_input(
        &self,
        events: Value,
    ) -> Result<ServiceResponse> {
        self.run(move |c| c.get_suggested_config_from_user_input(events))
            .await
    }

    pub async fn get_sampling_factors(&self) -> Result<ServiceResponse> {
        self.run(Client::get_sampling_factors).await
    }

    pub async fn create_sampling_factor(
        &self,
        config_name: impl Into<String>,
        sampling_factor: f64,
        context_class: Option<String>,
    ) -> Result<ServiceResponse> {
        let config_name = config_name.into();
        self.run(move |c| {
            c.create_sampling_factor(&config_name, sampling_factor, context_class.as_deref())
        })
        .await
    }

    pub async fn get_insights(&self, query: InsightsQuery) -> Result<ServiceResponse> {
        self.run(move |c| c.get_insights(&query)).await
    }

    pub async fn get_aggregated_data_of_a_specific_segment(
        &self,
        query: SegmentDataQuery,
    ) -> Result<ServiceResponse> {
        self.run(move |c| c.get_aggregated_data_of_a_specific_segment(&query))
            .await
    }

    pub async fn get_aggregated_stats_of_a_specific_segmentation(
        &self,
        query: SegmentationStatsQuery,
    ) -> Result<ServiceResponse> {
        self.run(move |c| c.get_aggregated_stats_of_a_specific_segmentation(&query))
            .await
    }

    pub async fn get_ingested_data_for_a_specific_segment(
        &self,
        context_class: impl Into<String>,
        start_time: i64,
        end_time: i64,
        segment: Value,
    ) -> Result<ServiceResponse> {
        let context_class = context_class.into();
        self.run(move |c| {
            c.get_ingested_data_for_a_specific_segment(&context_class, start_time, end_time, segment)
        })
        .await
    }

    async fn run<T, F>(&self, call: F) -> Result<T>
    where
        F: FnOnce(&Client) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|e| MonaError::Task(e.to_string()))?;
        let client = Arc::clone(&self.inner);
        join(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            call(&client)
        }))
        .await
    }
}

/// Await a blocking call, resuming its panic on the awaiting task.
async fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(MonaError::Task(format!("worker cancelled: {e}"))),
    }
}
