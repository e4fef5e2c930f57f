//! Ingestion orchestration: configuration, the population and reconciliation
//! passes, and the scheduler that drives them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use matchsync_adapters::{
    adapter_for_source, DetailError, MatchSequenceAdapter, NormalizeError, ProviderCredentials,
    RequestError, SequenceDetailSource,
};
use matchsync_core::fields::MATCH_ID;
use matchsync_core::FailureClass;
use matchsync_storage::{
    FetchError, HttpClientConfig, HttpFetcher, PgConnector, RetryPolicy, StoreConnector, StoreError,
    StoreGateway,
};
use tracing::{info, warn};

pub mod config;
pub mod cursor;
pub mod populate;
pub mod reconcile;
pub mod scheduler;

pub use config::{ConfigError, SourceConfig, SourceRegistry, SyncConfig};
pub use cursor::latest_sequence_number;
pub use populate::{PopulateOptions, PopulateSummary, Population};
pub use reconcile::{merge_patch, ReconcileSummary, Reconciler};
pub use scheduler::{RunOutcome, ScheduledJob, Scheduler, TaskStats};

pub const CRATE_NAME: &str = "matchsync-sync";

/// Classify the first typed failure found in an error chain.
pub fn failure_class(err: &anyhow::Error) -> Option<FailureClass> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<FetchError>() {
            Some(e.class())
        } else if let Some(e) = cause.downcast_ref::<StoreError>() {
            Some(e.class())
        } else if let Some(e) = cause.downcast_ref::<NormalizeError>() {
            Some(e.class())
        } else if let Some(e) = cause.downcast_ref::<DetailError>() {
            Some(e.class())
        } else if cause.is::<RequestError>() || cause.is::<ConfigError>() {
            Some(FailureClass::Permanent)
        } else {
            None
        }
    })
}

/// Everything a process needs to build passes for any configured source.
pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    http: Arc<HttpFetcher>,
    connector: Arc<dyn StoreConnector>,
    store_retry: RetryPolicy,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: SourceRegistry,
        connector: Arc<dyn StoreConnector>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            min_request_interval: config.min_request_interval,
            ..Default::default()
        })?;
        Ok(Self {
            config,
            registry,
            http: Arc::new(http),
            connector,
            store_retry: RetryPolicy::default(),
        })
    }

    pub fn with_http(mut self, http: Arc<HttpFetcher>) -> Self {
        self.http = http;
        self
    }

    pub fn with_store_retry(mut self, retry: RetryPolicy) -> Self {
        self.store_retry = retry;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn credentials(&self) -> ProviderCredentials {
        ProviderCredentials {
            api_key: self.config.api_key.clone(),
            language: self.config.language.clone(),
        }
    }

    /// The named source, or the configured default.
    pub fn source(&self, source_id: Option<&str>) -> Result<&SourceConfig> {
        let id = source_id.unwrap_or(self.config.source_id.as_str());
        Ok(self.registry.find(id)?)
    }

    pub fn population(&self, source_id: Option<&str>) -> Result<Population> {
        let source = self.source(source_id)?;
        let adapter = adapter_for_source(
            &source.source_id,
            source.kind,
            &source.base_url,
            &self.credentials(),
        )
        .with_context(|| format!("building adapter for {}", source.source_id))?;

        Ok(Population::new(
            Arc::from(adapter),
            self.http.clone(),
            self.connector.clone(),
            source.collection(),
        )
        .with_options(PopulateOptions {
            batch_size: self.config.batch_size,
            min_rank: self.config.min_rank,
            max_rank: self.config.max_rank,
            less_than_match_id: self.config.less_than_match_id,
        })
        .with_store_retry(self.store_retry))
    }

    /// Reconciler for the named source's collection. Detail lookups always go
    /// through the registry's sequence-number source.
    pub fn reconciler(&self, source_id: Option<&str>) -> Result<Reconciler> {
        let source = self.source(source_id)?;
        let detail = self.registry.detail_source()?;
        if self.config.api_key.is_none() {
            warn!(
                detail_source = %detail.source_id,
                "DOTA2_API_KEY is not set; detail lookups will fail until it is"
            );
        }
        let adapter = MatchSequenceAdapter::new(&detail.source_id, &detail.base_url, self.credentials())
            .with_context(|| format!("building detail adapter for {}", detail.source_id))?;

        Ok(Reconciler::new(
            Arc::new(SequenceDetailSource::new(self.http.clone(), adapter)),
            self.connector.clone(),
            source.collection(),
        )
        .with_limit(self.config.reconcile_limit)
        .with_store_retry(self.store_retry))
    }

    pub async fn current_cursor(&self, source_id: Option<&str>) -> Result<Option<u64>> {
        let source = self.source(source_id)?;
        let mut gateway = StoreGateway::new(self.connector.clone(), source.collection())
            .with_unique_index(MATCH_ID)
            .with_retry_policy(self.store_retry);
        gateway
            .connect()
            .await
            .with_context(|| format!("connecting to collection {}", source.collection()))?;
        let cursor = latest_sequence_number(&gateway).await;
        gateway.end_session().await;
        Ok(cursor?)
    }

    /// Population and reconciliation for one source on their configured
    /// intervals.
    pub fn build_scheduler(&self, source_id: Option<&str>) -> Result<Scheduler> {
        let population = self.population(source_id)?;
        let reconciler = self.reconciler(source_id)?;
        info!(
            source_id = population.source_id(),
            populate_secs = self.config.populate_interval.as_secs(),
            reconcile_secs = self.config.reconcile_interval.as_secs(),
            "scheduling ingestion tasks"
        );
        Ok(Scheduler::new(self.config.poll_interval)
            .every(self.config.populate_interval, Arc::new(population))
            .every(self.config.reconcile_interval, Arc::new(reconciler)))
    }
}

/// Config from the environment, registry from the workspace root, Postgres
/// from `DATABASE_URL`.
pub fn pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env()?;
    let registry = SourceRegistry::load(&config.workspace_root)?;
    let connector = Arc::new(PgConnector::new(config.database_url.clone()));
    SyncPipeline::new(config, registry, connector)
}
