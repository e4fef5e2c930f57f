//! One ingestion pass: cursor, fetch, normalize, store.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use matchsync_adapters::{
    FetchRequest, PublicMatchesQuery, SequenceQuery, SourceAdapter, MAX_MATCHES_REQUESTED,
};
use matchsync_core::fields::MATCH_ID;
use matchsync_core::MatchRecord;
use matchsync_storage::{HttpFetcher, Payload, RetryPolicy, StoreConnector, StoreGateway};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::cursor::latest_sequence_number;
use crate::scheduler::ScheduledJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopulateOptions {
    pub batch_size: u32,
    pub min_rank: Option<u32>,
    pub max_rank: Option<u32>,
    /// Public feed only: page below this match id instead of the newest.
    pub less_than_match_id: Option<u64>,
}

impl Default for PopulateOptions {
    fn default() -> Self {
        Self {
            batch_size: MAX_MATCHES_REQUESTED,
            min_rank: None,
            max_rank: None,
            less_than_match_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PopulateSummary {
    pub source_id: String,
    pub cursor_before: Option<u64>,
    /// Matches in the upstream payload before filtering.
    pub fetched: usize,
    pub kept: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

pub struct Population {
    adapter: Arc<dyn SourceAdapter>,
    http: Arc<HttpFetcher>,
    connector: Arc<dyn StoreConnector>,
    collection: String,
    store_retry: RetryPolicy,
    options: PopulateOptions,
}

impl Population {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        http: Arc<HttpFetcher>,
        connector: Arc<dyn StoreConnector>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            adapter,
            http,
            connector,
            collection: collection.into(),
            store_retry: RetryPolicy::default(),
            options: PopulateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PopulateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_store_retry(mut self, retry: RetryPolicy) -> Self {
        self.store_retry = retry;
        self
    }

    pub fn source_id(&self) -> &str {
        self.adapter.source_id()
    }

    /// Open a session, ingest one batch, and release the session whatever
    /// the outcome.
    pub async fn run_once(&self) -> Result<PopulateSummary> {
        let mut gateway = StoreGateway::new(self.connector.clone(), self.collection.clone())
            .with_unique_index(MATCH_ID)
            .with_retry_policy(self.store_retry);
        gateway
            .connect()
            .await
            .with_context(|| format!("connecting to collection {}", self.collection))?;

        let result = self.populate(&gateway).await;
        gateway.end_session().await;
        result
    }

    async fn populate(&self, gateway: &StoreGateway) -> Result<PopulateSummary> {
        let source_id = self.adapter.source_id();
        let cursor = if self.adapter.kind().uses_sequence_cursor() {
            latest_sequence_number(gateway)
                .await
                .context("reading sequence cursor")?
        } else {
            None
        };

        let request = self.request_for(cursor);
        let payload = self
            .adapter
            .fetch(&self.http, &request)
            .await
            .with_context(|| format!("fetching batch from {source_id}"))?;
        let fetched = raw_match_count(&payload);

        let records = self
            .adapter
            .normalize(&payload)
            .with_context(|| format!("normalizing batch from {source_id}"))?;
        let docs = records
            .iter()
            .map(MatchRecord::to_document)
            .collect::<Result<Vec<_>, _>>()
            .context("serializing normalized records")?;

        let outcome = gateway
            .upsert_many(&docs)
            .await
            .with_context(|| format!("storing batch into {}", gateway.collection()))?;

        let summary = PopulateSummary {
            source_id: source_id.to_string(),
            cursor_before: cursor,
            fetched,
            kept: docs.len(),
            inserted: outcome.inserted,
            duplicates: outcome.duplicates,
        };
        info!(
            source_id,
            collection = gateway.collection(),
            cursor = ?summary.cursor_before,
            fetched = summary.fetched,
            kept = summary.kept,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            "population pass complete"
        );
        Ok(summary)
    }

    /// Sequence sources resume just past the cursor; a cold start omits the
    /// start parameter and lets the provider choose.
    pub fn request_for(&self, cursor: Option<u64>) -> FetchRequest {
        if self.adapter.kind().uses_sequence_cursor() {
            FetchRequest::MatchHistoryBySequence(SequenceQuery {
                start_at_match_seq_num: cursor.map(|seq| seq.saturating_add(1)),
                matches_requested: self.options.batch_size.clamp(1, MAX_MATCHES_REQUESTED),
            })
        } else {
            FetchRequest::PublicMatches(PublicMatchesQuery {
                less_than_match_id: self.options.less_than_match_id,
                min_rank: self.options.min_rank,
                max_rank: self.options.max_rank,
            })
        }
    }
}

fn raw_match_count(payload: &Payload) -> usize {
    match payload {
        Payload::Json(Value::Array(matches)) => matches.len(),
        Payload::Json(value) => value
            .pointer("/result/matches")
            .and_then(Value::as_array)
            .map_or(0, Vec::len),
        Payload::Text(_) => 0,
    }
}

#[async_trait]
impl ScheduledJob for Population {
    fn name(&self) -> &str {
        "populate"
    }

    async fn run(&self) -> Result<()> {
        self.run_once().await.map(|_| ())
    }
}
