//! Backfill full detail for records stored without it.
//!
//! A pass scans for records whose `detailed` flag is not `true`, looks each
//! one up by sequence number, and merges the result over the stored record.
//! The stored (formatted) start time is kept; everything else the detail
//! lookup returns wins. A record whose lookup comes back unusable is stamped
//! `detail_skipped` and leaves the scan. Other per-record failures are logged
//! and retried next pass. An upstream or store outage ends the pass early.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use matchsync_adapters::MatchDetailSource;
use matchsync_core::fields::{DETAILED, DETAIL_SKIPPED, MATCH_ID, MATCH_SEQ_NUM, START_TIME};
use matchsync_core::{Document, FailureClass};
use matchsync_storage::{Filter, FindOptions, Projection, RetryPolicy, Sort, StoreConnector, StoreGateway};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::scheduler::ScheduledJob;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub scanned: usize,
    pub merged: usize,
    /// Records with unusable data: no sequence number, or an empty or
    /// mismatched lookup. These are stamped and not scanned again.
    pub skipped: usize,
    /// Records whose lookup or merge failed and will be retried next pass.
    pub failed: usize,
}

pub struct Reconciler {
    detail: Arc<dyn MatchDetailSource>,
    connector: Arc<dyn StoreConnector>,
    collection: String,
    store_retry: RetryPolicy,
    limit: Option<usize>,
}

impl Reconciler {
    pub fn new(
        detail: Arc<dyn MatchDetailSource>,
        connector: Arc<dyn StoreConnector>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            detail,
            connector,
            collection: collection.into(),
            store_retry: RetryPolicy::default(),
            limit: None,
        }
    }

    /// Cap the number of records examined per pass.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_store_retry(mut self, retry: RetryPolicy) -> Self {
        self.store_retry = retry;
        self
    }

    pub async fn run_once(&self) -> Result<ReconcileSummary> {
        let mut gateway = StoreGateway::new(self.connector.clone(), self.collection.clone())
            .with_unique_index(MATCH_ID)
            .with_retry_policy(self.store_retry);
        gateway
            .connect()
            .await
            .with_context(|| format!("connecting to collection {}", self.collection))?;

        let result = self.reconcile(&gateway).await;
        gateway.end_session().await;
        result
    }

    async fn reconcile(&self, gateway: &StoreGateway) -> Result<ReconcileSummary> {
        let mut options = FindOptions::default()
            .sorted(Sort::ascending(MATCH_SEQ_NUM))
            .projected(Projection::include([MATCH_ID, MATCH_SEQ_NUM]));
        if let Some(limit) = self.limit {
            options = options.limited(limit);
        }
        let pending = gateway
            .find_matching(&pending_filter(), &options)
            .await
            .context("scanning for records without detail")?;

        let mut summary = ReconcileSummary {
            scanned: pending.len(),
            ..ReconcileSummary::default()
        };

        for record in pending {
            let match_id = record.get(MATCH_ID).and_then(Value::as_u64);
            let Some(seq) = record.get(MATCH_SEQ_NUM).and_then(Value::as_u64) else {
                warn!(?match_id, "record has no usable match_seq_num; skipping");
                mark_skipped(gateway, match_id).await?;
                summary.skipped += 1;
                continue;
            };

            let detail = match self.detail.fetch_detail(seq).await {
                Ok(detail) => detail,
                Err(err) => match err.class() {
                    FailureClass::Transient => {
                        return Err(err).with_context(|| format!("fetching detail for match_seq_num {seq}"));
                    }
                    FailureClass::DataShape => {
                        warn!(match_seq_num = seq, ?match_id, error = %err, "detail lookup unusable; skipping record");
                        mark_skipped(gateway, match_id).await?;
                        summary.skipped += 1;
                        continue;
                    }
                    class => {
                        warn!(match_seq_num = seq, ?match_id, ?class, error = %err, "detail lookup failed; retrying next pass");
                        summary.failed += 1;
                        continue;
                    }
                },
            };

            let patch = merge_patch(detail);
            match gateway.update_one(&Filter::eq(MATCH_SEQ_NUM, seq), &patch).await {
                Ok(0) => {
                    warn!(match_seq_num = seq, "record disappeared before merge");
                    summary.skipped += 1;
                }
                Ok(_) => summary.merged += 1,
                Err(err) if err.class() == FailureClass::Transient => {
                    return Err(err).with_context(|| format!("merging detail for match_seq_num {seq}"));
                }
                Err(err) => {
                    warn!(match_seq_num = seq, error = %err, "merge rejected by store; skipping record");
                    summary.failed += 1;
                }
            }
        }

        info!(
            collection = gateway.collection(),
            scanned = summary.scanned,
            merged = summary.merged,
            skipped = summary.skipped,
            failed = summary.failed,
            "reconciliation pass complete"
        );
        Ok(summary)
    }
}

/// Incomplete records that have not been given up on.
fn pending_filter() -> Filter {
    Filter::and([Filter::not_true(DETAILED), Filter::not_true(DETAIL_SKIPPED)])
}

/// Take a record out of future scans. Keyed on `match_id` since the sequence
/// number may be the unusable part.
async fn mark_skipped(gateway: &StoreGateway, match_id: Option<u64>) -> Result<()> {
    let Some(match_id) = match_id else {
        return Ok(());
    };
    let mut stamp = Document::new();
    stamp.insert(DETAIL_SKIPPED.to_string(), Value::Bool(true));
    match gateway.update_one(&Filter::eq(MATCH_ID, match_id), &stamp).await {
        Ok(_) => Ok(()),
        Err(err) if err.class() == FailureClass::Transient => {
            Err(err).with_context(|| format!("marking match {match_id} as skipped"))
        }
        Err(err) => {
            warn!(match_id, error = %err, "could not mark record as skipped");
            Ok(())
        }
    }
}

/// Detail fields to write over a stored record: the lookup's own start time
/// is dropped and the record is marked complete.
pub fn merge_patch(mut detail: Document) -> Document {
    detail.remove(START_TIME);
    detail.insert(DETAILED.to_string(), Value::Bool(true));
    detail
}

#[async_trait]
impl ScheduledJob for Reconciler {
    fn name(&self) -> &str {
        "reconcile"
    }

    async fn run(&self) -> Result<()> {
        self.run_once().await.map(|_| ())
    }
}
