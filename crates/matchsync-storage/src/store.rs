//! Document store contract and the retrying gateway the loops talk to.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use matchsync_core::{Document, FailureClass};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{with_retry, RetryPolicy, Retryable};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store not connected; call connect first")]
    NotConnected,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("invalid store request: {0}")]
    Invalid(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("stored document could not be decoded: {0}")]
    Decode(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<StoreError>,
    },
}

impl StoreError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Unavailable(_) | Self::RetriesExhausted { .. } => FailureClass::Transient,
            Self::DuplicateKey(_) => FailureClass::Duplicate,
            Self::Decode(_) => FailureClass::DataShape,
            Self::NotConnected | Self::Invalid(_) | Self::Query(_) => FailureClass::Permanent,
        }
    }
}

impl Retryable for StoreError {
    fn failure_class(&self) -> FailureClass {
        match self {
            Self::RetriesExhausted { .. } => FailureClass::Permanent,
            other => other.class(),
        }
    }

    fn exhausted(attempts: usize, last: Self) -> Self {
        Self::RetriesExhausted {
            attempts,
            last: Box::new(last),
        }
    }
}

/// Typed filter tree over top-level document fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    /// Field is absent, null, or anything other than boolean `true`.
    NotTrue(String),
    Exists(String),
    Gt(String, Value),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn not_true(field: impl Into<String>) -> Self {
        Self::NotTrue(field.into())
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists(field.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::And(filters.into_iter().collect())
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Eq(field, value) => doc
                .get(field)
                .is_some_and(|v| compare_values(v, value) == Some(Ordering::Equal)),
            Self::NotTrue(field) => !matches!(doc.get(field), Some(Value::Bool(true))),
            Self::Exists(field) => doc.contains_key(field),
            Self::Gt(field, value) => doc
                .get(field)
                .is_some_and(|v| compare_values(v, value) == Some(Ordering::Greater)),
            Self::And(filters) => filters.iter().all(|f| f.matches(doc)),
        }
    }

    /// Every field name referenced by the tree.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::All => Vec::new(),
            Self::Eq(f, _) | Self::NotTrue(f) | Self::Exists(f) | Self::Gt(f, _) => vec![f.as_str()],
            Self::And(filters) => filters.iter().flat_map(Filter::fields).collect(),
        }
    }
}

/// Ordering between scalar JSON values; `None` when the types are not comparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_u64(), y.as_u64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => (a == b).then_some(Ordering::Equal),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

impl Sort {
    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }

    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    /// Documents missing the field always sort last.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        match (a.get(&self.field), b.get(&self.field)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = compare_values(x, y).unwrap_or(Ordering::Equal);
                match self.direction {
                    SortDirection::Ascending => ord,
                    SortDirection::Descending => ord.reverse(),
                }
            }
        }
    }
}

/// Include-list of fields to keep in returned documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection(pub Vec<String>);

impl Projection {
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    pub fn apply(&self, doc: Document) -> Document {
        doc.into_iter()
            .filter(|(k, _)| self.0.iter().any(|f| f == k))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub projection: Option<Projection>,
    pub sort: Option<Sort>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sorted(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn projected(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn limited(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Server-side reductions. Result rows are documents with `value` (and `count`).
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// Largest value of `field` among matching documents: `[{value}]` or `[]`.
    Max { field: String, filter: Filter },
    /// Number of matching documents per distinct `field` value, most frequent first.
    GroupCount { field: String, filter: Filter },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

impl InsertOutcome {
    pub fn merge(self, other: Self) -> Self {
        Self {
            inserted: self.inserted + other.inserted,
            duplicates: self.duplicates + other.duplicates,
        }
    }
}

/// One open session against a document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create the collection if needed, with a unique index on `unique_field`.
    async fn ensure_collection(&self, collection: &str, unique_field: Option<&str>) -> StoreResult<()>;

    /// Insert documents; unique-key collisions are counted, not raised.
    async fn insert(&self, collection: &str, docs: &[Document]) -> StoreResult<InsertOutcome>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>>;

    /// Shallow-merge `patch` into the first (or every) matching document.
    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Document,
        many: bool,
    ) -> StoreResult<u64>;

    async fn delete(&self, collection: &str, filter: &Filter, many: bool) -> StoreResult<u64>;

    async fn aggregate(&self, collection: &str, aggregation: &Aggregation) -> StoreResult<Vec<Document>>;

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64>;

    async fn close(&self);
}

/// Opens sessions; each task invocation asks for its own.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> StoreResult<Arc<dyn DocumentStore>>;
}

/// Retrying wrapper scoped to one collection.
pub struct StoreGateway {
    connector: Arc<dyn StoreConnector>,
    collection: String,
    unique_field: Option<String>,
    retry: RetryPolicy,
    session: Option<Arc<dyn DocumentStore>>,
}

impl StoreGateway {
    pub fn new(connector: Arc<dyn StoreConnector>, collection: impl Into<String>) -> Self {
        Self {
            connector,
            collection: collection.into(),
            unique_field: None,
            retry: RetryPolicy::default(),
            session: None,
        }
    }

    pub fn with_unique_index(mut self, field: impl Into<String>) -> Self {
        self.unique_field = Some(field.into());
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub async fn connect(&mut self) -> StoreResult<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let connector = self.connector.as_ref();
        let session = with_retry(&self.retry, "store_connect", |_| connector.connect()).await?;

        let collection = self.collection.as_str();
        let unique_field = self.unique_field.as_deref();
        let ensured = with_retry(&self.retry, "ensure_collection", |_| {
            session.ensure_collection(collection, unique_field)
        })
        .await;
        if let Err(err) = ensured {
            session.close().await;
            return Err(err);
        }

        info!(collection, "store session established");
        self.session = Some(session);
        Ok(())
    }

    pub async fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            info!(collection = %self.collection, "store session ended");
        }
    }

    fn session(&self) -> StoreResult<&dyn DocumentStore> {
        self.session.as_deref().ok_or(StoreError::NotConnected)
    }

    /// Insert-if-absent; documents whose unique key already exists are
    /// reported as duplicates, never as failures.
    pub async fn upsert_many(&self, docs: &[Document]) -> StoreResult<InsertOutcome> {
        let session = self.session()?;
        if docs.is_empty() {
            return Ok(InsertOutcome::default());
        }
        let collection = self.collection.as_str();
        let result = with_retry(&self.retry, "upsert_many", |_| session.insert(collection, docs)).await;
        match result {
            Ok(outcome) => {
                debug!(
                    collection,
                    inserted = outcome.inserted,
                    duplicates = outcome.duplicates,
                    "documents upserted"
                );
                Ok(outcome)
            }
            Err(err) if err.class() == FailureClass::Duplicate => {
                warn!(collection, error = %err, "duplicate key on insert; treating batch as already stored");
                Ok(InsertOutcome {
                    inserted: 0,
                    duplicates: docs.len(),
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn upsert_one(&self, doc: &Document) -> StoreResult<InsertOutcome> {
        self.upsert_many(std::slice::from_ref(doc)).await
    }

    pub async fn find_matching(&self, filter: &Filter, options: &FindOptions) -> StoreResult<Vec<Document>> {
        let session = self.session()?;
        let collection = self.collection.as_str();
        with_retry(&self.retry, "find", |_| session.find(collection, filter, options)).await
    }

    pub async fn find_one(&self, filter: &Filter, options: &FindOptions) -> StoreResult<Option<Document>> {
        let options = options.clone().limited(1);
        Ok(self.find_matching(filter, &options).await?.into_iter().next())
    }

    pub async fn update_one(&self, filter: &Filter, patch: &Document) -> StoreResult<u64> {
        self.update(filter, patch, false).await
    }

    pub async fn update_many(&self, filter: &Filter, patch: &Document) -> StoreResult<u64> {
        self.update(filter, patch, true).await
    }

    async fn update(&self, filter: &Filter, patch: &Document, many: bool) -> StoreResult<u64> {
        let session = self.session()?;
        let collection = self.collection.as_str();
        with_retry(&self.retry, "update", |_| session.update(collection, filter, patch, many)).await
    }

    pub async fn delete_one(&self, filter: &Filter) -> StoreResult<u64> {
        self.delete(filter, false).await
    }

    pub async fn delete_many(&self, filter: &Filter) -> StoreResult<u64> {
        self.delete(filter, true).await
    }

    async fn delete(&self, filter: &Filter, many: bool) -> StoreResult<u64> {
        let session = self.session()?;
        let collection = self.collection.as_str();
        let deleted = with_retry(&self.retry, "delete", |_| session.delete(collection, filter, many)).await?;
        info!(collection, deleted, "documents deleted");
        Ok(deleted)
    }

    pub async fn aggregate(&self, aggregation: &Aggregation) -> StoreResult<Vec<Document>> {
        let session = self.session()?;
        let collection = self.collection.as_str();
        with_retry(&self.retry, "aggregate", |_| session.aggregate(collection, aggregation)).await
    }

    pub async fn count(&self, filter: &Filter) -> StoreResult<u64> {
        let session = self.session()?;
        let collection = self.collection.as_str();
        with_retry(&self.retry, "count", |_| session.count(collection, filter)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 1,
            max_delay: Duration::from_millis(2),
        }
    }

    async fn connected(store: &MemoryStore) -> StoreGateway {
        let mut gateway = StoreGateway::new(Arc::new(store.clone()), "matches")
            .with_unique_index("match_id")
            .with_retry_policy(fast_policy());
        gateway.connect().await.expect("connect");
        gateway
    }

    #[test]
    fn not_true_matches_absent_null_and_false() {
        let filter = Filter::not_true("detailed");
        assert!(filter.matches(&doc(json!({"match_id": 1}))));
        assert!(filter.matches(&doc(json!({"detailed": null}))));
        assert!(filter.matches(&doc(json!({"detailed": false}))));
        assert!(!filter.matches(&doc(json!({"detailed": true}))));
    }

    #[test]
    fn numeric_comparison_ignores_integer_float_representation() {
        assert_eq!(compare_values(&json!(42), &json!(42.0)), Some(Ordering::Equal));
        assert_eq!(compare_values(&json!(43), &json!(42)), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!("a"), &json!(1)), None);
    }

    #[test]
    fn descending_sort_puts_missing_fields_last() {
        let sort = Sort::descending("match_seq_num");
        let mut docs = vec![
            doc(json!({"match_id": 1})),
            doc(json!({"match_seq_num": 5})),
            doc(json!({"match_seq_num": 9})),
        ];
        docs.sort_by(|a, b| sort.compare(a, b));
        assert_eq!(docs[0]["match_seq_num"], json!(9));
        assert_eq!(docs[1]["match_seq_num"], json!(5));
        assert!(!docs[2].contains_key("match_seq_num"));
    }

    #[test]
    fn projection_keeps_only_listed_fields() {
        let projected = Projection::include(["match_seq_num"])
            .apply(doc(json!({"match_id": 1, "match_seq_num": 2, "duration": 3})));
        assert_eq!(Value::Object(projected), json!({"match_seq_num": 2}));
    }

    #[tokio::test]
    async fn operations_before_connect_report_not_connected() {
        let store = MemoryStore::new();
        let gateway = StoreGateway::new(Arc::new(store), "matches");
        assert!(!gateway.is_connected());
        let err = gateway.count(&Filter::All).await.unwrap_err();
        assert!(matches!(err, StoreError::NotConnected));
        let err = gateway.upsert_many(&[]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotConnected));
    }

    #[tokio::test]
    async fn reingesting_the_same_batch_creates_no_duplicates() {
        let store = MemoryStore::new();
        let gateway = connected(&store).await;
        let batch = vec![doc(json!({"match_id": 1})), doc(json!({"match_id": 2}))];

        let first = gateway.upsert_many(&batch).await.unwrap();
        let second = gateway.upsert_many(&batch).await.unwrap();

        assert_eq!(first, InsertOutcome { inserted: 2, duplicates: 0 });
        assert_eq!(second, InsertOutcome { inserted: 0, duplicates: 2 });
        assert_eq!(gateway.count(&Filter::All).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn connectivity_failures_are_retried_transparently() {
        let store = MemoryStore::new();
        let gateway = connected(&store).await;
        store.fail_next(2);

        let count = gateway.count(&Filter::All).await.expect("third attempt succeeds");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn connectivity_failures_exhaust_after_three_attempts() {
        let store = MemoryStore::new();
        let gateway = connected(&store).await;
        store.fail_next(5);

        let err = gateway.count(&Filter::All).await.unwrap_err();
        assert!(matches!(err, StoreError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.class(), FailureClass::Transient);
        assert_eq!(store.pending_failures(), 2);
    }

    #[tokio::test]
    async fn end_session_releases_the_handle() {
        let store = MemoryStore::new();
        let mut gateway = connected(&store).await;
        gateway.end_session().await;
        assert!(!gateway.is_connected());
        assert_eq!(store.closed_sessions(), 1);
        assert!(matches!(
            gateway.find_one(&Filter::All, &FindOptions::default()).await,
            Err(StoreError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn update_one_merges_patch_into_first_match() {
        let store = MemoryStore::new();
        let gateway = connected(&store).await;
        gateway
            .upsert_many(&[
                doc(json!({"match_id": 1, "match_seq_num": 42, "start_time": "kept"})),
                doc(json!({"match_id": 2, "match_seq_num": 43})),
            ])
            .await
            .unwrap();

        let updated = gateway
            .update_one(&Filter::eq("match_seq_num", 42), &doc(json!({"detailed": true, "duration": 1})))
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let stored = gateway
            .find_one(&Filter::eq("match_seq_num", 42), &FindOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["detailed"], json!(true));
        assert_eq!(stored["start_time"], json!("kept"));
        assert_eq!(gateway.count(&Filter::not_true("detailed")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_and_aggregate_round_out_the_surface() {
        let store = MemoryStore::new();
        let gateway = connected(&store).await;
        gateway
            .upsert_many(&[
                doc(json!({"match_id": 1, "lobby_type": 7, "match_seq_num": 10})),
                doc(json!({"match_id": 2, "lobby_type": 7, "match_seq_num": 30})),
                doc(json!({"match_id": 3, "lobby_type": 6, "match_seq_num": 20})),
            ])
            .await
            .unwrap();

        let max = gateway
            .aggregate(&Aggregation::Max {
                field: "match_seq_num".into(),
                filter: Filter::All,
            })
            .await
            .unwrap();
        assert_eq!(max, vec![doc(json!({"value": 30}))]);

        let groups = gateway
            .aggregate(&Aggregation::GroupCount {
                field: "lobby_type".into(),
                filter: Filter::All,
            })
            .await
            .unwrap();
        assert_eq!(groups[0], doc(json!({"value": 7, "count": 2})));
        assert_eq!(groups[1], doc(json!({"value": 6, "count": 1})));

        assert_eq!(gateway.delete_one(&Filter::eq("lobby_type", 7)).await.unwrap(), 1);
        assert_eq!(gateway.delete_many(&Filter::All).await.unwrap(), 2);
        assert_eq!(gateway.count(&Filter::All).await.unwrap(), 0);
    }
}
