//! Postgres-backed document store: one JSONB table per collection.
//!
//! Each collection is a table `(id BIGSERIAL, doc JSONB)`. A unique index on
//! `doc -> '<field>'` enforces key uniqueness, and inserts use
//! `ON CONFLICT DO NOTHING` so re-ingesting a known match is a no-op.
//! Collection and field names are interpolated into SQL, so both are
//! restricted to `[A-Za-z0-9_]`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use matchsync_core::fields::MATCH_SEQ_NUM;
use matchsync_core::Document;
use serde_json::{json, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::store::{
    Aggregation, DocumentStore, Filter, FindOptions, InsertOutcome, SortDirection, StoreConnector,
    StoreError, StoreResult,
};

/// Rows per multi-value INSERT; keeps well under the bind-parameter limit.
const INSERT_CHUNK: usize = 500;

#[derive(Debug, Clone)]
pub struct PgConnector {
    database_url: String,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PgConnector {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 2,
            acquire_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    async fn connect(&self) -> StoreResult<Arc<dyn DocumentStore>> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Arc::new(PgStore { pool }))
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

pub fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => StoreError::Unavailable(err.to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => StoreError::DuplicateKey(db.message().to_string()),
            // Class 08: connection exceptions; 57P01..03: server shutting down.
            Some(code) if code.starts_with("08") || code.starts_with("57P0") => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Query(err.to_string()),
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StoreError::Decode(err.to_string()),
        _ => StoreError::Query(err.to_string()),
    }
}

fn identifier(kind: &str, name: &str) -> StoreResult<String> {
    let valid = !name.is_empty()
        && name.len() <= 48
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name.to_string())
    } else {
        Err(StoreError::Invalid(format!("{kind} name {name:?}")))
    }
}

/// The unique index, when requested, plus a plain index on the sequence number
/// that cursor reads and per-record merges filter and sort on.
fn index_statements(table: &str, unique_field: Option<&str>) -> StoreResult<Vec<String>> {
    let mut statements = Vec::new();
    if let Some(field) = unique_field {
        let field = identifier("field", field)?;
        statements.push(format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {table}_{field}_key ON {table} ((doc -> '{field}'))"
        ));
    }
    if unique_field != Some(MATCH_SEQ_NUM) {
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {table}_{MATCH_SEQ_NUM}_idx ON {table} ((doc -> '{MATCH_SEQ_NUM}'))"
        ));
    }
    Ok(statements)
}

fn field_expr(field: &str) -> StoreResult<String> {
    Ok(format!("(doc -> '{}')", identifier("field", field)?))
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) -> StoreResult<()> {
    match filter {
        Filter::All => {
            qb.push("TRUE");
        }
        Filter::Eq(field, value) => {
            qb.push(field_expr(field)?).push(" = ").push_bind(Json(value.clone()));
        }
        Filter::NotTrue(field) => {
            qb.push(field_expr(field)?).push(" IS DISTINCT FROM 'true'::jsonb");
        }
        Filter::Exists(field) => {
            qb.push("jsonb_exists(doc, ")
                .push_bind(identifier("field", field)?)
                .push(")");
        }
        Filter::Gt(field, value) => {
            qb.push(field_expr(field)?).push(" > ").push_bind(Json(value.clone()));
        }
        Filter::And(filters) => {
            if filters.is_empty() {
                qb.push("TRUE");
                return Ok(());
            }
            qb.push("(");
            for (i, f) in filters.iter().enumerate() {
                if i > 0 {
                    qb.push(" AND ");
                }
                push_filter(qb, f)?;
            }
            qb.push(")");
        }
    }
    Ok(())
}

fn doc_from_row(row: &PgRow, column: &str) -> StoreResult<Document> {
    let Json(value) = row
        .try_get::<Json<Value>, _>(column)
        .map_err(map_sqlx_error)?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Decode(format!("expected object, found {other}"))),
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn ensure_collection(&self, collection: &str, unique_field: Option<&str>) -> StoreResult<()> {
        let table = identifier("collection", collection)?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (id BIGSERIAL PRIMARY KEY, doc JSONB NOT NULL)"
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        for statement in index_statements(&table, unique_field)? {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        debug!(collection, unique_field, "collection ensured");
        Ok(())
    }

    async fn insert(&self, collection: &str, docs: &[Document]) -> StoreResult<InsertOutcome> {
        let table = identifier("collection", collection)?;
        let mut outcome = InsertOutcome::default();
        for chunk in docs.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("INSERT INTO {table} (doc) "));
            qb.push_values(chunk, |mut b, doc| {
                b.push_bind(Json(Value::Object(doc.clone())));
            });
            qb.push(" ON CONFLICT DO NOTHING");
            let inserted = qb
                .build()
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?
                .rows_affected() as usize;
            outcome = outcome.merge(InsertOutcome {
                inserted,
                duplicates: chunk.len() - inserted,
            });
        }
        Ok(outcome)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        let table = identifier("collection", collection)?;
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("SELECT doc FROM {table} WHERE "));
        push_filter(&mut qb, filter)?;
        match &options.sort {
            Some(sort) => {
                let direction = match sort.direction {
                    SortDirection::Ascending => "ASC",
                    SortDirection::Descending => "DESC",
                };
                qb.push(format!(" ORDER BY {} {direction} NULLS LAST, id", field_expr(&sort.field)?));
            }
            None => {
                qb.push(" ORDER BY id");
            }
        }
        if let Some(limit) = options.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| {
                let doc = doc_from_row(row, "doc")?;
                Ok(match &options.projection {
                    Some(projection) => projection.apply(doc),
                    None => doc,
                })
            })
            .collect()
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Document,
        many: bool,
    ) -> StoreResult<u64> {
        let table = identifier("collection", collection)?;
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("UPDATE {table} SET doc = doc || "));
        qb.push_bind(Json(Value::Object(patch.clone())));
        if many {
            qb.push(" WHERE ");
            push_filter(&mut qb, filter)?;
        } else {
            qb.push(format!(" WHERE id = (SELECT id FROM {table} WHERE "));
            push_filter(&mut qb, filter)?;
            qb.push(" ORDER BY id LIMIT 1)");
        }
        let result = qb.build().execute(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, collection: &str, filter: &Filter, many: bool) -> StoreResult<u64> {
        let table = identifier("collection", collection)?;
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("DELETE FROM {table} WHERE "));
        if many {
            push_filter(&mut qb, filter)?;
        } else {
            qb.push(format!("id = (SELECT id FROM {table} WHERE "));
            push_filter(&mut qb, filter)?;
            qb.push(" ORDER BY id LIMIT 1)");
        }
        let result = qb.build().execute(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn aggregate(&self, collection: &str, aggregation: &Aggregation) -> StoreResult<Vec<Document>> {
        let table = identifier("collection", collection)?;
        let mut qb: QueryBuilder<Postgres>;
        match aggregation {
            Aggregation::Max { field, filter } => {
                let expr = field_expr(field)?;
                qb = QueryBuilder::new(format!("SELECT {expr} AS value FROM {table} WHERE "));
                push_filter(&mut qb, filter)?;
                qb.push(format!(
                    " AND {expr} IS NOT NULL AND {expr} <> 'null'::jsonb ORDER BY {expr} DESC LIMIT 1"
                ));
                let rows = qb.build().fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
                rows.iter()
                    .map(|row| {
                        let Json(value) = row.try_get::<Json<Value>, _>("value").map_err(map_sqlx_error)?;
                        Ok(object(json!({ "value": value })))
                    })
                    .collect()
            }
            Aggregation::GroupCount { field, filter } => {
                let expr = field_expr(field)?;
                qb = QueryBuilder::new(format!(
                    "SELECT COALESCE({expr}, 'null'::jsonb) AS value, COUNT(*) AS count FROM {table} WHERE "
                ));
                push_filter(&mut qb, filter)?;
                qb.push(format!(" GROUP BY COALESCE({expr}, 'null'::jsonb) ORDER BY count DESC"));
                let rows = qb.build().fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
                rows.iter()
                    .map(|row| {
                        let Json(value) = row.try_get::<Json<Value>, _>("value").map_err(map_sqlx_error)?;
                        let count: i64 = row.try_get("count").map_err(map_sqlx_error)?;
                        Ok(object(json!({ "value": value, "count": count })))
                    })
                    .collect()
            }
        }
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        let table = identifier("collection", collection)?;
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("SELECT COUNT(*) AS count FROM {table} WHERE "));
        push_filter(&mut qb, filter)?;
        let row = qb.build().fetch_one(&self.pool).await.map_err(map_sqlx_error)?;
        let count: i64 = row.try_get("count").map_err(map_sqlx_error)?;
        Ok(count.max(0) as u64)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn object(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FindOptions, Sort, StoreGateway};

    #[test]
    fn identifiers_reject_sql_metacharacters() {
        assert!(identifier("collection", "matches_steam").is_ok());
        assert!(identifier("collection", "matches; DROP TABLE x").is_err());
        assert!(identifier("field", "1abc").is_err());
        assert!(identifier("field", "").is_err());
    }

    #[test]
    fn filters_render_to_parameterized_sql() {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT doc FROM matches WHERE ");
        push_filter(
            &mut qb,
            &Filter::and([
                Filter::not_true("detailed"),
                Filter::exists("match_seq_num"),
                Filter::gt("duration", 900),
            ]),
        )
        .unwrap();
        assert_eq!(
            qb.sql(),
            "SELECT doc FROM matches WHERE ((doc -> 'detailed') IS DISTINCT FROM 'true'::jsonb AND \
             jsonb_exists(doc, $1) AND (doc -> 'duration') > $2)"
        );
    }

    #[test]
    fn collections_get_a_sequence_index_next_to_the_unique_one() {
        let statements = index_statements("matches_steam", Some("match_id")).unwrap();
        assert_eq!(
            statements,
            vec![
                "CREATE UNIQUE INDEX IF NOT EXISTS matches_steam_match_id_key ON matches_steam ((doc -> 'match_id'))",
                "CREATE INDEX IF NOT EXISTS matches_steam_match_seq_num_idx ON matches_steam ((doc -> 'match_seq_num'))",
            ]
        );
        assert_eq!(index_statements("matches", None).unwrap().len(), 1);
        assert!(index_statements("matches", Some("bad field")).is_err());
    }

    #[test]
    fn filter_on_invalid_field_is_rejected() {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT 1 WHERE ");
        let err = push_filter(&mut qb, &Filter::eq("a'b", 1)).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    /// Runs only when a scratch database is provided.
    #[tokio::test]
    async fn postgres_round_trip_when_configured() {
        let Ok(url) = std::env::var("MATCHSYNC_TEST_DATABASE_URL") else {
            return;
        };
        let collection = format!("matchsync_test_{}", std::process::id());
        let mut gateway = StoreGateway::new(Arc::new(PgConnector::new(url.clone())), collection.clone())
            .with_unique_index("match_id");
        gateway.connect().await.expect("connect");

        let docs: Vec<Document> = (1..=3)
            .map(|i| object(json!({"match_id": i, "match_seq_num": i * 10})))
            .collect();
        assert_eq!(gateway.upsert_many(&docs).await.unwrap().inserted, 3);
        assert_eq!(gateway.upsert_many(&docs).await.unwrap().duplicates, 3);

        let top = gateway
            .find_one(&Filter::All, &FindOptions::default().sorted(Sort::descending("match_seq_num")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(top["match_seq_num"], json!(30));

        gateway
            .update_one(&Filter::eq("match_seq_num", 20), &object(json!({"detailed": true})))
            .await
            .unwrap();
        assert_eq!(gateway.count(&Filter::not_true("detailed")).await.unwrap(), 2);

        gateway.end_session().await;

        let pool = PgPool::connect(&url).await.unwrap();
        sqlx::query(&format!("DROP TABLE {collection}"))
            .execute(&pool)
            .await
            .unwrap();
    }
}
