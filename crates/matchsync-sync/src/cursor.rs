//! Resume point for sequence-number ingestion, derived from stored data.

use matchsync_core::fields::MATCH_SEQ_NUM;
use matchsync_storage::{Filter, FindOptions, Projection, Sort, StoreGateway, StoreResult};
use serde_json::Value;

/// Highest `match_seq_num` stored in the gateway's collection, or `None` when
/// nothing with a sequence number has been ingested yet.
///
/// The cursor only ever reflects durably stored records, so a batch that fails
/// to persist is fetched again on the next run.
pub async fn latest_sequence_number(gateway: &StoreGateway) -> StoreResult<Option<u64>> {
    let options = FindOptions::default()
        .sorted(Sort::descending(MATCH_SEQ_NUM))
        .projected(Projection::include([MATCH_SEQ_NUM]));
    let top = gateway.find_one(&Filter::exists(MATCH_SEQ_NUM), &options).await?;
    Ok(top.and_then(|doc| doc.get(MATCH_SEQ_NUM).and_then(Value::as_u64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchsync_core::Document;
    use matchsync_storage::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().expect("object")
    }

    async fn gateway(store: &MemoryStore) -> StoreGateway {
        let mut gateway = StoreGateway::new(Arc::new(store.clone()), "matches_steam").with_unique_index("match_id");
        gateway.connect().await.expect("connect");
        gateway
    }

    #[tokio::test]
    async fn empty_collection_has_no_cursor() {
        let store = MemoryStore::new();
        let gateway = gateway(&store).await;
        assert_eq!(latest_sequence_number(&gateway).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cursor_is_the_maximum_not_the_latest_inserted() {
        let store = MemoryStore::new();
        let gateway = gateway(&store).await;
        gateway
            .upsert_many(&[
                doc(json!({"match_id": 1, "match_seq_num": 500})),
                doc(json!({"match_id": 2, "match_seq_num": 900})),
                doc(json!({"match_id": 3, "match_seq_num": 700})),
                doc(json!({"match_id": 4})),
            ])
            .await
            .unwrap();
        assert_eq!(latest_sequence_number(&gateway).await.unwrap(), Some(900));
    }
}
