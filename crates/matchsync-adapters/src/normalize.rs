//! Payload → `MatchRecord` conversion. No I/O.

use chrono::{Local, TimeZone};
use matchsync_core::{
    fields, Document, FailureClass, MatchRecord, SourceKind, MIN_RANKED_DURATION_SECS,
    RANKED_GAME_MODE, RANKED_LOBBY_TYPES,
};
use matchsync_storage::Payload;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const START_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("expected a json payload, got {len} bytes of text")]
    UnexpectedText { len: usize },
    #[error("payload is missing `{0}`")]
    MissingField(&'static str),
    #[error("upstream reported status {status}: {detail}")]
    Upstream { status: i64, detail: String },
    #[error("match at index {index} is malformed: {source}")]
    Record {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl NormalizeError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Upstream { .. } => FailureClass::Permanent,
            _ => FailureClass::DataShape,
        }
    }
}

/// Convert one upstream payload into canonical records for `kind`.
pub fn normalize(payload: &Payload, kind: SourceKind) -> Result<Vec<MatchRecord>, NormalizeError> {
    let value = match payload {
        Payload::Json(value) => value,
        Payload::Text(text) => return Err(NormalizeError::UnexpectedText { len: text.len() }),
    };
    match kind {
        SourceKind::PublicMatches => normalize_public_matches(value),
        SourceKind::MatchSequence => Ok(sequence_matches(value)?
            .into_iter()
            .enumerate()
            .filter_map(|(index, doc)| sequence_record(index, doc))
            .collect()),
    }
}

/// Typed where the provider's values fit, untyped otherwise. A match is only
/// dropped when it has no usable `match_id`.
fn sequence_record(index: usize, doc: Document) -> Option<MatchRecord> {
    let err = match MatchRecord::from_document(doc.clone()) {
        Ok(record) => return Some(record),
        Err(err) => err,
    };
    match MatchRecord::untyped(doc) {
        Some(record) => {
            debug!(index, match_id = record.match_id, error = %err, "keeping match with untyped fields");
            Some(record)
        }
        None => {
            warn!(index, error = %err, "match has no usable match_id; skipping");
            None
        }
    }
}

/// Ranked, ranked-lobby, longer than the abandon threshold.
pub fn is_ranked_match(raw: &Value) -> bool {
    let game_mode = raw.get("game_mode").and_then(Value::as_u64);
    let lobby_type = raw.get("lobby_type").and_then(Value::as_u64);
    let duration = raw.get("duration").and_then(Value::as_u64);

    game_mode == Some(u64::from(RANKED_GAME_MODE))
        && lobby_type.is_some_and(|l| RANKED_LOBBY_TYPES.iter().any(|&r| u64::from(r) == l))
        && duration.is_some_and(|d| d > MIN_RANKED_DURATION_SECS)
}

/// Epoch seconds → local `YYYY-MM-DD HH:MM:SS`.
pub fn format_start_time(epoch_secs: i64) -> Option<String> {
    Local
        .timestamp_opt(epoch_secs, 0)
        .single()
        .map(|dt| dt.format(START_TIME_FORMAT).to_string())
}

fn normalize_public_matches(value: &Value) -> Result<Vec<MatchRecord>, NormalizeError> {
    let matches = value.as_array().ok_or(NormalizeError::MissingField("[]"))?;

    let mut records = Vec::new();
    for (index, raw) in matches.iter().enumerate() {
        if !is_ranked_match(raw) {
            continue;
        }
        let mut raw = raw.clone();
        if let Some(formatted) = raw
            .get(fields::START_TIME)
            .and_then(Value::as_i64)
            .and_then(format_start_time)
        {
            raw[fields::START_TIME] = Value::String(formatted);
        }
        let record: MatchRecord =
            serde_json::from_value(raw).map_err(|source| NormalizeError::Record { index, source })?;
        records.push(record);
    }
    Ok(records)
}

/// The `result.matches` array of a sequence-number response, untouched.
pub fn sequence_matches(value: &Value) -> Result<Vec<Document>, NormalizeError> {
    let result = value.get("result").ok_or(NormalizeError::MissingField("result"))?;

    if let Some(status) = result.get("status").and_then(Value::as_i64) {
        if status != 1 {
            let detail = result
                .get("statusDetail")
                .and_then(Value::as_str)
                .unwrap_or("no detail")
                .to_string();
            return Err(NormalizeError::Upstream { status, detail });
        }
    }

    let matches = result
        .get("matches")
        .and_then(Value::as_array)
        .ok_or(NormalizeError::MissingField("result.matches"))?;

    Ok(matches
        .iter()
        .filter_map(|m| m.as_object().cloned())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchsync_core::StartTime;
    use serde_json::json;

    fn public(value: Value) -> Vec<MatchRecord> {
        normalize(&Payload::Json(value), SourceKind::PublicMatches).expect("normalize")
    }

    #[test]
    fn ranked_long_match_is_kept_with_formatted_start_time() {
        let records = public(json!([{
            "match_id": 7400000001u64,
            "match_seq_num": 6200000001u64,
            "game_mode": 22,
            "lobby_type": 7,
            "duration": 1000,
            "start_time": 1700000000,
            "radiant_win": true,
            "radiant_team": [1, 2, 3, 4, 5],
        }]));

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.duration, Some(1000));
        assert_eq!(record.radiant_win, Some(true));
        let expected = Local
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .unwrap()
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        assert_eq!(record.start_time, Some(StartTime::Formatted(expected)));
        assert_eq!(record.extra["radiant_team"], json!([1, 2, 3, 4, 5]));
        assert!(record.detailed.is_none());
    }

    #[test]
    fn unranked_wrong_lobby_and_short_matches_are_dropped() {
        let records = public(json!([
            {"match_id": 1, "game_mode": 23, "lobby_type": 7, "duration": 2000, "start_time": 1},
            {"match_id": 2, "game_mode": 22, "lobby_type": 0, "duration": 2000, "start_time": 1},
            {"match_id": 3, "game_mode": 22, "lobby_type": 7, "duration": 900, "start_time": 1},
            {"match_id": 4, "game_mode": 22, "lobby_type": 6, "duration": 901, "start_time": 1},
            {"match_id": 5, "lobby_type": 7, "duration": 2000},
        ]));
        let ids: Vec<u64> = records.iter().map(|r| r.match_id).collect();
        assert_eq!(ids, vec![4]);
    }

    #[test]
    fn empty_batch_is_empty_not_an_error() {
        assert!(public(json!([])).is_empty());
        let steam = normalize(
            &Payload::Json(json!({"result": {"status": 1, "matches": []}})),
            SourceKind::MatchSequence,
        )
        .unwrap();
        assert!(steam.is_empty());
    }

    #[test]
    fn sequence_source_passes_matches_through_unfiltered() {
        let payload = Payload::Json(json!({"result": {"status": 1, "matches": [
            {"match_id": 10, "match_seq_num": 100, "game_mode": 1, "lobby_type": 0, "duration": 60, "start_time": 1700000000},
            {"match_id": 11, "match_seq_num": 101, "players": [{"hero_id": 5}]},
        ]}}));
        let records = normalize(&payload, SourceKind::MatchSequence).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].start_time, Some(StartTime::Epoch(1_700_000_000)));
        assert_eq!(records[1].extra["players"], json!([{"hero_id": 5}]));
        assert!(records.iter().all(|r| r.detailed.is_none()));
    }

    #[test]
    fn odd_sequence_values_do_not_sink_the_batch() {
        let payload = Payload::Json(json!({"result": {"status": 1, "matches": [
            {"match_id": 10, "match_seq_num": 100, "lobby_type": 7},
            {"match_id": 11, "match_seq_num": 101, "lobby_type": -1},
            {"match_seq_num": 102, "lobby_type": 7},
            {"match_id": 13, "match_seq_num": 103, "lobby_type": 7},
        ]}}));
        let records = normalize(&payload, SourceKind::MatchSequence).unwrap();

        let seqs: Vec<Option<u64>> = records.iter().map(|r| r.match_seq_num).collect();
        assert_eq!(seqs, vec![Some(100), Some(101), Some(103)]);
        assert_eq!(records[1].lobby_type, None);
        assert_eq!(records[1].extra["lobby_type"], json!(-1));
        assert_eq!(records[2].lobby_type, Some(7));
    }

    #[test]
    fn upstream_status_failure_is_permanent() {
        let err = sequence_matches(&json!({"result": {"status": 8, "statusDetail": "matches_requested must be > 0"}}))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::Upstream { status: 8, .. }));
        assert_eq!(err.class(), FailureClass::Permanent);
    }

    #[test]
    fn missing_matches_array_is_a_data_shape_failure() {
        let err = sequence_matches(&json!({"result": {"status": 1}})).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingField("result.matches")));
        assert_eq!(err.class(), FailureClass::DataShape);
    }

    #[test]
    fn text_payload_is_rejected() {
        let err = normalize(&Payload::Text("<html>".into()), SourceKind::PublicMatches).unwrap_err();
        assert!(matches!(err, NormalizeError::UnexpectedText { len: 6 }));
    }
}
