//! Core domain model for match ingestion.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "matchsync-core";

/// Game mode code for ranked all-pick.
pub const RANKED_GAME_MODE: u32 = 22;

/// Lobby type codes accepted as ranked lobbies.
pub const RANKED_LOBBY_TYPES: &[u32] = &[6, 7];

/// Matches at or below this duration (seconds) are treated as abandoned noise.
pub const MIN_RANKED_DURATION_SECS: u64 = 900;

/// Field names shared by the store layout and the reconciliation pass.
pub mod fields {
    pub const MATCH_ID: &str = "match_id";
    pub const MATCH_SEQ_NUM: &str = "match_seq_num";
    pub const START_TIME: &str = "start_time";
    pub const DETAILED: &str = "detailed";
    /// Set when a detail lookup came back unusable; such records leave the
    /// reconciliation scan.
    pub const DETAIL_SKIPPED: &str = "detail_skipped";
}

/// Schemaless stored document, keyed by field name.
pub type Document = Map<String, Value>;

/// Which upstream shape a source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Anonymous public-matches feed; terse records filtered to ranked play.
    PublicMatches,
    /// Keyed match-history-by-sequence-number feed.
    MatchSequence,
}

impl SourceKind {
    pub fn default_collection(self) -> &'static str {
        match self {
            Self::PublicMatches => "matches",
            Self::MatchSequence => "matches_steam",
        }
    }

    /// Whether records from this source carry a resumable sequence cursor.
    pub fn uses_sequence_cursor(self) -> bool {
        matches!(self, Self::MatchSequence)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PublicMatches => "public_matches",
            Self::MatchSequence => "match_sequence",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start time as stored: normalized text for filtered sources, raw epoch otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartTime {
    Epoch(i64),
    Formatted(String),
}

/// One completed game as persisted in a match collection.
///
/// Fields the ingestion core does not interpret (team compositions, player
/// slots, rank tiers) ride along in `extra` so nothing the provider sent is lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_seq_num: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<StartTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lobby_type: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radiant_win: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detailed: Option<bool>,
    #[serde(flatten)]
    pub extra: Document,
}

impl MatchRecord {
    pub fn is_detailed(&self) -> bool {
        self.detailed.unwrap_or(false)
    }

    /// Ranked mode, ranked lobby and long enough to not be an abandon.
    pub fn is_ranked_candidate(&self) -> bool {
        self.game_mode == Some(RANKED_GAME_MODE)
            && self
                .lobby_type
                .is_some_and(|lobby| RANKED_LOBBY_TYPES.contains(&lobby))
            && self
                .duration
                .is_some_and(|secs| secs > MIN_RANKED_DURATION_SECS)
    }

    pub fn to_document(&self) -> Result<Document, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "match record serialized to non-object {other}"
            ))),
        }
    }

    pub fn from_document(doc: Document) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(doc))
    }

    /// Type only the identifiers and carry every other field as sent. `None`
    /// without an unsigned `match_id`.
    pub fn untyped(mut doc: Document) -> Option<Self> {
        let match_id = doc.get(fields::MATCH_ID).and_then(Value::as_u64)?;
        doc.remove(fields::MATCH_ID);
        let match_seq_num = doc.get(fields::MATCH_SEQ_NUM).and_then(Value::as_u64);
        if match_seq_num.is_some() {
            doc.remove(fields::MATCH_SEQ_NUM);
        }
        Some(Self {
            match_id,
            match_seq_num,
            start_time: None,
            duration: None,
            game_mode: None,
            lobby_type: None,
            radiant_win: None,
            detailed: None,
            extra: doc,
        })
    }
}

/// Failure taxonomy shared by every error type in the ingestion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Connection refused, timeout, server selection. Retried with backoff.
    Transient,
    /// HTTP status, authentication, malformed request, validation. Never retried.
    Permanent,
    /// Payload lacks an expected field. Skipped at the narrowest scope.
    DataShape,
    /// Unique-key collision on insert. Treated as success.
    Duplicate,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}
