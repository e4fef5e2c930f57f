//! Source adapter contracts: typed requests, URL building, normalization and
//! per-match detail lookup for the supported match providers.

use std::sync::Arc;

use async_trait::async_trait;
use matchsync_core::{fields, Document, FailureClass, MatchRecord, SourceKind};
use matchsync_storage::{FetchError, HttpFetcher, Payload};
use reqwest::Url;
use serde_json::Value;
use thiserror::Error;

pub mod normalize;

pub use normalize::{normalize, NormalizeError};

pub const CRATE_NAME: &str = "matchsync-adapters";

pub const OPENDOTA_BASE_URL: &str = "https://api.opendota.com/api";
pub const STEAM_BASE_URL: &str = "https://api.steampowered.com";

const PUBLIC_MATCHES_ROUTE: &str = "/publicMatches";
const MATCH_HISTORY_BY_SEQ_NUM_ROUTE: &str = "/IDOTA2Match_570/GetMatchHistoryBySequenceNum/v1/";

/// Upper bound the sequence endpoint accepts for `matches_requested`.
pub const MAX_MATCHES_REQUESTED: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicMatchesQuery {
    pub less_than_match_id: Option<u64>,
    pub min_rank: Option<u32>,
    pub max_rank: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceQuery {
    pub start_at_match_seq_num: Option<u64>,
    pub matches_requested: u32,
}

impl SequenceQuery {
    /// Exactly one match at `match_seq_num` (or the next one upstream has).
    pub fn single(match_seq_num: u64) -> Self {
        Self {
            start_at_match_seq_num: Some(match_seq_num),
            matches_requested: 1,
        }
    }
}

/// One outbound request, with the options each endpoint recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRequest {
    PublicMatches(PublicMatchesQuery),
    MatchHistoryBySequence(SequenceQuery),
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("{kind} source requires an api key")]
    MissingApiKey { kind: SourceKind },
    #[error("{request} request cannot be sent to a {source_kind} source")]
    KindMismatch {
        request: SourceKind,
        source_kind: SourceKind,
    },
    #[error("invalid base url {url}: {reason}")]
    BaseUrl { url: String, reason: String },
}

impl From<RequestError> for FetchError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::MissingApiKey { .. } => FetchError::Unauthenticated(err.to_string()),
            other => FetchError::InvalidRequest(other.to_string()),
        }
    }
}

impl FetchRequest {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::PublicMatches(_) => SourceKind::PublicMatches,
            Self::MatchHistoryBySequence(_) => SourceKind::MatchSequence,
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        match self {
            Self::PublicMatches(q) => {
                if let (Some(min), Some(max)) = (q.min_rank, q.max_rank) {
                    if min > max {
                        return Err(RequestError::InvalidParameter(format!(
                            "min_rank {min} exceeds max_rank {max}"
                        )));
                    }
                }
            }
            Self::MatchHistoryBySequence(q) => {
                if !(1..=MAX_MATCHES_REQUESTED).contains(&q.matches_requested) {
                    return Err(RequestError::InvalidParameter(format!(
                        "matches_requested must be within 1..={MAX_MATCHES_REQUESTED}, got {}",
                        q.matches_requested
                    )));
                }
            }
        }
        Ok(())
    }

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        match self {
            Self::PublicMatches(q) => {
                if let Some(id) = q.less_than_match_id {
                    pairs.push(("less_than_match_id", id.to_string()));
                }
                if let Some(min) = q.min_rank {
                    pairs.push(("min_rank", min.to_string()));
                }
                if let Some(max) = q.max_rank {
                    pairs.push(("max_rank", max.to_string()));
                }
            }
            Self::MatchHistoryBySequence(q) => {
                if let Some(start) = q.start_at_match_seq_num {
                    pairs.push(("start_at_match_seq_num", start.to_string()));
                }
                pairs.push(("matches_requested", q.matches_requested.to_string()));
            }
        }
        pairs
    }
}

/// Key, locale and response format injected into keyed provider requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub api_key: Option<String>,
    pub language: String,
}

impl Default for ProviderCredentials {
    fn default() -> Self {
        Self {
            api_key: None,
            language: "en_us".to_string(),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    fn build_url(&self, request: &FetchRequest) -> Result<Url, RequestError>;

    async fn fetch(&self, http: &HttpFetcher, request: &FetchRequest) -> Result<Payload, FetchError> {
        let url = self.build_url(request)?;
        http.fetch(self.source_id(), &url).await
    }

    fn normalize(&self, payload: &Payload) -> Result<Vec<MatchRecord>, NormalizeError> {
        normalize(payload, self.kind())
    }
}

fn parse_base(base_url: &str) -> Result<String, RequestError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    Url::parse(trimmed).map_err(|err| RequestError::BaseUrl {
        url: base_url.to_string(),
        reason: err.to_string(),
    })?;
    Ok(trimmed.to_string())
}

fn endpoint(base: &str, route: &str, pairs: &[(&str, String)]) -> Result<Url, RequestError> {
    Url::parse_with_params(&format!("{base}{route}"), pairs).map_err(|err| RequestError::BaseUrl {
        url: base.to_string(),
        reason: err.to_string(),
    })
}

fn check_kind(adapter: SourceKind, request: &FetchRequest) -> Result<(), RequestError> {
    if request.kind() != adapter {
        return Err(RequestError::KindMismatch {
            request: request.kind(),
            source_kind: adapter,
        });
    }
    request.validate()
}

/// Anonymous public-matches feed. No credentials are sent.
#[derive(Debug, Clone)]
pub struct PublicMatchesAdapter {
    source_id: String,
    base_url: String,
}

impl PublicMatchesAdapter {
    pub fn new(source_id: impl Into<String>, base_url: &str) -> Result<Self, RequestError> {
        Ok(Self {
            source_id: source_id.into(),
            base_url: parse_base(base_url)?,
        })
    }
}

#[async_trait]
impl SourceAdapter for PublicMatchesAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::PublicMatches
    }

    fn build_url(&self, request: &FetchRequest) -> Result<Url, RequestError> {
        check_kind(self.kind(), request)?;
        endpoint(&self.base_url, PUBLIC_MATCHES_ROUTE, &request.query_pairs())
    }
}

/// Keyed match-history-by-sequence-number feed.
#[derive(Debug, Clone)]
pub struct MatchSequenceAdapter {
    source_id: String,
    base_url: String,
    credentials: ProviderCredentials,
}

impl MatchSequenceAdapter {
    pub fn new(
        source_id: impl Into<String>,
        base_url: &str,
        credentials: ProviderCredentials,
    ) -> Result<Self, RequestError> {
        Ok(Self {
            source_id: source_id.into(),
            base_url: parse_base(base_url)?,
            credentials,
        })
    }
}

#[async_trait]
impl SourceAdapter for MatchSequenceAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::MatchSequence
    }

    fn build_url(&self, request: &FetchRequest) -> Result<Url, RequestError> {
        check_kind(self.kind(), request)?;
        let key = self
            .credentials
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(RequestError::MissingApiKey { kind: self.kind() })?;

        let mut pairs = request.query_pairs();
        pairs.push(("key", key.to_string()));
        pairs.push(("language", self.credentials.language.clone()));
        pairs.push(("format", "json".to_string()));
        endpoint(&self.base_url, MATCH_HISTORY_BY_SEQ_NUM_ROUTE, &pairs)
    }
}

pub fn adapter_for_source(
    source_id: &str,
    kind: SourceKind,
    base_url: &str,
    credentials: &ProviderCredentials,
) -> Result<Box<dyn SourceAdapter>, RequestError> {
    Ok(match kind {
        SourceKind::PublicMatches => Box::new(PublicMatchesAdapter::new(source_id, base_url)?),
        SourceKind::MatchSequence => Box::new(MatchSequenceAdapter::new(
            source_id,
            base_url,
            credentials.clone(),
        )?),
    })
}

#[derive(Debug, Error)]
pub enum DetailError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("no match returned for sequence number {0}")]
    Empty(u64),
    #[error("requested sequence number {requested}, upstream returned {returned:?}")]
    SequenceMismatch { requested: u64, returned: Option<u64> },
}

impl DetailError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Fetch(err) => err.class(),
            Self::Normalize(err) => err.class(),
            Self::Empty(_) | Self::SequenceMismatch { .. } => FailureClass::DataShape,
        }
    }
}

/// Looks up the full record for one match by its sequence number.
#[async_trait]
pub trait MatchDetailSource: Send + Sync {
    async fn fetch_detail(&self, match_seq_num: u64) -> Result<Document, DetailError>;
}

pub struct SequenceDetailSource {
    http: Arc<HttpFetcher>,
    adapter: MatchSequenceAdapter,
}

impl SequenceDetailSource {
    pub fn new(http: Arc<HttpFetcher>, adapter: MatchSequenceAdapter) -> Self {
        Self { http, adapter }
    }
}

#[async_trait]
impl MatchDetailSource for SequenceDetailSource {
    async fn fetch_detail(&self, match_seq_num: u64) -> Result<Document, DetailError> {
        let request = FetchRequest::MatchHistoryBySequence(SequenceQuery::single(match_seq_num));
        let payload = self.adapter.fetch(&self.http, &request).await?;
        let value = payload
            .as_json()
            .ok_or_else(|| NormalizeError::UnexpectedText {
                len: match &payload {
                    Payload::Text(text) => text.len(),
                    Payload::Json(_) => 0,
                },
            })?;

        let detail = normalize::sequence_matches(value)?
            .into_iter()
            .next()
            .ok_or(DetailError::Empty(match_seq_num))?;

        let returned = detail.get(fields::MATCH_SEQ_NUM).and_then(Value::as_u64);
        if returned != Some(match_seq_num) {
            return Err(DetailError::SequenceMismatch {
                requested: match_seq_num,
                returned,
            });
        }
        Ok(detail)
    }
}
