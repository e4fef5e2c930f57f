//! Process configuration and the source registry.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use matchsync_adapters::{OPENDOTA_BASE_URL, STEAM_BASE_URL};
use matchsync_core::SourceKind;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_SOURCE_ID: &str = "opendota-public";
pub const REGISTRY_FILE: &str = "sources.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name}={value:?} is not a valid {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("unknown source {0:?}")]
    UnknownSource(String),
    #[error("source {0:?} is disabled")]
    DisabledSource(String),
    #[error("no enabled match_sequence source is configured for detail lookups")]
    NoDetailSource,
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub api_key: Option<String>,
    pub language: String,
    pub source_id: String,
    pub populate_interval: Duration,
    pub reconcile_interval: Duration,
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub min_rank: Option<u32>,
    pub max_rank: Option<u32>,
    pub less_than_match_id: Option<u64>,
    pub reconcile_limit: Option<usize>,
    pub http_timeout_secs: u64,
    /// Minimum spacing between provider requests.
    pub min_request_interval: Option<Duration>,
    pub user_agent: String,
    pub logging_enabled: bool,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            api_key: get("DOTA2_API_KEY"),
            language: get("MATCHSYNC_LANGUAGE").unwrap_or_else(|| "en_us".to_string()),
            source_id: get("MATCHSYNC_SOURCE").unwrap_or_else(|| DEFAULT_SOURCE_ID.to_string()),
            populate_interval: Duration::from_secs(parse_or("MATCHSYNC_POPULATE_SECS", get("MATCHSYNC_POPULATE_SECS"), 900)?),
            reconcile_interval: Duration::from_secs(parse_or("MATCHSYNC_RECONCILE_SECS", get("MATCHSYNC_RECONCILE_SECS"), 1800)?),
            poll_interval: Duration::from_secs(parse_or("MATCHSYNC_POLL_SECS", get("MATCHSYNC_POLL_SECS"), 300)?),
            batch_size: parse_or("MATCHSYNC_BATCH_SIZE", get("MATCHSYNC_BATCH_SIZE"), 100)?,
            min_rank: parse_opt("MATCHSYNC_MIN_RANK", get("MATCHSYNC_MIN_RANK"))?,
            max_rank: parse_opt("MATCHSYNC_MAX_RANK", get("MATCHSYNC_MAX_RANK"))?,
            less_than_match_id: parse_opt("MATCHSYNC_LESS_THAN_MATCH_ID", get("MATCHSYNC_LESS_THAN_MATCH_ID"))?,
            reconcile_limit: parse_opt("MATCHSYNC_RECONCILE_LIMIT", get("MATCHSYNC_RECONCILE_LIMIT"))?,
            http_timeout_secs: parse_or("MATCHSYNC_HTTP_TIMEOUT_SECS", get("MATCHSYNC_HTTP_TIMEOUT_SECS"), 20)?,
            min_request_interval: parse_opt("MATCHSYNC_MIN_REQUEST_INTERVAL_MS", get("MATCHSYNC_MIN_REQUEST_INTERVAL_MS"))?
                .map(Duration::from_millis),
            user_agent: get("MATCHSYNC_USER_AGENT").unwrap_or_else(|| "matchsync/0.1".to_string()),
            logging_enabled: match get("MATCHSYNC_LOG") {
                Some(v) => parse_bool("MATCHSYNC_LOG", &v)?,
                None => true,
            },
            workspace_root: get("MATCHSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }
}

fn parse_opt<T: FromStr>(name: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    raw.map(|value| {
        value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
            expected: std::any::type_name::<T>(),
        })
    })
    .transpose()
}

fn parse_or<T: FromStr>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    Ok(parse_opt(name, raw)?.unwrap_or(default))
}

pub fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" | "yes" | "on" => Ok(true),
        "0" | "false" | "FALSE" | "False" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            name,
            value: other.to_string(),
            expected: "bool",
        }),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: SourceKind,
    pub base_url: String,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn collection(&self) -> &str {
        self.collection
            .as_deref()
            .unwrap_or_else(|| self.kind.default_collection())
    }
}

impl SourceRegistry {
    /// The two providers this system ships with.
    pub fn builtin() -> Self {
        Self {
            sources: vec![
                SourceConfig {
                    source_id: DEFAULT_SOURCE_ID.to_string(),
                    kind: SourceKind::PublicMatches,
                    base_url: OPENDOTA_BASE_URL.to_string(),
                    collection: None,
                    enabled: true,
                    notes: None,
                },
                SourceConfig {
                    source_id: "steam-sequence".to_string(),
                    kind: SourceKind::MatchSequence,
                    base_url: STEAM_BASE_URL.to_string(),
                    collection: None,
                    enabled: true,
                    notes: None,
                },
            ],
        }
    }

    /// `<root>/sources.yaml` if it exists, the built-in registry otherwise.
    pub fn load(workspace_root: &Path) -> Result<Self, ConfigError> {
        let path = workspace_root.join(REGISTRY_FILE);
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn find(&self, source_id: &str) -> Result<&SourceConfig, ConfigError> {
        let source = self
            .sources
            .iter()
            .find(|s| s.source_id == source_id)
            .ok_or_else(|| ConfigError::UnknownSource(source_id.to_string()))?;
        if !source.enabled {
            return Err(ConfigError::DisabledSource(source_id.to_string()));
        }
        Ok(source)
    }

    /// First enabled sequence-number source; detail lookups go through it.
    pub fn detail_source(&self) -> Result<&SourceConfig, ConfigError> {
        self.sources
            .iter()
            .find(|s| s.enabled && s.kind == SourceKind::MatchSequence)
            .ok_or(ConfigError::NoDetailSource)
    }
}
