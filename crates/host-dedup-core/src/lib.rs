use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use ulid::Ulid;

mod facts;
mod resolver;
mod scanner;
mod staleness;
pub mod testing;

pub use facts::{
    extract_elevated, extract_regular, identity_facts, match_filter, narrow_elevated,
    CanonicalFacts, FactExpr, FactValue, MatchBasis, ELEVATED_CANONICAL_FACTS,
    MULTI_VALUED_CANONICAL_FACTS, REGULAR_CANONICAL_FACTS,
};
pub use resolver::{
    CancellationSignal, DeleteOutcome, DuplicateResolver, EmitFailurePolicy, EventEmitter,
    HostStore, NeverStop, ResolverOptions, RunSummary, DEFAULT_CHUNK_SIZE,
};
pub use scanner::{AccountHosts, ChunkedAccountScanner};
pub use staleness::{
    classify, StalenessClock, StalenessConfig, StalenessOffsets, StalenessState,
    StalenessTimestamps, StalenessWindow,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DedupError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("event emission failed for host {host_id}: {message}")]
    EventEmission { host_id: HostId, message: String },
    #[error("event flush failed: {0}")]
    EventFlush(String),
    #[error("malformed canonical facts: {0}")]
    MalformedFacts(String),
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HostId(pub Ulid);

impl HostId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for HostId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for HostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HostId {
    type Err = DedupError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| DedupError::Storage(format!("invalid host id {raw}: {err}")))
    }
}

/// Selects which staleness offsets apply to a host.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HostType {
    #[default]
    Conventional,
    Edge,
}

impl HostType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conventional => "conventional",
            Self::Edge => "edge",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "conventional" => Some(Self::Conventional),
            "edge" => Some(Self::Edge),
            _ => None,
        }
    }
}

/// One reporting agent's view of a machine.
///
/// `canonical_facts` is kept as the raw stored mapping; typed access goes through
/// [`CanonicalFacts::from_json`] so a malformed value never prevents loading the row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: HostId,
    pub account: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub reporter: Option<String>,
    #[serde(default)]
    pub host_type: HostType,
    pub canonical_facts: Map<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_on: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub stale_timestamp: OffsetDateTime,
}

impl Host {
    /// Validate the identity fields every stored host must carry.
    ///
    /// # Errors
    /// Returns [`DedupError::Storage`] when the account is blank.
    pub fn validate(&self) -> Result<(), DedupError> {
        if self.account.trim().is_empty() {
            return Err(DedupError::Storage(format!("host {} MUST have an account", self.id)));
        }
        Ok(())
    }
}

/// Payload published for every host removed as a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostDeleteEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: HostId,
    pub account: String,
    pub display_name: Option<String>,
    pub reporter: Option<String>,
    pub canonical_facts: Map<String, Value>,
    pub survivor_id: HostId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl HostDeleteEvent {
    pub const EVENT_TYPE: &'static str = "delete";

    #[must_use]
    pub fn for_duplicate(deleted: &Host, survivor_id: HostId, timestamp: OffsetDateTime) -> Self {
        Self {
            event_type: Self::EVENT_TYPE.to_string(),
            id: deleted.id,
            account: deleted.account.clone(),
            display_name: deleted.display_name.clone(),
            reporter: deleted.reporter.clone(),
            canonical_facts: deleted.canonical_facts.clone(),
            survivor_id,
            timestamp,
        }
    }
}
