use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{DedupError, HostType};

const HOUR_SECONDS: i64 = 3_600;
const DAY_SECONDS: i64 = 86_400;
const MAX_OFFSET_SECONDS: i64 = 100 * 365 * DAY_SECONDS;

/// Seconds after `stale_timestamp` at which each lifecycle boundary is reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StalenessOffsets {
    pub time_to_stale: i64,
    pub time_to_stale_warning: i64,
    pub time_to_delete: i64,
}

impl StalenessOffsets {
    #[must_use]
    pub const fn new(time_to_stale: i64, time_to_stale_warning: i64, time_to_delete: i64) -> Self {
        Self { time_to_stale, time_to_stale_warning, time_to_delete }
    }

    #[must_use]
    pub const fn conventional_default() -> Self {
        Self::new(29 * HOUR_SECONDS, 7 * DAY_SECONDS, 14 * DAY_SECONDS)
    }

    #[must_use]
    pub const fn immutable_default() -> Self {
        Self::new(2 * DAY_SECONDS, 180 * DAY_SECONDS, 730 * DAY_SECONDS)
    }

    /// # Errors
    /// Returns [`DedupError::Config`] unless `0 < stale <= warning <= delete` within bounds.
    pub fn validate(&self, label: &str) -> Result<(), DedupError> {
        if self.time_to_stale <= 0 {
            return Err(DedupError::Config(format!("{label}.time_to_stale MUST be > 0")));
        }
        if self.time_to_stale_warning < self.time_to_stale {
            return Err(DedupError::Config(format!(
                "{label}.time_to_stale_warning MUST be >= time_to_stale"
            )));
        }
        if self.time_to_delete < self.time_to_stale_warning {
            return Err(DedupError::Config(format!(
                "{label}.time_to_delete MUST be >= time_to_stale_warning"
            )));
        }
        if self.time_to_delete > MAX_OFFSET_SECONDS {
            return Err(DedupError::Config(format!(
                "{label}.time_to_delete MUST be <= {MAX_OFFSET_SECONDS} seconds"
            )));
        }
        Ok(())
    }
}

/// Per-tenant offsets for both host types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct StalenessConfig {
    pub conventional: StalenessOffsets,
    pub immutable: StalenessOffsets,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            conventional: StalenessOffsets::conventional_default(),
            immutable: StalenessOffsets::immutable_default(),
        }
    }
}

impl StalenessConfig {
    #[must_use]
    pub fn offsets(&self, host_type: HostType) -> StalenessOffsets {
        match host_type {
            HostType::Conventional => self.conventional,
            HostType::Edge => self.immutable,
        }
    }

    /// # Errors
    /// Returns [`DedupError::Config`] when either offset set is out of order.
    pub fn validate(&self) -> Result<(), DedupError> {
        self.conventional.validate("conventional")?;
        self.immutable.validate("immutable")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StalenessState {
    Fresh,
    Stale,
    StaleWarning,
    Culled,
}

impl StalenessState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::StaleWarning => "stale_warning",
            Self::Culled => "culled",
        }
    }
}

/// Classify against the stale and stale-warning boundaries only.
///
/// The stale boundary is inclusive on the stale side. Culling is a separate
/// terminal check; see [`StalenessClock::state_of`].
#[must_use]
pub fn classify(
    now: OffsetDateTime,
    stale_at: OffsetDateTime,
    stale_warning_at: OffsetDateTime,
) -> StalenessState {
    if now < stale_at {
        StalenessState::Fresh
    } else if now < stale_warning_at {
        StalenessState::Stale
    } else {
        StalenessState::StaleWarning
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StalenessTimestamps {
    #[serde(with = "time::serde::rfc3339")]
    pub stale_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub stale_warning_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub culled_at: OffsetDateTime,
}

/// Range over a host's reference timestamp: `after < ts <= up_to`, either side open.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StalenessWindow {
    pub after: Option<OffsetDateTime>,
    pub up_to: Option<OffsetDateTime>,
}

impl StalenessWindow {
    #[must_use]
    pub fn contains(&self, reference: OffsetDateTime) -> bool {
        self.after.map_or(true, |after| reference > after)
            && self.up_to.map_or(true, |up_to| reference <= up_to)
    }
}

/// Lifecycle arithmetic pinned to one instant.
///
/// `now` is captured once so every boundary derived during a pass agrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StalenessClock {
    now: OffsetDateTime,
    config: StalenessConfig,
}

impl StalenessClock {
    #[must_use]
    pub fn new(config: StalenessConfig) -> Self {
        Self::at(OffsetDateTime::now_utc(), config)
    }

    #[must_use]
    pub fn at(now: OffsetDateTime, config: StalenessConfig) -> Self {
        Self { now, config }
    }

    #[must_use]
    pub fn now(&self) -> OffsetDateTime {
        self.now
    }

    #[must_use]
    pub fn config(&self) -> &StalenessConfig {
        &self.config
    }

    /// Same instant, different tenant offsets.
    #[must_use]
    pub fn with_config(&self, config: StalenessConfig) -> Self {
        Self { now: self.now, config }
    }

    #[must_use]
    pub fn timestamps(
        &self,
        stale_timestamp: OffsetDateTime,
        host_type: HostType,
    ) -> StalenessTimestamps {
        let offsets = self.config.offsets(host_type);
        StalenessTimestamps {
            stale_at: stale_timestamp.saturating_add(Duration::seconds(offsets.time_to_stale)),
            stale_warning_at: stale_timestamp
                .saturating_add(Duration::seconds(offsets.time_to_stale_warning)),
            culled_at: stale_timestamp.saturating_add(Duration::seconds(offsets.time_to_delete)),
        }
    }

    #[must_use]
    pub fn state_of(&self, stale_timestamp: OffsetDateTime, host_type: HostType) -> StalenessState {
        let timestamps = self.timestamps(stale_timestamp, host_type);
        if self.now >= timestamps.culled_at {
            return StalenessState::Culled;
        }
        classify(self.now, timestamps.stale_at, timestamps.stale_warning_at)
    }

    #[must_use]
    pub fn is_culled(&self, stale_timestamp: OffsetDateTime, host_type: HostType) -> bool {
        self.state_of(stale_timestamp, host_type) == StalenessState::Culled
    }

    #[must_use]
    pub fn fresh(&self, host_type: HostType) -> StalenessWindow {
        StalenessWindow { after: Some(self.stale_boundary(host_type)), up_to: None }
    }

    #[must_use]
    pub fn stale(&self, host_type: HostType) -> StalenessWindow {
        StalenessWindow {
            after: Some(self.stale_warning_boundary(host_type)),
            up_to: Some(self.stale_boundary(host_type)),
        }
    }

    #[must_use]
    pub fn stale_warning(&self, host_type: HostType) -> StalenessWindow {
        StalenessWindow {
            after: Some(self.culled_boundary(host_type)),
            up_to: Some(self.stale_warning_boundary(host_type)),
        }
    }

    #[must_use]
    pub fn culled(&self, host_type: HostType) -> StalenessWindow {
        StalenessWindow { after: None, up_to: Some(self.culled_boundary(host_type)) }
    }

    #[must_use]
    pub fn not_culled(&self, host_type: HostType) -> StalenessWindow {
        StalenessWindow { after: Some(self.culled_boundary(host_type)), up_to: None }
    }

    fn stale_boundary(&self, host_type: HostType) -> OffsetDateTime {
        self.boundary(self.config.offsets(host_type).time_to_stale)
    }

    fn stale_warning_boundary(&self, host_type: HostType) -> OffsetDateTime {
        self.boundary(self.config.offsets(host_type).time_to_stale_warning)
    }

    fn culled_boundary(&self, host_type: HostType) -> OffsetDateTime {
        self.boundary(self.config.offsets(host_type).time_to_delete)
    }

    fn boundary(&self, offset_seconds: i64) -> OffsetDateTime {
        self.now.saturating_sub(Duration::seconds(offset_seconds))
    }
}
