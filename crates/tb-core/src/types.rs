//! Core type definitions for TimeBlocker
//!
//! These types map directly to the records kept in the extension's
//! key-value storage and to the messages exchanged with the extension's
//! scripts.

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};

/// Unix epoch milliseconds, as reported by the browser.
pub type Millis = i64;

/// Browser tab identifier.
pub type TabId = i32;

pub const MS_PER_MINUTE: Millis = 60_000;

// =============================================================================
// Day Key
// =============================================================================

/// Calendar day a set of counters applies to, as `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(transparent)]
pub struct DayKey(String);

impl DayKey {
    /// Day containing `at`, in the zone `utc_offset_minutes` east of UTC.
    ///
    /// Offsets outside +/-24h fall back to UTC.
    pub fn for_timestamp(at: Millis, utc_offset_minutes: i32) -> Self {
        let offset = utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix());
        let instant = DateTime::<Utc>::from_timestamp_millis(at).unwrap_or_default();
        Self::from_date(instant.with_timezone(&offset).date_naive())
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.format("%Y-%m-%d").to_string())
    }

    /// Parse an ISO date. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .map(Self::from_date)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DayKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Tracked Website
// =============================================================================

/// A domain with a daily time budget.
///
/// Field names follow the storage encoding (`timeLimit`, `timeSpent`, ...);
/// the `...Minutes` spellings are accepted when decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct TrackedWebsite {
    /// Registered root domain, lowercase
    pub domain: String,
    /// Daily budget in minutes, always > 0
    #[serde(rename = "timeLimit", alias = "timeLimitMinutes")]
    pub time_limit_minutes: u32,
    /// Minutes spent on `day_key`
    #[serde(rename = "timeSpent", alias = "timeSpentMinutes", default)]
    pub time_spent_minutes: u32,
    #[serde(default)]
    pub is_locked: bool,
    /// Day the counters apply to; records written before day keys existed
    /// have none and adopt the current day on first access
    #[serde(default)]
    pub day_key: Option<DayKey>,
    /// Last moment this domain was the active tab
    #[serde(default)]
    #[cfg_attr(feature = "ts", ts(type = "number | null"))]
    pub last_observed_at: Option<Millis>,
    #[serde(default)]
    pub added_date: Option<DayKey>,
}

// =============================================================================
// Decision
// =============================================================================

/// Outcome of evaluating a hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Decision {
    /// Nothing registered applies
    Allow,
    /// Hostname is on the blocklist under `domain`
    BlockPermanent { domain: String },
    /// Hostname is tracked and today's budget is used up
    BlockTimeExceeded { website: TrackedWebsite },
    /// Hostname is tracked and inside the warning band
    Warn { website: TrackedWebsite },
}

impl Decision {
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            Decision::BlockPermanent { .. } | Decision::BlockTimeExceeded { .. }
        )
    }

    pub fn website(&self) -> Option<&TrackedWebsite> {
        match self {
            Decision::BlockTimeExceeded { website } | Decision::Warn { website } => Some(website),
            _ => None,
        }
    }

    /// Wire name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::BlockPermanent { .. } => "blockPermanent",
            Decision::BlockTimeExceeded { .. } => "blockTimeExceeded",
            Decision::Warn { .. } => "warn",
        }
    }
}
