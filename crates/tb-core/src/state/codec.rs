//! Storage encoding of the tracker state
//!
//! Decoding never fails as a whole. Values of the wrong shape fall back to
//! their defaults and malformed website records are skipped; each problem
//! is returned alongside the decoded state so the caller can log it.

use serde_json::Value;

use super::keys::*;
use super::{BlockStats, TrackerState};
use crate::error::Error;
use crate::store::StoreMap;
use crate::types::{DayKey, TrackedWebsite};

/// Persisted part of the state, as read from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredState {
    pub blocked_sites: Vec<String>,
    pub websites: Vec<TrackedWebsite>,
    pub enabled: bool,
    pub stats: BlockStats,
}

impl Default for StoredState {
    fn default() -> Self {
        Self {
            blocked_sites: Vec::new(),
            websites: Vec::new(),
            enabled: true,
            stats: BlockStats::default(),
        }
    }
}

// =============================================================================
// Decode
// =============================================================================

/// Decode whatever subset of the keys is present in `map`.
pub fn decode(map: &StoreMap) -> (StoredState, Vec<Error>) {
    let mut problems = Vec::new();
    let mut stored = StoredState::default();

    if let Some(value) = map.get(BLOCKED_SITES) {
        stored.blocked_sites = decode_blocked_sites(value, &mut problems);
    }
    if let Some(value) = map.get(WEBSITES) {
        stored.websites = decode_websites(value, &mut problems);
    }

    // Only an explicit `false` disables
    stored.enabled = map.get(EXTENSION_ENABLED).and_then(Value::as_bool) != Some(false);

    stored.stats = BlockStats {
        today_count: map
            .get(TODAY_BLOCKED_COUNT)
            .or_else(|| map.get(LEGACY_TODAY_BLOCKED))
            .and_then(Value::as_u64)
            .map(|count| u32::try_from(count).unwrap_or(u32::MAX))
            .unwrap_or(0),
        last_date: map
            .get(LAST_BLOCKED_DATE)
            .and_then(Value::as_str)
            .and_then(DayKey::parse),
    };

    (stored, problems)
}

fn decode_blocked_sites(value: &Value, problems: &mut Vec<Error>) -> Vec<String> {
    let Some(entries) = value.as_array() else {
        problems.push(Error::MalformedStoredRecord {
            index: 0,
            reason: format!("{BLOCKED_SITES} is not an array"),
        });
        return Vec::new();
    };

    let mut sites = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        match entry.as_str().map(|s| s.trim().to_ascii_lowercase()) {
            Some(site) if !site.is_empty() => {
                if !sites.contains(&site) {
                    sites.push(site);
                }
            }
            _ => problems.push(Error::MalformedStoredRecord {
                index,
                reason: format!("blocked site is not a domain string: {entry}"),
            }),
        }
    }
    sites
}

fn decode_websites(value: &Value, problems: &mut Vec<Error>) -> Vec<TrackedWebsite> {
    let Some(entries) = value.as_array() else {
        problems.push(Error::MalformedStoredRecord {
            index: 0,
            reason: format!("{WEBSITES} is not an array"),
        });
        return Vec::new();
    };

    let mut websites = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        match decode_website(entry) {
            Ok(website) => websites.push(website),
            Err(reason) => problems.push(Error::MalformedStoredRecord { index, reason }),
        }
    }
    websites
}

fn decode_website(entry: &Value) -> Result<TrackedWebsite, String> {
    let mut website: TrackedWebsite =
        serde_json::from_value(entry.clone()).map_err(|e| e.to_string())?;

    website.domain = website.domain.trim().to_ascii_lowercase();
    if website.domain.is_empty() {
        return Err("empty domain".to_string());
    }
    if website.time_limit_minutes == 0 {
        return Err(format!("zero time limit for '{}'", website.domain));
    }
    // A lock is only valid while the budget is used up
    if website.is_locked && !website.is_exhausted() {
        website.is_locked = false;
    }
    Ok(website)
}

// =============================================================================
// Encode
// =============================================================================

/// Encode the parts of `state` selected by `keys`.
pub fn encode(state: &TrackerState, keys: StateKeys) -> StoreMap {
    let mut map = StoreMap::new();

    if keys.contains(StateKeys::BLOCKED_SITES) {
        let sites: Vec<Value> = state
            .blocked
            .iter()
            .map(|site| Value::String(site.to_string()))
            .collect();
        map.insert(BLOCKED_SITES.to_string(), Value::Array(sites));
    }
    if keys.contains(StateKeys::WEBSITES) {
        let websites: Vec<&TrackedWebsite> = state.budgets.websites().collect();
        map.insert(
            WEBSITES.to_string(),
            serde_json::to_value(websites).unwrap_or(Value::Array(Vec::new())),
        );
    }
    if keys.contains(StateKeys::EXTENSION_ENABLED) {
        map.insert(EXTENSION_ENABLED.to_string(), Value::Bool(state.is_enabled()));
    }
    if keys.contains(StateKeys::BLOCK_STATS) {
        map.insert(
            TODAY_BLOCKED_COUNT.to_string(),
            Value::from(state.stats.today_count),
        );
        map.insert(
            LAST_BLOCKED_DATE.to_string(),
            state
                .stats
                .last_date
                .as_ref()
                .map(|day| Value::String(day.to_string()))
                .unwrap_or(Value::Null),
        );
    }

    map
}
