//! The owned extension state
//!
//! [`TrackerState`] is everything the background context knows: the
//! permanent blocklist, the time budgets, the on/off switch and the daily
//! block counter. It is held by one owner and mutated only through the
//! handlers in [`crate::dispatch`].

mod codec;
mod keys;

pub use codec::{decode, encode, StoredState};
pub use keys::*;

use std::collections::BTreeSet;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::domain::{best_match, normalize_domain_input};
use crate::error::{Error, Result};
use crate::tracker::{Accrual, TimeBudgetTracker};
use crate::types::{DayKey, Millis};

// =============================================================================
// Blocklist
// =============================================================================

/// Permanently blocked domains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blocklist {
    domains: BTreeSet<String>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize and insert `input`. Returns the stored domain.
    pub fn add(&mut self, input: &str) -> Result<String> {
        let domain = normalize_domain_input(input)?;
        if !self.domains.insert(domain.clone()) {
            return Err(Error::AlreadyRegistered(domain));
        }
        debug!("Blocking '{}'", domain);
        Ok(domain)
    }

    /// Remove a domain. Accepts the same spellings as [`Blocklist::add`].
    pub fn remove(&mut self, input: &str) -> Result<String> {
        let domain = normalize_domain_input(input)
            .unwrap_or_else(|_| input.trim().to_ascii_lowercase());
        if self.domains.remove(&domain) {
            Ok(domain)
        } else {
            Err(Error::NotRegistered(domain))
        }
    }

    /// Longest blocked domain `hostname` belongs to, as a suffix of
    /// `hostname`.
    pub fn lookup<'a>(&self, hostname: &'a str) -> Option<&'a str> {
        best_match(hostname, |d| self.domains.contains(d))
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl FromIterator<String> for Blocklist {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            domains: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Block Statistics
// =============================================================================

/// Count of permanent blocks on one day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    pub today_count: u32,
    pub last_date: Option<DayKey>,
}

impl BlockStats {
    /// Count one block on `today`. Returns the new count.
    pub fn record(&mut self, today: &DayKey) -> u32 {
        if self.last_date.as_ref() == Some(today) {
            self.today_count = self.today_count.saturating_add(1);
        } else {
            self.today_count = 1;
            self.last_date = Some(today.clone());
        }
        self.today_count
    }

    /// Blocks counted on `today`; zero if the count is from another day.
    pub fn count_on(&self, today: &DayKey) -> u32 {
        if self.last_date.as_ref() == Some(today) {
            self.today_count
        } else {
            0
        }
    }
}

// =============================================================================
// Tracker State
// =============================================================================

/// Everything the background context owns.
#[derive(Debug, Clone)]
pub struct TrackerState {
    pub blocked: Blocklist,
    pub budgets: TimeBudgetTracker,
    enabled: bool,
    pub stats: BlockStats,
}

impl Default for TrackerState {
    fn default() -> Self {
        Self {
            blocked: Blocklist::new(),
            budgets: TimeBudgetTracker::new(),
            enabled: true,
            stats: BlockStats::default(),
        }
    }
}

impl TrackerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from what was read from storage.
    pub fn from_stored(stored: StoredState, now: Millis, today: &DayKey) -> Self {
        let mut state = Self::new();
        state.apply_stored(stored, now, today);
        state
    }

    /// Replace the persisted parts with `stored`, keeping tab bookkeeping.
    pub fn apply_stored(&mut self, stored: StoredState, now: Millis, today: &DayKey) -> Option<Accrual> {
        self.blocked = stored.blocked_sites.into_iter().collect();
        self.budgets.replace_websites(stored.websites);
        self.stats = stored.stats;
        self.set_enabled(stored.enabled, now, today)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Switch the extension on or off. Turning it off closes the open
    /// interval; turning it on resumes accrual for the focused tab.
    pub fn set_enabled(&mut self, enabled: bool, now: Millis, today: &DayKey) -> Option<Accrual> {
        self.enabled = enabled;
        self.budgets.set_paused(!enabled, now, today)
    }
}
