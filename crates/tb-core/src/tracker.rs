//! Time budgets for tracked websites
//!
//! Time accrues in whole minutes from intervals during which a tracked
//! domain was the active tab. There is a single active-tab model: at most
//! one interval is open at any moment, and it is closed and recorded when
//! focus moves, the focused tab navigates elsewhere or closes, or tracking
//! is paused.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::domain::{best_match, normalize_domain_input};
use crate::error::{Error, Result};
use crate::types::{DayKey, Millis, TabId, TrackedWebsite, MS_PER_MINUTE};

/// Warning band start for in-page overlays.
pub const WARNING_THRESHOLD_OVERLAY: f64 = 0.9;
/// Warning band start for the popup's website list.
pub const WARNING_THRESHOLD_LIST: f64 = 0.8;

// =============================================================================
// Threshold
// =============================================================================

/// Budget classification of a tracked website.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub enum Threshold {
    Ok,
    Warning,
    Locked,
}

/// Where a threshold is displayed. The two contexts use different warning
/// bands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub enum ThresholdContext {
    /// Content-script overlay
    #[default]
    Overlay,
    /// Popup list
    List,
}

impl ThresholdContext {
    pub fn fraction(self) -> f64 {
        match self {
            ThresholdContext::Overlay => WARNING_THRESHOLD_OVERLAY,
            ThresholdContext::List => WARNING_THRESHOLD_LIST,
        }
    }
}

/// Whole minutes between two instants. Sub-minute remainders are dropped.
#[inline]
pub fn elapsed_minutes(start: Millis, end: Millis) -> u32 {
    if end <= start {
        return 0;
    }
    u32::try_from(end.saturating_sub(start) / MS_PER_MINUTE).unwrap_or(u32::MAX)
}

// =============================================================================
// Per-website Budget
// =============================================================================

/// Result of recording an interval against one website.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recorded {
    pub minutes: u32,
    /// The website became locked by this recording
    pub newly_locked: bool,
    /// The website crossed into the overlay warning band
    pub entered_warning: bool,
}

impl TrackedWebsite {
    pub fn new(domain: impl Into<String>, time_limit_minutes: u32, today: &DayKey) -> Self {
        Self {
            domain: domain.into(),
            time_limit_minutes,
            time_spent_minutes: 0,
            is_locked: false,
            day_key: Some(today.clone()),
            last_observed_at: None,
            added_date: Some(today.clone()),
        }
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.time_spent_minutes >= self.time_limit_minutes
    }

    pub fn minutes_remaining(&self) -> u32 {
        self.time_limit_minutes.saturating_sub(self.time_spent_minutes)
    }

    /// Counters belong to a day other than `today`.
    pub fn is_stale(&self, today: &DayKey) -> bool {
        matches!(&self.day_key, Some(day) if day != today)
    }

    /// Bring the counters to `today`. Returns true if anything changed.
    ///
    /// A record without a day key adopts `today` and keeps its counters.
    pub fn roll_over(&mut self, today: &DayKey) -> bool {
        match &self.day_key {
            Some(day) if day == today => false,
            Some(_) => {
                self.time_spent_minutes = 0;
                self.is_locked = false;
                self.day_key = Some(today.clone());
                true
            }
            None => {
                self.day_key = Some(today.clone());
                true
            }
        }
    }

    /// View of this website with the counters it would have on `today`.
    pub fn as_of(&self, today: &DayKey) -> Cow<'_, TrackedWebsite> {
        if self.is_stale(today) {
            let mut rolled = self.clone();
            rolled.roll_over(today);
            Cow::Owned(rolled)
        } else {
            Cow::Borrowed(self)
        }
    }

    /// Classify the current counters without mutating.
    pub fn threshold(&self, context: ThresholdContext) -> Threshold {
        if self.is_locked || self.is_exhausted() {
            Threshold::Locked
        } else if f64::from(self.time_spent_minutes)
            >= context.fraction() * f64::from(self.time_limit_minutes)
        {
            Threshold::Warning
        } else {
            Threshold::Ok
        }
    }

    /// Add the whole minutes of `[start, end)` to today's counter.
    pub fn record_interval(&mut self, start: Millis, end: Millis, today: &DayKey) -> Recorded {
        let minutes = elapsed_minutes(start, end);
        if minutes == 0 {
            return Recorded::default();
        }

        self.roll_over(today);
        let was_locked = self.is_locked;
        let before = self.threshold(ThresholdContext::Overlay);

        self.time_spent_minutes = self.time_spent_minutes.saturating_add(minutes);
        self.last_observed_at = Some(end);
        if self.is_exhausted() {
            self.is_locked = true;
        }

        let after = self.threshold(ThresholdContext::Overlay);
        Recorded {
            minutes,
            newly_locked: !was_locked && self.is_locked,
            entered_warning: before == Threshold::Ok && after == Threshold::Warning,
        }
    }

    /// Explicit user reset. Idempotent.
    pub fn reset_daily(&mut self) {
        self.time_spent_minutes = 0;
        self.is_locked = false;
        self.last_observed_at = None;
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// The interval currently accruing time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenInterval {
    pub tab_id: TabId,
    /// Registered domain the tab's host resolved to when the interval opened
    pub domain: String,
    pub started_at: Millis,
}

/// Time recorded when an interval was closed or flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accrual {
    pub tab_id: TabId,
    pub domain: String,
    pub recorded: Recorded,
}

/// All tracked websites plus the active-tab bookkeeping that feeds them.
#[derive(Debug, Clone, Default)]
pub struct TimeBudgetTracker {
    websites: BTreeMap<String, TrackedWebsite>,
    tab_hosts: HashMap<TabId, String>,
    focused: Option<TabId>,
    open: Option<OpenInterval>,
    paused: bool,
}

impl TimeBudgetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Tracked websites, ordered by domain.
    pub fn websites(&self) -> impl Iterator<Item = &TrackedWebsite> {
        self.websites.values()
    }

    pub fn len(&self) -> usize {
        self.websites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.websites.is_empty()
    }

    pub fn website(&self, domain: &str) -> Option<&TrackedWebsite> {
        self.websites.get(domain)
    }

    /// Replace every tracked website, e.g. after loading from storage.
    ///
    /// Later duplicates of a domain are dropped. The open interval is
    /// dropped if its domain is gone.
    pub fn replace_websites(&mut self, websites: impl IntoIterator<Item = TrackedWebsite>) {
        self.websites.clear();
        for website in websites {
            if self.websites.contains_key(&website.domain) {
                warn!("Dropping duplicate tracked website '{}'", website.domain);
                continue;
            }
            self.websites.insert(website.domain.clone(), website);
        }
        if let Some(open) = &self.open {
            if !self.websites.contains_key(&open.domain) {
                self.open = None;
            }
        }
    }

    /// Register a domain with a daily limit.
    ///
    /// The focused tab is re-resolved, since the new domain may be a longer
    /// match for its host. Time accrued before `now` is returned.
    pub fn add(
        &mut self,
        input: &str,
        time_limit_minutes: u32,
        now: Millis,
        today: &DayKey,
    ) -> Result<(TrackedWebsite, Option<Accrual>)> {
        let domain = normalize_domain_input(input)?;
        if time_limit_minutes == 0 {
            return Err(Error::InvalidTimeLimit(time_limit_minutes));
        }
        if self.websites.contains_key(&domain) {
            return Err(Error::AlreadyRegistered(domain));
        }

        let website = TrackedWebsite::new(domain.clone(), time_limit_minutes, today);
        self.websites.insert(domain.clone(), website.clone());
        debug!("Tracking '{}' with {} minute limit", domain, time_limit_minutes);

        let accrual = self.refocus(now, today);
        Ok((website, accrual))
    }

    /// Unregister a domain. Time accrued to it in the open interval is
    /// discarded; a focused tab that still matches a shorter tracked
    /// domain starts accruing to that one at `now`.
    pub fn remove(
        &mut self,
        input: &str,
        now: Millis,
        today: &DayKey,
    ) -> Result<(TrackedWebsite, Option<Accrual>)> {
        let domain = registered_key(input);
        let removed = self
            .websites
            .remove(&domain)
            .ok_or_else(|| Error::NotRegistered(domain.clone()))?;
        let accrual = self.refocus(now, today);
        Ok((removed, accrual))
    }

    // -------------------------------------------------------------------------
    // Budget operations
    // -------------------------------------------------------------------------

    /// Longest tracked domain `hostname` belongs to.
    pub fn lookup(&self, hostname: &str) -> Option<&TrackedWebsite> {
        best_match(hostname, |d| self.websites.contains_key(d))
            .and_then(|domain| self.websites.get(domain))
    }

    /// Record `[start, end)` against `domain`. `None` if it is not tracked.
    pub fn record_interval(
        &mut self,
        domain: &str,
        start: Millis,
        end: Millis,
        today: &DayKey,
    ) -> Option<Recorded> {
        let website = self.websites.get_mut(domain)?;
        Some(website.record_interval(start, end, today))
    }

    /// Classify `domain` as of `today` without mutating.
    pub fn check_threshold(
        &self,
        domain: &str,
        context: ThresholdContext,
        today: &DayKey,
    ) -> Option<Threshold> {
        self.websites
            .get(domain)
            .map(|website| website.as_of(today).threshold(context))
    }

    /// Zero today's counters for `domain`. If it is accruing right now the
    /// interval restarts at `now`, so time before the reset is not counted.
    pub fn reset_daily(&mut self, input: &str, now: Millis) -> Result<&TrackedWebsite> {
        let domain = registered_key(input);
        if let Some(open) = self.open.as_mut().filter(|open| open.domain == domain) {
            open.started_at = now;
        }
        let website = self
            .websites
            .get_mut(&domain)
            .ok_or(Error::NotRegistered(domain))?;
        website.reset_daily();
        Ok(&*website)
    }

    /// Set the lock flag on an exhausted website. Returns true if it flipped.
    pub fn lock(&mut self, domain: &str) -> bool {
        match self.websites.get_mut(domain) {
            Some(website) if !website.is_locked && website.is_exhausted() => {
                website.is_locked = true;
                true
            }
            _ => false,
        }
    }

    /// Apply day rollover to one website. Returns true if it changed.
    pub fn roll_over(&mut self, domain: &str, today: &DayKey) -> bool {
        self.websites
            .get_mut(domain)
            .is_some_and(|website| website.roll_over(today))
    }

    /// Apply day rollover to every website. Returns true if any changed.
    pub fn roll_over_all(&mut self, today: &DayKey) -> bool {
        let mut changed = false;
        for website in self.websites.values_mut() {
            changed |= website.roll_over(today);
        }
        changed
    }

    // -------------------------------------------------------------------------
    // Active tab
    // -------------------------------------------------------------------------

    pub fn focused_tab(&self) -> Option<TabId> {
        self.focused
    }

    pub fn open_interval(&self) -> Option<&OpenInterval> {
        self.open.as_ref()
    }

    /// Last known host of a tab.
    pub fn tab_host(&self, tab: TabId) -> Option<&str> {
        self.tab_hosts.get(&tab).map(String::as_str)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// `tab` gained focus. Closes whatever interval was open.
    pub fn tab_activated(&mut self, tab: TabId, now: Millis, today: &DayKey) -> Option<Accrual> {
        let closed = self.close_open(now, today);
        self.focused = Some(tab);
        self.open_for(tab, now);
        closed
    }

    /// `tab` lost focus (window blurred, browser minimized).
    pub fn tab_deactivated(&mut self, tab: TabId, now: Millis, today: &DayKey) -> Option<Accrual> {
        if self.focused != Some(tab) {
            return None;
        }
        self.focused = None;
        self.close_open(now, today)
    }

    pub fn tab_closed(&mut self, tab: TabId, now: Millis, today: &DayKey) -> Option<Accrual> {
        self.tab_hosts.remove(&tab);
        self.tab_deactivated(tab, now, today)
    }

    /// `tab` finished loading `hostname`.
    ///
    /// Staying on the same tracked domain keeps the interval running.
    pub fn tab_navigated(
        &mut self,
        tab: TabId,
        hostname: &str,
        now: Millis,
        today: &DayKey,
    ) -> Option<Accrual> {
        let hostname = hostname.to_ascii_lowercase();
        let next_domain = self.lookup(&hostname).map(|w| w.domain.clone());
        self.tab_hosts.insert(tab, hostname);

        if self.focused != Some(tab) {
            return None;
        }
        if let Some(open) = &self.open {
            if open.tab_id == tab && Some(&open.domain) == next_domain.as_ref() {
                return None;
            }
        }

        let closed = self.close_open(now, today);
        self.open_for(tab, now);
        closed
    }

    /// Record the whole minutes of the open interval and keep it open,
    /// carrying the sub-minute remainder.
    pub fn flush(&mut self, now: Millis, today: &DayKey) -> Option<Accrual> {
        let open = self.open.as_mut()?;
        let minutes = elapsed_minutes(open.started_at, now);
        if minutes == 0 {
            return None;
        }

        let start = open.started_at;
        let end = start + Millis::from(minutes) * MS_PER_MINUTE;
        open.started_at = end;
        let (tab_id, domain) = (open.tab_id, open.domain.clone());

        let recorded = self.record_interval(&domain, start, end, today)?;
        Some(Accrual {
            tab_id,
            domain,
            recorded,
        })
    }

    /// Stop or resume accrual. Pausing closes the open interval; resuming
    /// opens one for the focused tab at `now`.
    pub fn set_paused(&mut self, paused: bool, now: Millis, today: &DayKey) -> Option<Accrual> {
        if self.paused == paused {
            return None;
        }
        self.paused = paused;
        if paused {
            self.close_open(now, today)
        } else {
            if let Some(tab) = self.focused {
                self.open_for(tab, now);
            }
            None
        }
    }

    /// Point the open interval at the domain the focused tab matches now.
    /// Closes the old interval if the domain changed.
    fn refocus(&mut self, now: Millis, today: &DayKey) -> Option<Accrual> {
        let tab = self.focused?;
        let next = self
            .tab_hosts
            .get(&tab)
            .and_then(|host| self.lookup(host))
            .map(|website| website.domain.clone());
        if self.open.as_ref().map(|open| &open.domain) == next.as_ref() {
            return None;
        }
        let closed = self.close_open(now, today);
        self.open_for(tab, now);
        closed
    }

    fn open_for(&mut self, tab: TabId, now: Millis) {
        if self.paused {
            return;
        }
        self.open = self
            .tab_hosts
            .get(&tab)
            .and_then(|host| self.lookup(host))
            .map(|website| OpenInterval {
                tab_id: tab,
                domain: website.domain.clone(),
                started_at: now,
            });
    }

    fn close_open(&mut self, now: Millis, today: &DayKey) -> Option<Accrual> {
        let open = self.open.take()?;
        let recorded = self.record_interval(&open.domain, open.started_at, now, today)?;
        if recorded.minutes == 0 {
            return None;
        }
        Some(Accrual {
            tab_id: open.tab_id,
            domain: open.domain,
            recorded,
        })
    }
}

/// Storage key for user-supplied domain text.
fn registered_key(input: &str) -> String {
    normalize_domain_input(input).unwrap_or_else(|_| input.trim().to_ascii_lowercase())
}
