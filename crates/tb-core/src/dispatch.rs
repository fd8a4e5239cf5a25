//! Event and message handlers
//!
//! The background context receives two kinds of input: browser events
//! (navigation and tab focus) and messages from the popup and content
//! scripts. Each handler mutates the [`TrackerState`] it is given and
//! returns the [`Effect`]s the host has to carry out. Handlers never touch
//! storage or the browser themselves.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::engine::BlockDecisionEngine;
use crate::error::Error;
use crate::state::{StateKeys, TrackerState};
use crate::tracker::{Accrual, Threshold, ThresholdContext};
use crate::types::{DayKey, Decision, Millis, TabId, TrackedWebsite};

// =============================================================================
// Inputs
// =============================================================================

/// Navigation and tab events from the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BrowserEvent {
    /// A frame is about to navigate
    #[serde(rename_all = "camelCase")]
    NavigationAttempt {
        tab_id: TabId,
        hostname: String,
        is_top_level_frame: bool,
        #[cfg_attr(feature = "ts", ts(type = "number"))]
        timestamp: Millis,
    },
    #[serde(rename_all = "camelCase")]
    TabBecameActive {
        tab_id: TabId,
        #[cfg_attr(feature = "ts", ts(type = "number"))]
        timestamp: Millis,
    },
    #[serde(rename_all = "camelCase")]
    TabBecameInactive {
        tab_id: TabId,
        #[cfg_attr(feature = "ts", ts(type = "number"))]
        timestamp: Millis,
    },
    #[serde(rename_all = "camelCase")]
    TabClosed {
        tab_id: TabId,
        #[cfg_attr(feature = "ts", ts(type = "number"))]
        timestamp: Millis,
    },
    /// A tab finished loading a page on `hostname`
    #[serde(rename_all = "camelCase")]
    TabNavigatedComplete {
        tab_id: TabId,
        hostname: String,
        #[cfg_attr(feature = "ts", ts(type = "number"))]
        timestamp: Millis,
    },
}

impl BrowserEvent {
    pub fn tab_id(&self) -> TabId {
        match self {
            BrowserEvent::NavigationAttempt { tab_id, .. }
            | BrowserEvent::TabBecameActive { tab_id, .. }
            | BrowserEvent::TabBecameInactive { tab_id, .. }
            | BrowserEvent::TabClosed { tab_id, .. }
            | BrowserEvent::TabNavigatedComplete { tab_id, .. } => *tab_id,
        }
    }

    pub fn timestamp(&self) -> Millis {
        match self {
            BrowserEvent::NavigationAttempt { timestamp, .. }
            | BrowserEvent::TabBecameActive { timestamp, .. }
            | BrowserEvent::TabBecameInactive { timestamp, .. }
            | BrowserEvent::TabClosed { timestamp, .. }
            | BrowserEvent::TabNavigatedComplete { timestamp, .. } => *timestamp,
        }
    }
}

/// Requests from the popup and content scripts, keyed by `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Message {
    ToggleExtension { enabled: bool },
    AddBlockedSite { site: String },
    RemoveBlockedSite { site: String },
    #[serde(rename_all = "camelCase")]
    AddWebsite {
        domain: String,
        #[serde(alias = "timeLimit")]
        time_limit_minutes: u32,
    },
    RemoveWebsite { domain: String },
    ResetWebsite { domain: String },
    /// Content script asking about the page it runs in
    CheckBlocked {
        hostname: String,
        #[serde(default)]
        context: ThresholdContext,
    },
    GetOverview,
}

impl Message {
    /// Wire name of the action.
    pub fn action(&self) -> &'static str {
        match self {
            Message::ToggleExtension { .. } => "toggleExtension",
            Message::AddBlockedSite { .. } => "addBlockedSite",
            Message::RemoveBlockedSite { .. } => "removeBlockedSite",
            Message::AddWebsite { .. } => "addWebsite",
            Message::RemoveWebsite { .. } => "removeWebsite",
            Message::ResetWebsite { .. } => "resetWebsite",
            Message::CheckBlocked { .. } => "checkBlocked",
            Message::GetOverview => "getOverview",
        }
    }
}

// =============================================================================
// Outputs
// =============================================================================

/// Side effect requested by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send the tab to the blocked page
    RedirectTab { tab_id: TabId, url: String },
    /// Write these parts of the state to the store
    Persist(StateKeys),
    /// Tell the tab's content script about a decision
    Notify { tab_id: TabId, decision: Decision },
}

/// One tracked website as listed in the popup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct WebsiteStatus {
    pub website: TrackedWebsite,
    pub threshold: Threshold,
    pub minutes_remaining: u32,
}

/// Popup summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub enabled: bool,
    pub blocked_sites: Vec<String>,
    pub blocked_count: usize,
    pub today_blocked_count: u32,
    pub websites: Vec<WebsiteStatus>,
}

/// Answer to a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Reply {
    Ok,
    /// The request was refused; nothing changed
    Rejected { reason: String },
    Website { website: TrackedWebsite },
    Decision { decision: Decision },
    Overview { overview: Overview },
}

impl Reply {
    fn rejected(action: &str, err: Error) -> Self {
        if err.is_rejection() {
            debug!("Rejected {}: {}", action, err);
        } else {
            warn!("Failed {}: {}", action, err);
        }
        Reply::Rejected {
            reason: err.to_string(),
        }
    }
}

/// Collects effects; all persist requests collapse into one trailing
/// [`Effect::Persist`].
#[derive(Debug)]
struct Effects {
    effects: Vec<Effect>,
    persist: StateKeys,
}

impl Effects {
    fn new() -> Self {
        Self {
            effects: Vec::new(),
            persist: StateKeys::empty(),
        }
    }

    fn push(&mut self, effect: Effect) {
        match effect {
            Effect::Persist(keys) => self.persist |= keys,
            other => self.effects.push(other),
        }
    }

    fn persist(&mut self, keys: StateKeys) {
        self.persist |= keys;
    }

    fn finish(mut self) -> Vec<Effect> {
        if !self.persist.is_empty() {
            self.effects.push(Effect::Persist(self.persist));
        }
        self.effects
    }
}

// =============================================================================
// Event Handling
// =============================================================================

/// Apply a browser event. The event's timestamp is "now".
pub fn handle_event(
    state: &mut TrackerState,
    engine: &BlockDecisionEngine,
    config: &TrackerConfig,
    event: &BrowserEvent,
) -> Vec<Effect> {
    let now = event.timestamp();
    let today = engine.today(now);
    let mut effects = Effects::new();

    match event {
        BrowserEvent::NavigationAttempt {
            tab_id,
            hostname,
            is_top_level_frame,
            ..
        } => {
            // Subframes never move the tab
            if *is_top_level_frame {
                let decision = engine.decide(state, hostname, now);
                apply_decision(state, config, *tab_id, hostname, decision, &today, &mut effects);
            }
        }
        BrowserEvent::TabBecameActive { tab_id, .. } => {
            let accrual = state.budgets.tab_activated(*tab_id, now, &today);
            accrual_effects(state, accrual, &mut effects);
        }
        BrowserEvent::TabBecameInactive { tab_id, .. } => {
            let accrual = state.budgets.tab_deactivated(*tab_id, now, &today);
            accrual_effects(state, accrual, &mut effects);
        }
        BrowserEvent::TabClosed { tab_id, .. } => {
            let accrual = state.budgets.tab_closed(*tab_id, now, &today);
            accrual_effects(state, accrual, &mut effects);
        }
        BrowserEvent::TabNavigatedComplete {
            tab_id, hostname, ..
        } => {
            let accrual = state.budgets.tab_navigated(*tab_id, hostname, now, &today);
            accrual_effects(state, accrual, &mut effects);

            // A page that loaded anyway is still sent away
            let decision = engine.decide(state, hostname, now);
            if matches!(decision, Decision::BlockPermanent { .. }) {
                apply_decision(state, config, *tab_id, hostname, decision, &today, &mut effects);
            }
        }
    }

    effects.finish()
}

/// Periodic re-check: roll stale counters over and flush the open
/// interval, notifying the focused tab of any threshold crossing.
pub fn handle_tick(
    state: &mut TrackerState,
    engine: &BlockDecisionEngine,
    now: Millis,
) -> Vec<Effect> {
    let today = engine.today(now);
    let mut effects = Effects::new();

    if state.budgets.roll_over_all(&today) {
        debug!("Rolled tracked websites over to {}", today);
        effects.persist(StateKeys::WEBSITES);
    }
    let accrual = state.budgets.flush(now, &today);
    accrual_effects(state, accrual, &mut effects);

    effects.finish()
}

fn apply_decision(
    state: &mut TrackerState,
    config: &TrackerConfig,
    tab_id: TabId,
    hostname: &str,
    decision: Decision,
    today: &DayKey,
    effects: &mut Effects,
) {
    effects.persist(settle(state, hostname, &decision, today));

    match decision {
        Decision::Allow => {}
        Decision::BlockPermanent { ref domain } => {
            let count = state.stats.record(today);
            debug!("Redirecting tab {} away from '{}' ({} today)", tab_id, domain, count);
            effects.push(Effect::RedirectTab {
                tab_id,
                url: config.blocked_page_url.clone(),
            });
            effects.persist(StateKeys::BLOCK_STATS);
        }
        Decision::BlockTimeExceeded { .. } | Decision::Warn { .. } => {
            effects.push(Effect::Notify { tab_id, decision });
        }
    }
}

/// Write what `decide` only assumed: day rollover of the tracked website
/// `hostname` belongs to, and its lock once the budget is used up.
fn settle(state: &mut TrackerState, hostname: &str, decision: &Decision, today: &DayKey) -> StateKeys {
    let hostname = hostname.trim().to_ascii_lowercase();
    let Some(domain) = state.budgets.lookup(&hostname).map(|w| w.domain.clone()) else {
        return StateKeys::empty();
    };
    let mut changed = state.budgets.roll_over(&domain, today);
    if matches!(decision, Decision::BlockTimeExceeded { .. }) {
        changed |= state.budgets.lock(&domain);
    }
    if changed {
        StateKeys::WEBSITES
    } else {
        StateKeys::empty()
    }
}

/// Persist recorded time and notify on threshold transitions.
fn accrual_effects(state: &TrackerState, accrual: Option<Accrual>, effects: &mut Effects) {
    let Some(accrual) = accrual else {
        return;
    };
    effects.persist(StateKeys::WEBSITES);

    // Closed tabs have no content script to notify
    if state.budgets.tab_host(accrual.tab_id).is_none() {
        return;
    }
    let Some(website) = state.budgets.website(&accrual.domain) else {
        return;
    };
    let decision = if accrual.recorded.newly_locked {
        Decision::BlockTimeExceeded {
            website: website.clone(),
        }
    } else if accrual.recorded.entered_warning {
        Decision::Warn {
            website: website.clone(),
        }
    } else {
        return;
    };
    effects.push(Effect::Notify {
        tab_id: accrual.tab_id,
        decision,
    });
}

// =============================================================================
// Message Handling
// =============================================================================

/// Apply a popup or content-script message.
pub fn handle_message(
    state: &mut TrackerState,
    engine: &BlockDecisionEngine,
    message: &Message,
    now: Millis,
) -> (Reply, Vec<Effect>) {
    let today = engine.today(now);
    let mut effects = Effects::new();
    let action = message.action();

    let reply = match message {
        Message::ToggleExtension { enabled } => {
            let accrual = state.set_enabled(*enabled, now, &today);
            accrual_effects(state, accrual, &mut effects);
            effects.persist(StateKeys::EXTENSION_ENABLED);
            Reply::Ok
        }
        Message::AddBlockedSite { site } => match state.blocked.add(site) {
            Ok(_) => {
                effects.persist(StateKeys::BLOCKED_SITES);
                Reply::Ok
            }
            Err(e) => Reply::rejected(action, e),
        },
        Message::RemoveBlockedSite { site } => match state.blocked.remove(site) {
            Ok(_) => {
                effects.persist(StateKeys::BLOCKED_SITES);
                Reply::Ok
            }
            Err(e) => Reply::rejected(action, e),
        },
        Message::AddWebsite {
            domain,
            time_limit_minutes,
        } => match state.budgets.add(domain, *time_limit_minutes, now, &today) {
            Ok((website, accrual)) => {
                accrual_effects(state, accrual, &mut effects);
                effects.persist(StateKeys::WEBSITES);
                Reply::Website { website }
            }
            Err(e) => Reply::rejected(action, e),
        },
        Message::RemoveWebsite { domain } => match state.budgets.remove(domain, now, &today) {
            Ok((_, accrual)) => {
                accrual_effects(state, accrual, &mut effects);
                effects.persist(StateKeys::WEBSITES);
                Reply::Ok
            }
            Err(e) => Reply::rejected(action, e),
        },
        Message::ResetWebsite { domain } => match state.budgets.reset_daily(domain, now) {
            Ok(website) => {
                let website = website.clone();
                effects.persist(StateKeys::WEBSITES);
                Reply::Website { website }
            }
            Err(e) => Reply::rejected(action, e),
        },
        Message::CheckBlocked { hostname, context } => {
            let decision = engine.decide_with(state, hostname, now, *context);
            effects.persist(settle(state, hostname, &decision, &today));
            Reply::Decision { decision }
        }
        Message::GetOverview => Reply::Overview {
            overview: overview(state, &today),
        },
    };

    (reply, effects.finish())
}

/// Popup summary as of `today`.
pub fn overview(state: &TrackerState, today: &DayKey) -> Overview {
    let websites = state
        .budgets
        .websites()
        .map(|website| {
            let current = website.as_of(today);
            WebsiteStatus {
                threshold: current.threshold(ThresholdContext::List),
                minutes_remaining: current.minutes_remaining(),
                website: current.into_owned(),
            }
        })
        .collect();

    Overview {
        enabled: state.is_enabled(),
        blocked_sites: state.blocked.iter().map(str::to_string).collect(),
        blocked_count: state.blocked.len(),
        today_blocked_count: state.stats.count_on(today),
        websites,
    }
}
