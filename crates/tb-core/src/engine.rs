//! Block decision engine
//!
//! Answers "for hostname H at time T, is access blocked, warned or
//! allowed?" against a [`TrackerState`]. The decision is pure: a website
//! whose counters belong to an earlier day is evaluated as if it had
//! already rolled over, and a website whose budget is used up is reported
//! locked even if the lock flag has not been written yet. Applying those
//! changes to the state is the dispatcher's job.
//!
//! Evaluation order:
//!
//! 1. Extension disabled: [`Decision::Allow`]
//! 2. Blocklist (longest match): [`Decision::BlockPermanent`]
//! 3. Time budgets (longest match): [`Decision::BlockTimeExceeded`] or
//!    [`Decision::Warn`]
//! 4. Otherwise [`Decision::Allow`]

use log::debug;

use crate::config::TrackerConfig;
use crate::state::TrackerState;
use crate::tracker::{Threshold, ThresholdContext};
use crate::types::{DayKey, Decision, Millis};

/// Stateless evaluator; holds only the configuration it needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockDecisionEngine {
    utc_offset_minutes: i32,
}

impl BlockDecisionEngine {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            utc_offset_minutes: config.utc_offset_minutes,
        }
    }

    /// Day key of `now` as this engine sees it.
    pub fn today(&self, now: Millis) -> DayKey {
        DayKey::for_timestamp(now, self.utc_offset_minutes)
    }

    /// Decide for a top-level page, using the overlay warning band.
    pub fn decide(&self, state: &TrackerState, hostname: &str, now: Millis) -> Decision {
        self.decide_with(state, hostname, now, ThresholdContext::Overlay)
    }

    /// Decide using the warning band of `context`.
    pub fn decide_with(
        &self,
        state: &TrackerState,
        hostname: &str,
        now: Millis,
        context: ThresholdContext,
    ) -> Decision {
        if !state.is_enabled() {
            return Decision::Allow;
        }

        let hostname = hostname.trim().to_ascii_lowercase();
        if hostname.is_empty() {
            return Decision::Allow;
        }

        if let Some(domain) = state.blocked.lookup(&hostname) {
            debug!("{} is blocked under '{}'", hostname, domain);
            return Decision::BlockPermanent {
                domain: domain.to_string(),
            };
        }

        let Some(website) = state.budgets.lookup(&hostname) else {
            return Decision::Allow;
        };
        let today = self.today(now);
        let current = website.as_of(&today);

        match current.threshold(context) {
            Threshold::Locked => {
                let mut website = current.into_owned();
                website.is_locked = true;
                Decision::BlockTimeExceeded { website }
            }
            Threshold::Warning => Decision::Warn {
                website: current.into_owned(),
            },
            Threshold::Ok => Decision::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrackedWebsite;

    const T0: Millis = 1_792_152_000_000; // 2026-10-16T12:00:00Z

    fn engine() -> BlockDecisionEngine {
        BlockDecisionEngine::default()
    }

    fn website(domain: &str, limit: u32, spent: u32, day: &str) -> TrackedWebsite {
        let mut website = TrackedWebsite::new(domain, limit, &DayKey::parse(day).unwrap());
        website.time_spent_minutes = spent;
        website.is_locked = spent >= limit;
        website
    }

    fn state_with(websites: Vec<TrackedWebsite>, blocked: &[&str]) -> TrackerState {
        let mut state = TrackerState::new();
        state.budgets.replace_websites(websites);
        for site in blocked {
            state.blocked.add(site).unwrap();
        }
        state
    }

    #[test]
    fn test_unregistered_is_allowed() {
        let state = state_with(vec![], &[]);
        assert_eq!(engine().decide(&state, "example.com", T0), Decision::Allow);
    }

    #[test]
    fn test_warning_band() {
        let state = state_with(vec![website("example.com", 30, 28, "2026-10-16")], &[]);
        let decision = engine().decide(&state, "www.example.com", T0);
        assert_eq!(decision.kind(), "warn");
        assert_eq!(decision.website().unwrap().time_spent_minutes, 28);

        let state = state_with(vec![website("example.com", 30, 26, "2026-10-16")], &[]);
        assert_eq!(engine().decide(&state, "example.com", T0), Decision::Allow);
        assert_eq!(
            engine()
                .decide_with(&state, "example.com", T0, ThresholdContext::List)
                .kind(),
            "warn"
        );
    }

    #[test]
    fn test_exhausted_budget_reports_lock() {
        let mut unlocked = website("example.com", 30, 30, "2026-10-16");
        unlocked.is_locked = false;
        let state = state_with(vec![unlocked], &[]);

        match engine().decide(&state, "example.com", T0) {
            Decision::BlockTimeExceeded { website } => assert!(website.is_locked),
            other => panic!("unexpected {other:?}"),
        }
        // decide does not mutate
        assert!(!state.budgets.website("example.com").unwrap().is_locked);
    }

    #[test]
    fn test_permanent_block_takes_precedence() {
        let state = state_with(
            vec![website("example.com", 30, 30, "2026-10-16")],
            &["example.com"],
        );
        assert_eq!(
            engine().decide(&state, "Sub.Example.com", T0),
            Decision::BlockPermanent {
                domain: "example.com".into()
            }
        );
    }

    #[test]
    fn test_yesterdays_lock_is_allowed_today() {
        let state = state_with(vec![website("example.com", 30, 30, "2026-10-15")], &[]);
        assert_eq!(engine().decide(&state, "example.com", T0), Decision::Allow);
    }

    #[test]
    fn test_day_follows_configured_offset() {
        // 23:30 UTC on the 16th is already the 17th at UTC+1
        let late = 1_792_193_400_000;
        let state = state_with(vec![website("example.com", 30, 30, "2026-10-16")], &[]);
        let utc = BlockDecisionEngine::default();
        let plus_one = BlockDecisionEngine::new(&TrackerConfig {
            utc_offset_minutes: 60,
            ..TrackerConfig::default()
        });
        assert!(utc.decide(&state, "example.com", late).is_blocked());
        assert_eq!(plus_one.decide(&state, "example.com", late), Decision::Allow);
    }

    #[test]
    fn test_disabled_allows_everything() {
        let mut state = state_with(
            vec![website("example.com", 30, 30, "2026-10-16")],
            &["blocked.org"],
        );
        let today = DayKey::parse("2026-10-16").unwrap();
        state.set_enabled(false, T0, &today);
        assert_eq!(engine().decide(&state, "blocked.org", T0), Decision::Allow);
        assert_eq!(engine().decide(&state, "example.com", T0), Decision::Allow);
    }

    #[test]
    fn test_longest_tracked_domain_wins() {
        let state = state_with(
            vec![
                website("example.com", 30, 0, "2026-10-16"),
                website("news.example.com", 10, 10, "2026-10-16"),
            ],
            &[],
        );
        assert!(engine().decide(&state, "news.example.com", T0).is_blocked());
        assert_eq!(engine().decide(&state, "www.example.com", T0), Decision::Allow);
    }

    #[test]
    fn test_empty_hostname() {
        let state = state_with(vec![], &["example.com"]);
        assert_eq!(engine().decide(&state, "  ", T0), Decision::Allow);
    }
}
