//! Tunables for the background context

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{DayKey, Millis};

/// Background configuration. Every field has a default, so `{}` is a
/// valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(default, rename_all = "camelCase")]
pub struct TrackerConfig {
    /// Page a blocked tab is redirected to
    pub blocked_page_url: String,
    /// Minutes east of UTC used for day keys
    pub utc_offset_minutes: i32,
    /// Accrual flush and transition check period
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub recheck_interval_ms: u64,
    /// Store refresh and day rollover sweep period
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub sweep_interval_ms: u64,
    /// Upper bound on any single store call
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub store_timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            blocked_page_url: "blocked.html".to_string(),
            utc_offset_minutes: 0,
            recheck_interval_ms: 5_000,
            sweep_interval_ms: 60_000,
            store_timeout_ms: 2_000,
        }
    }
}

impl TrackerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Day key of `now` in the configured zone.
    pub fn day_key(&self, now: Millis) -> DayKey {
        DayKey::for_timestamp(now, self.utc_offset_minutes)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_is_default() {
        assert_eq!(TrackerConfig::from_json_str("{}").unwrap(), TrackerConfig::default());
    }

    #[test]
    fn test_partial_json() {
        let config =
            TrackerConfig::from_json_str(r#"{"utcOffsetMinutes": 120, "blockedPageUrl": "x.html"}"#)
                .unwrap();
        assert_eq!(config.utc_offset_minutes, 120);
        assert_eq!(config.blocked_page_url, "x.html");
        assert_eq!(config.recheck_interval(), Duration::from_secs(5));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_day_key_uses_offset() {
        let config = TrackerConfig {
            utc_offset_minutes: 60,
            ..TrackerConfig::default()
        };
        // 2026-10-16T23:30:00Z
        assert_eq!(config.day_key(1_792_193_400_000).as_str(), "2026-10-17");
    }
}
