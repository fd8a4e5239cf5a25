//! Storage key layout
//!
//! Names of the keys the extension keeps in its key-value storage, and the
//! flag set used to describe which of them changed.

// =============================================================================
// Keys
// =============================================================================

/// `array<string>`: permanently blocked domains
pub const BLOCKED_SITES: &str = "blockedSites";
/// `array<TrackedWebsite>`
pub const WEBSITES: &str = "websites";
/// `boolean`, absent means enabled
pub const EXTENSION_ENABLED: &str = "extensionEnabled";
/// `integer`: permanent blocks on `lastBlockedDate`
pub const TODAY_BLOCKED_COUNT: &str = "todayBlockedCount";
/// `string`: ISO day of the last permanent block
pub const LAST_BLOCKED_DATE: &str = "lastBlockedDate";

/// Older name of `todayBlockedCount`, still read.
pub const LEGACY_TODAY_BLOCKED: &str = "todayBlocked";

/// Every key read when loading the full state.
pub const ALL_KEYS: [&str; 6] = [
    BLOCKED_SITES,
    WEBSITES,
    EXTENSION_ENABLED,
    TODAY_BLOCKED_COUNT,
    LAST_BLOCKED_DATE,
    LEGACY_TODAY_BLOCKED,
];

// =============================================================================
// Key Flags
// =============================================================================

bitflags::bitflags! {
    /// Parts of the state that need writing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateKeys: u8 {
        const BLOCKED_SITES = 1 << 0;
        const WEBSITES = 1 << 1;
        const EXTENSION_ENABLED = 1 << 2;
        /// `todayBlockedCount` and `lastBlockedDate`
        const BLOCK_STATS = 1 << 3;

        const ALL = Self::BLOCKED_SITES.bits()
            | Self::WEBSITES.bits()
            | Self::EXTENSION_ENABLED.bits()
            | Self::BLOCK_STATS.bits();
    }
}

impl StateKeys {
    /// Storage key names covered by these flags.
    pub fn storage_keys(self) -> Vec<&'static str> {
        let mut keys = Vec::with_capacity(5);
        if self.contains(Self::BLOCKED_SITES) {
            keys.push(BLOCKED_SITES);
        }
        if self.contains(Self::WEBSITES) {
            keys.push(WEBSITES);
        }
        if self.contains(Self::EXTENSION_ENABLED) {
            keys.push(EXTENSION_ENABLED);
        }
        if self.contains(Self::BLOCK_STATS) {
            keys.push(TODAY_BLOCKED_COUNT);
            keys.push(LAST_BLOCKED_DATE);
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_keys() {
        assert_eq!(StateKeys::empty().storage_keys(), Vec::<&str>::new());
        assert_eq!(
            (StateKeys::WEBSITES | StateKeys::BLOCK_STATS).storage_keys(),
            vec![WEBSITES, TODAY_BLOCKED_COUNT, LAST_BLOCKED_DATE]
        );
        assert_eq!(StateKeys::ALL.storage_keys().len(), 5);
    }
}
