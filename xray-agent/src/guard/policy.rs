//! Guard policy decisions, kept pure so the whole transition table is
//! testable without a store or a proxy.

use crate::config::GuardSettings;

/// THANKS anti-spam lock TTL.
pub const THANKS_COOLDOWN_SEC: u64 = 1800;

/// TTL on `warned_at`: long enough to cover the grace period plus the
/// activity window with margin, and never shorter than the WARN cooldown.
#[must_use]
pub fn warned_at_ttl(guard: &GuardSettings) -> u64 {
    guard
        .warn_cooldown_sec
        .max(guard.ban_grace_sec + guard.active_seen_sec + 30)
}

/// Age past which a `warned_at` is stale and swept instead of acted on.
#[must_use]
pub fn stale_after_sec(guard: &GuardSettings) -> u64 {
    guard.ban_grace_sec + guard.active_seen_sec + 60
}

/// Only users both over the device limit and recently seen are policed;
/// the recency predicate prevents "tail of window" false bans where a
/// stale IP set still inflates the estimate.
#[must_use]
pub fn is_active_violation(
    devices_estimate: usize,
    last_seen_ago_sec: f64,
    guard: &GuardSettings,
) -> bool {
    devices_estimate > guard.devices_limit && last_seen_ago_sec <= guard.active_seen_sec as f64
}

/// What to do with a user currently in the violation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolatorAction {
    /// No `warned_at` yet: warn and start the grace clock.
    Warn,
    /// Warned and still inside grace: stay silent.
    SilentGrace,
    /// Grace elapsed with the violation persisting: remove the user.
    Ban,
    /// `warned_at` is old enough to be a leftover: sweep it.
    ClearStale,
}

#[must_use]
pub fn violator_action(
    now: i64,
    warned_at: Option<i64>,
    guard: &GuardSettings,
) -> ViolatorAction {
    let Some(warned_at) = warned_at else {
        return ViolatorAction::Warn;
    };

    let since = now.saturating_sub(warned_at);
    #[allow(clippy::cast_possible_wrap)]
    let stale_after = stale_after_sec(guard) as i64;
    #[allow(clippy::cast_possible_wrap)]
    let grace = guard.ban_grace_sec as i64;

    if since > stale_after {
        ViolatorAction::ClearStale
    } else if since < grace {
        ViolatorAction::SilentGrace
    } else {
        ViolatorAction::Ban
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> GuardSettings {
        GuardSettings {
            devices_limit: 2,
            interval_sec: 20,
            ban_grace_sec: 900,
            warn_cooldown_sec: 300,
            disable_cooldown_sec: 1800,
            active_seen_sec: 600,
        }
    }

    #[test]
    fn test_no_warn_mark_means_warn() {
        assert_eq!(violator_action(10_000, None, &guard()), ViolatorAction::Warn);
    }

    #[test]
    fn test_within_grace_is_silent() {
        let now = 10_000;
        assert_eq!(
            violator_action(now, Some(now - 1), &guard()),
            ViolatorAction::SilentGrace
        );
        assert_eq!(
            violator_action(now, Some(now - 899), &guard()),
            ViolatorAction::SilentGrace
        );
    }

    #[test]
    fn test_grace_elapsed_is_ban() {
        let now = 10_000;
        assert_eq!(
            violator_action(now, Some(now - 900), &guard()),
            ViolatorAction::Ban
        );
        assert_eq!(
            violator_action(now, Some(now - 1500), &guard()),
            ViolatorAction::Ban
        );
    }

    #[test]
    fn test_ancient_warn_mark_is_swept() {
        let now = 100_000;
        // stale threshold: 900 + 600 + 60 = 1560
        assert_eq!(
            violator_action(now, Some(now - 1561), &guard()),
            ViolatorAction::ClearStale
        );
        // exactly at the threshold still bans
        assert_eq!(
            violator_action(now, Some(now - 1560), &guard()),
            ViolatorAction::Ban
        );
    }

    #[test]
    fn test_warned_at_ttl_covers_grace_plus_activity() {
        assert_eq!(warned_at_ttl(&guard()), 900 + 600 + 30);
        let mut long_cooldown = guard();
        long_cooldown.warn_cooldown_sec = 10_000;
        assert_eq!(warned_at_ttl(&long_cooldown), 10_000);
    }

    #[test]
    fn test_active_violation_predicate() {
        let g = guard();
        assert!(is_active_violation(3, 10.0, &g));
        assert!(is_active_violation(3, 600.0, &g));
        // at the device limit is fine
        assert!(!is_active_violation(2, 10.0, &g));
        // seen too long ago: tail of the window, not policed
        assert!(!is_active_violation(3, 601.0, &g));
    }
}
