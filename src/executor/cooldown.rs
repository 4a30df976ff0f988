//! Per-user rate-limit cooldowns.
//!
//! When an upstream 429 is observed for a user, a cooldown window is
//! recorded; requests from the same user inside the window are rejected
//! locally with a synthesized 429 and never reach the upstream. Entries are
//! removed lazily on first access past expiry and eagerly when the active
//! set is listed. At most one entry exists per user: re-application keeps
//! whichever expiry is later.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Upper bound on a single cooldown window.
const MAX_COOLDOWN_SECS: i64 = 300;

/// Window applied when the upstream's retry-after is absent or unparseable.
const DEFAULT_COOLDOWN_SECS: i64 = 180;

/// One user's active cooldown.
#[derive(Debug, Clone, Serialize)]
pub struct Cooldown {
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub retry_after_seconds: u64,
    pub reason: String,
}

impl Cooldown {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Whole seconds until expiry, for the synthesized retry-after header.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_seconds().max(0) as u64
    }
}

/// Concurrent per-user cooldown table. O(1) per operation.
#[derive(Debug, Default)]
pub struct CooldownTable {
    entries: DashMap<String, Cooldown>,
}

impl CooldownTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cooldown for `user_id` from an upstream 429.
    ///
    /// The window is `min(retry_after, 5 min)`, defaulting to 3 min when the
    /// upstream gave nothing parseable. Re-applying keeps the later expiry.
    pub fn apply(&self, user_id: &str, retry_after: Option<u64>, reason: &str) -> Cooldown {
        let secs = retry_after
            .map(|s| (s as i64).min(MAX_COOLDOWN_SECS))
            .unwrap_or(DEFAULT_COOLDOWN_SECS);
        let now = Utc::now();
        let candidate = Cooldown {
            user_id: user_id.to_string(),
            expires_at: now + Duration::seconds(secs),
            retry_after_seconds: secs as u64,
            reason: reason.to_string(),
        };

        let mut slot = self
            .entries
            .entry(user_id.to_string())
            .or_insert_with(|| candidate.clone());
        if candidate.expires_at > slot.expires_at {
            *slot = candidate;
        }
        slot.clone()
    }

    /// Active cooldown for `user_id`, removing it lazily when expired.
    pub fn check(&self, user_id: &str) -> Option<Cooldown> {
        let now = Utc::now();
        // Read guard must drop before the remove below.
        {
            let entry = self.entries.get(user_id)?;
            if !entry.is_expired(now) {
                return Some(entry.clone());
            }
        }
        self.entries.remove(user_id);
        None
    }

    /// All active cooldowns; expired entries are removed eagerly here.
    pub fn active(&self) -> Vec<Cooldown> {
        let now = Utc::now();
        self.entries.retain(|_, c| !c.is_expired(now));
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Admin clear. Returns whether an entry existed.
    pub fn clear(&self, user_id: &str) -> bool {
        self.entries.remove(user_id).is_some()
    }

    /// Count of users with an active cooldown.
    pub fn unique_users(&self) -> usize {
        let now = Utc::now();
        self.entries.retain(|_, c| !c.is_expired(now));
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_caps_retry_after_at_five_minutes() {
        let table = CooldownTable::new();
        let c = table.apply("u_1", Some(3_600), "anthropic_429");
        assert_eq!(c.retry_after_seconds, 300);
    }

    #[test]
    fn apply_defaults_to_three_minutes_when_unparseable() {
        let table = CooldownTable::new();
        let c = table.apply("u_1", None, "anthropic_429");
        assert_eq!(c.retry_after_seconds, 180);
    }

    #[test]
    fn check_returns_active_entry_with_remaining_secs() {
        let table = CooldownTable::new();
        table.apply("u_1", Some(120), "anthropic_429");
        let c = table.check("u_1").expect("cooldown should be active");
        let remaining = c.remaining_secs(Utc::now());
        assert!(remaining > 0 && remaining <= 120);
    }

    #[test]
    fn check_is_none_for_unknown_user() {
        let table = CooldownTable::new();
        assert!(table.check("u_unknown").is_none());
    }

    #[test]
    fn expired_entry_is_removed_on_first_access() {
        let table = CooldownTable::new();
        table.apply("u_1", Some(60), "anthropic_429");
        // Force expiry by rewriting the stored deadline into the past.
        table.entries.alter("u_1", |_, mut c| {
            c.expires_at = Utc::now() - Duration::seconds(1);
            c
        });

        assert!(table.check("u_1").is_none());
        // The entry must be gone, not just filtered.
        assert!(table.entries.get("u_1").is_none());
    }

    #[test]
    fn at_most_one_entry_per_user_with_later_expiry_retained() {
        let table = CooldownTable::new();
        let first = table.apply("u_1", Some(120), "anthropic_429");
        let second = table.apply("u_1", Some(120), "anthropic_429");

        assert_eq!(table.unique_users(), 1);
        // Second application is issued later, so its expiry is >= the first.
        assert!(second.expires_at >= first.expires_at);
        let stored = table.check("u_1").unwrap();
        assert_eq!(stored.expires_at, second.expires_at);
    }

    #[test]
    fn reapply_with_shorter_window_does_not_shrink_expiry() {
        let table = CooldownTable::new();
        let long = table.apply("u_1", Some(300), "anthropic_429");
        table.apply("u_1", Some(1), "anthropic_429");
        let stored = table.check("u_1").unwrap();
        assert_eq!(stored.expires_at, long.expires_at);
    }

    #[test]
    fn active_eagerly_drops_expired_entries() {
        let table = CooldownTable::new();
        table.apply("u_live", Some(120), "anthropic_429");
        table.apply("u_dead", Some(120), "anthropic_429");
        table.entries.alter("u_dead", |_, mut c| {
            c.expires_at = Utc::now() - Duration::seconds(1);
            c
        });

        let active = table.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, "u_live");
        assert!(table.entries.get("u_dead").is_none());
    }

    #[test]
    fn clear_removes_entry_and_reports_presence() {
        let table = CooldownTable::new();
        table.apply("u_1", Some(60), "anthropic_429");
        assert!(table.clear("u_1"));
        assert!(!table.clear("u_1"));
        assert!(table.check("u_1").is_none());
    }
}
