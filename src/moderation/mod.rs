//! Moderation module - Ban and mute enforcement
//!
//! Provides:
//! - Live mute caches keyed by username and hashed MAC, checked on every chat line
//! - Mini-bans by username, IP and hashed MAC, checked at admission
//! - Optional expiry for every entry, with a store hook consulted at expiry
//! - A cache of player MAC hashes, including recently departed players
//!
//! The store is never called while the registry lock is held.

mod expiring;
mod store;

pub use expiring::*;
pub use store::*;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::node::real_name;

/// Moderation errors
#[derive(Error, Debug)]
pub enum ModerationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub type ModerationResult<T> = Result<T, ModerationError>;

/// How many departed players' MAC hashes stay resolvable
pub const DEFAULT_DEPARTED_CACHE: usize = 10;

#[derive(Default)]
struct ModerationState {
    muted_usernames: ExpiringSet<String>,
    muted_macs: ExpiringSet<String>,
    banned_usernames: ExpiringSet<String>,
    banned_ips: ExpiringSet<IpAddr>,
    banned_macs: ExpiringSet<String>,
    /// MAC hash of each connected player, by node name
    macs: HashMap<String, String>,
    /// Most recent departures, oldest first
    departed: VecDeque<(String, String)>,
}

impl ModerationState {
    fn mutes(&self, kind: MuteKind) -> &ExpiringSet<String> {
        match kind {
            MuteKind::Username => &self.muted_usernames,
            MuteKind::Mac => &self.muted_macs,
        }
    }

    fn mutes_mut(&mut self, kind: MuteKind) -> &mut ExpiringSet<String> {
        match kind {
            MuteKind::Username => &mut self.muted_usernames,
            MuteKind::Mac => &mut self.muted_macs,
        }
    }
}

#[derive(Clone, Copy)]
enum MuteKind {
    Username,
    Mac,
}

/// Ban and mute registries for one server
pub struct Moderation {
    state: Mutex<ModerationState>,
    store: Arc<dyn ModerationStore>,
    departed_capacity: usize,
}

impl Moderation {
    pub fn new(store: Arc<dyn ModerationStore>) -> Self {
        Self::with_departed_capacity(store, DEFAULT_DEPARTED_CACHE)
    }

    pub fn with_departed_capacity(store: Arc<dyn ModerationStore>, departed_capacity: usize) -> Self {
        Self {
            state: Mutex::new(ModerationState::default()),
            store,
            departed_capacity,
        }
    }

    pub fn store(&self) -> &Arc<dyn ModerationStore> {
        &self.store
    }

    // ---- player MAC cache ----

    /// Remember a newly admitted player and restore any mutes the store holds
    pub fn player_login(&self, name: &str, mac: &str) {
        self.state.lock().macs.insert(name.to_string(), mac.to_string());

        let username = real_name(name).to_string();
        let now = Utc::now();
        if !self.is_username_muted_at(&username, now) {
            if let Some(until) = self.store.username_unmute_time(&username).filter(|t| *t > now) {
                tracing::info!("Restoring mute of '{}' until {}", username, until);
                self.state.lock().muted_usernames.insert(username, Some(until));
            }
        }
        if !self.is_mac_muted_at(mac, now) {
            if let Some(until) = self.store.mac_unmute_time(mac).filter(|t| *t > now) {
                self.state.lock().muted_macs.insert(mac.to_string(), Some(until));
            }
        }
    }

    /// Move a departing player's MAC hash to the recently-departed cache
    pub fn player_departed(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(mac) = state.macs.remove(name) {
            state.departed.retain(|(n, _)| n != name);
            state.departed.push_back((name.to_string(), mac));
            while state.departed.len() > self.departed_capacity {
                state.departed.pop_front();
            }
        }
    }

    /// MAC hash of a connected or recently departed player
    pub fn player_mac(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        state.macs.get(name).cloned().or_else(|| {
            state
                .departed
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, mac)| mac.clone())
        })
    }

    // ---- mutes ----

    pub fn mute_username(&self, username: &str, expires: Option<DateTime<Utc>>) -> ModerationResult<()> {
        let username = real_name(username).to_string();
        self.state.lock().muted_usernames.insert(username.clone(), expires);
        tracing::info!("Muted username '{}' until {}", username, describe(expires));
        self.store.record_mute(&MuteRecord {
            username: Some(username),
            mac: None,
            expires,
        })
    }

    pub fn mute_mac(&self, mac: &str, expires: Option<DateTime<Utc>>) -> ModerationResult<()> {
        self.state.lock().muted_macs.insert(mac.to_string(), expires);
        tracing::info!("Muted MAC {} until {}", mac, describe(expires));
        self.store.record_mute(&MuteRecord {
            username: None,
            mac: Some(mac.to_string()),
            expires,
        })
    }

    pub fn unmute_username(&self, username: &str) -> bool {
        self.state.lock().muted_usernames.remove(&real_name(username).to_string())
    }

    pub fn unmute_mac(&self, mac: &str) -> bool {
        self.state.lock().muted_macs.remove(&mac.to_string())
    }

    pub fn is_username_muted(&self, username: &str) -> bool {
        self.is_username_muted_at(real_name(username), Utc::now())
    }

    pub fn is_mac_muted(&self, mac: &str) -> bool {
        self.is_mac_muted_at(mac, Utc::now())
    }

    /// Whether chat from the node named `name` must be suppressed
    pub fn is_player_muted(&self, name: &str) -> bool {
        let now = Utc::now();
        if self.is_username_muted_at(real_name(name), now) {
            return true;
        }
        match self.player_mac(name) {
            Some(mac) => self.is_mac_muted_at(&mac, now),
            None => false,
        }
    }

    pub fn is_username_muted_at(&self, username: &str, now: DateTime<Utc>) -> bool {
        self.resolve_mute(MuteKind::Username, username, now)
    }

    pub fn is_mac_muted_at(&self, mac: &str, now: DateTime<Utc>) -> bool {
        self.resolve_mute(MuteKind::Mac, mac, now)
    }

    /// Read-only check. An entry past its expiry still mutes while the store
    /// reports a later unmute time; [`purge_expired`] does the cleanup.
    ///
    /// [`purge_expired`]: Moderation::purge_expired
    fn resolve_mute(&self, kind: MuteKind, key: &str, now: DateTime<Utc>) -> bool {
        let key = key.to_string();
        let status = {
            let state = self.state.lock();
            state.mutes(kind).status(&key, now)
        };
        match status {
            EntryStatus::Live => true,
            EntryStatus::Absent => false,
            EntryStatus::Expired => self.stored_unmute_time(kind, &key).map_or(false, |until| until > now),
        }
    }

    fn stored_unmute_time(&self, kind: MuteKind, key: &str) -> Option<DateTime<Utc>> {
        match kind {
            MuteKind::Username => self.store.username_unmute_time(key),
            MuteKind::Mac => self.store.mac_unmute_time(key),
        }
    }

    /// Lift or extend one expired mute. Skipped if the entry changed since `seen`.
    fn settle_mute(&self, kind: MuteKind, key: String, seen: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        let still_muted = self.stored_unmute_time(kind, &key).filter(|until| *until > now);

        let mut state = self.state.lock();
        let set = state.mutes_mut(kind);
        if set.expiry(&key) != Some(seen) {
            return;
        }
        match still_muted {
            Some(until) => set.insert(key, Some(until)),
            None => {
                set.remove(&key);
                tracing::debug!("Mute on {} expired", key);
            }
        }
    }

    // ---- bans ----

    pub fn mini_ban_username(&self, username: &str, expires: Option<DateTime<Utc>>) {
        let username = real_name(username).to_string();
        tracing::info!("Banned username '{}' until {}", username, describe(expires));
        self.state.lock().banned_usernames.insert(username, expires);
    }

    pub fn mini_ban_ip(&self, ip: IpAddr, expires: Option<DateTime<Utc>>) {
        tracing::info!("Banned IP {} until {}", ip, describe(expires));
        self.state.lock().banned_ips.insert(ip, expires);
    }

    pub fn mini_ban_mac(&self, mac: &str, expires: Option<DateTime<Utc>>) {
        tracing::info!("Banned MAC {} until {}", mac, describe(expires));
        self.state.lock().banned_macs.insert(mac.to_string(), expires);
    }

    pub fn is_username_mini_banned(&self, username: &str) -> bool {
        self.state
            .lock()
            .banned_usernames
            .contains(&real_name(username).to_string(), Utc::now())
    }

    pub fn is_ip_mini_banned(&self, ip: IpAddr) -> bool {
        self.state.lock().banned_ips.contains(&ip, Utc::now())
    }

    pub fn is_mac_mini_banned(&self, mac: &str) -> bool {
        self.state.lock().banned_macs.contains(&mac.to_string(), Utc::now())
    }

    /// Ban a player by every key known for them and persist the ban
    pub fn ban_player(
        &self,
        name: &str,
        ip: IpAddr,
        mac: Option<&str>,
        expires: Option<DateTime<Utc>>,
    ) -> ModerationResult<()> {
        let mac = mac.map(str::to_string).or_else(|| self.player_mac(name));
        self.mini_ban_username(name, expires);
        self.mini_ban_ip(ip, expires);
        if let Some(mac) = &mac {
            self.mini_ban_mac(mac, expires);
        }
        self.store.record_ban(&BanRecord {
            username: Some(real_name(name).to_string()),
            ip: Some(ip),
            mac,
            expires,
        })
    }

    /// Whether any live registry or the store bans this player
    pub fn is_player_banned(&self, name: &str, ip: IpAddr, mac: Option<&str>) -> bool {
        let username = real_name(name);
        let banned_live = {
            let state = self.state.lock();
            let now = Utc::now();
            state.banned_usernames.contains(&username.to_string(), now)
                || state.banned_ips.contains(&ip, now)
                || mac.map_or(false, |m| state.banned_macs.contains(&m.to_string(), now))
        };
        banned_live || self.store.is_banned(username, ip, mac)
    }

    // ---- expiry ----

    /// Drop expired entries. Mutes the store still reports are extended.
    pub fn purge_expired(&self, now: DateTime<Utc>) {
        let (usernames, macs) = {
            let mut state = self.state.lock();
            for ip in state.banned_ips.expired(now) {
                state.banned_ips.remove(&ip);
            }
            for name in state.banned_usernames.expired(now) {
                state.banned_usernames.remove(&name);
            }
            for mac in state.banned_macs.expired(now) {
                state.banned_macs.remove(&mac);
            }
            (
                state.muted_usernames.expired_entries(now),
                state.muted_macs.expired_entries(now),
            )
        };
        for (username, seen) in usernames {
            self.settle_mute(MuteKind::Username, username, Some(seen), now);
        }
        for (mac, seen) in macs {
            self.settle_mute(MuteKind::Mac, mac, Some(seen), now);
        }
    }
}

impl Default for Moderation {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryOnly))
    }
}

fn describe(expires: Option<DateTime<Utc>>) -> String {
    expires.map_or_else(|| "forever".to_string(), |at| at.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    /// Store that keeps a username muted until a fixed instant
    struct MutedUntil(DateTime<Utc>);

    impl ModerationStore for MutedUntil {
        fn username_unmute_time(&self, _username: &str) -> Option<DateTime<Utc>> {
            Some(self.0)
        }
    }

    #[test]
    fn test_mute_expires_exactly_at_deadline() {
        let moderation = Moderation::default();
        let start = Utc::now();
        let expiry = start + Duration::seconds(30);
        moderation.mute_username("bob", Some(expiry)).unwrap();

        for secs in [0, 10, 29] {
            assert!(moderation.is_username_muted_at("bob", start + Duration::seconds(secs)));
        }
        assert!(!moderation.is_username_muted_at("bob", expiry));
        assert!(!moderation.is_username_muted_at("bob", expiry + Duration::seconds(1)));
    }

    #[test]
    fn test_sampling_the_future_keeps_a_live_mute() {
        let moderation = Moderation::default();
        let start = Utc::now();
        let expiry = start + Duration::seconds(30);
        moderation.mute_username("bob", Some(expiry)).unwrap();

        assert!(!moderation.is_username_muted_at("bob", expiry));
        assert!(moderation.is_username_muted_at("bob", expiry - Duration::seconds(29)));
        assert!(moderation.is_username_muted("bob"));
        assert_eq!(moderation.state.lock().muted_usernames.len(), 1);
    }

    #[test]
    fn test_purge_skips_a_refreshed_mute() {
        let moderation = Moderation::default();
        let now = Utc::now();
        let first = now - Duration::seconds(5);
        moderation.mute_username("gina", Some(first)).unwrap();

        // Re-muted after the sweep listed the entry but before it settled it
        moderation.mute_username("gina", Some(now + Duration::hours(1))).unwrap();
        moderation.settle_mute(MuteKind::Username, "gina".to_string(), Some(first), now);
        assert!(moderation.is_username_muted("gina"));

        moderation.purge_expired(now);
        assert!(moderation.is_username_muted("gina"));
    }

    #[test]
    fn test_username_mute_applies_to_suffixed_names() {
        let moderation = Moderation::default();
        moderation.mute_username("bob", None).unwrap();
        assert!(moderation.is_player_muted("bob (2)"));
        assert!(!moderation.is_player_muted("alice"));
        assert!(moderation.unmute_username("bob (2)"));
        assert!(!moderation.is_player_muted("bob"));
    }

    #[test]
    fn test_mac_mute_follows_cached_mac() {
        let moderation = Moderation::default();
        moderation.player_login("carol", "mac-c");
        moderation.mute_mac("mac-c", None).unwrap();
        assert!(moderation.is_player_muted("carol"));
        assert!(moderation.is_mac_muted("mac-c"));
    }

    #[test]
    fn test_store_extends_expired_mute() {
        let start = Utc::now();
        let store_until = start + Duration::seconds(120);
        let moderation = Moderation::new(Arc::new(MutedUntil(store_until)));
        moderation
            .mute_username("dave", Some(start + Duration::seconds(10)))
            .unwrap();

        let later = start + Duration::seconds(60);
        assert!(moderation.is_username_muted_at("dave", later));
        assert!(!moderation.is_username_muted_at("dave", store_until));

        moderation.purge_expired(later);
        assert_eq!(
            moderation.state.lock().muted_usernames.expiry(&"dave".to_string()),
            Some(Some(store_until))
        );
    }

    #[test]
    fn test_login_restores_stored_mute() {
        let moderation = Moderation::new(Arc::new(MutedUntil(Utc::now() + Duration::hours(1))));
        moderation.player_login("erin (1)", "mac-e");
        assert!(moderation.is_player_muted("erin (1)"));
    }

    #[test]
    fn test_departed_mac_cache_is_bounded() {
        let moderation = Moderation::with_departed_capacity(Arc::new(InMemoryOnly), 2);
        for name in ["a1", "a2", "a3"] {
            moderation.player_login(name, &format!("mac-{}", name));
            moderation.player_departed(name);
        }
        assert!(moderation.player_mac("a1").is_none());
        assert_eq!(moderation.player_mac("a2").as_deref(), Some("mac-a2"));
        assert_eq!(moderation.player_mac("a3").as_deref(), Some("mac-a3"));
    }

    #[test]
    fn test_ban_player_covers_every_key() {
        let moderation = Moderation::default();
        moderation.player_login("frank", "mac-f");
        moderation
            .ban_player("frank", ip("10.0.0.8"), None, None)
            .unwrap();

        assert!(moderation.is_username_mini_banned("frank"));
        assert!(moderation.is_ip_mini_banned(ip("10.0.0.8")));
        assert!(moderation.is_mac_mini_banned("mac-f"));
        assert!(moderation.is_player_banned("frank (3)", ip("10.9.9.9"), None));
        assert!(moderation.is_player_banned("other", ip("10.0.0.8"), None));
        assert!(moderation.is_player_banned("other", ip("10.9.9.9"), Some("mac-f")));
        assert!(!moderation.is_player_banned("other", ip("10.9.9.9"), Some("mac-x")));
    }

    #[test]
    fn test_purge_drops_expired_bans() {
        let moderation = Moderation::default();
        let now = Utc::now();
        moderation.mini_ban_ip(ip("10.0.0.9"), Some(now + Duration::seconds(5)));
        moderation.mute_mac("m", Some(now + Duration::seconds(5))).unwrap();

        moderation.purge_expired(now + Duration::seconds(6));
        let state = moderation.state.lock();
        assert!(state.banned_ips.is_empty());
        assert!(state.muted_macs.is_empty());
    }
}
