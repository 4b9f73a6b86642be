//! Persistent moderation records
//!
//! The live registries only hold what this process has seen. A
//! [`ModerationStore`] lets a host keep bans and mutes across restarts.
//! Every method has a default that reports nothing, so implementors only
//! override what they can answer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use super::{ModerationError, ModerationResult};

/// A persisted ban; any populated key matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub username: Option<String>,
    pub ip: Option<IpAddr>,
    pub mac: Option<String>,
    /// `None` means permanent
    pub expires: Option<DateTime<Utc>>,
}

/// A persisted mute; any populated key matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteRecord {
    pub username: Option<String>,
    pub mac: Option<String>,
    pub expires: Option<DateTime<Utc>>,
}

fn is_current(expires: &Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires.map_or(true, |at| now < at)
}

/// Backing store consulted alongside the live registries
pub trait ModerationStore: Send + Sync {
    /// When a muted username is to be unmuted, if it is muted at all
    fn username_unmute_time(&self, _username: &str) -> Option<DateTime<Utc>> {
        None
    }

    /// When a muted MAC hash is to be unmuted, if it is muted at all
    fn mac_unmute_time(&self, _mac: &str) -> Option<DateTime<Utc>> {
        None
    }

    fn is_banned(&self, _username: &str, _ip: IpAddr, _mac: Option<&str>) -> bool {
        false
    }

    fn record_ban(&self, _ban: &BanRecord) -> ModerationResult<()> {
        Ok(())
    }

    fn record_mute(&self, _mute: &MuteRecord) -> ModerationResult<()> {
        Ok(())
    }
}

/// Keeps nothing beyond the live registries
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryOnly;

impl ModerationStore for InMemoryOnly {}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    bans: Vec<BanRecord>,
    #[serde(default)]
    mutes: Vec<MuteRecord>,
}

/// TOML file of ban and mute records
pub struct FileModerationStore {
    path: PathBuf,
    records: Mutex<StoreFile>,
}

impl FileModerationStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> ModerationResult<Self> {
        let path = path.into();
        let records = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            toml::from_str(&contents)?
        } else {
            StoreFile::default()
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, records: &StoreFile) -> ModerationResult<()> {
        let contents = toml::to_string_pretty(records)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, contents).map_err(ModerationError::Io)
    }

    fn mute_expiry<F>(&self, matches: F) -> Option<DateTime<Utc>>
    where
        F: Fn(&MuteRecord) -> bool,
    {
        let now = Utc::now();
        self.records
            .lock()
            .mutes
            .iter()
            .filter(|m| matches(m) && is_current(&m.expires, now))
            .map(|m| m.expires.unwrap_or(DateTime::<Utc>::MAX_UTC))
            .max()
    }
}

impl ModerationStore for FileModerationStore {
    fn username_unmute_time(&self, username: &str) -> Option<DateTime<Utc>> {
        self.mute_expiry(|m| m.username.as_deref() == Some(username))
    }

    fn mac_unmute_time(&self, mac: &str) -> Option<DateTime<Utc>> {
        self.mute_expiry(|m| m.mac.as_deref() == Some(mac))
    }

    fn is_banned(&self, username: &str, ip: IpAddr, mac: Option<&str>) -> bool {
        let now = Utc::now();
        self.records.lock().bans.iter().any(|ban| {
            is_current(&ban.expires, now)
                && (ban.username.as_deref() == Some(username)
                    || ban.ip == Some(ip)
                    || (mac.is_some() && ban.mac.as_deref() == mac))
        })
    }

    fn record_ban(&self, ban: &BanRecord) -> ModerationResult<()> {
        let mut records = self.records.lock();
        let now = Utc::now();
        records.bans.retain(|b| is_current(&b.expires, now));
        records.bans.push(ban.clone());
        self.save(&records)
    }

    fn record_mute(&self, mute: &MuteRecord) -> ModerationResult<()> {
        let mut records = self.records.lock();
        let now = Utc::now();
        records.mutes.retain(|m| is_current(&m.expires, now));
        records.mutes.push(mute.clone());
        self.save(&records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_defaults_report_nothing() {
        let store = InMemoryOnly;
        assert!(!store.is_banned("bob", ip("10.0.0.1"), None));
        assert!(store.username_unmute_time("bob").is_none());
        assert!(store.record_ban(&BanRecord {
            username: Some("bob".into()),
            ip: None,
            mac: None,
            expires: None,
        })
        .is_ok());
    }

    #[test]
    fn test_ban_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bans.toml");

        let store = FileModerationStore::open(&path).unwrap();
        store
            .record_ban(&BanRecord {
                username: Some("mallory".into()),
                ip: Some(ip("10.0.0.66")),
                mac: None,
                expires: None,
            })
            .unwrap();
        drop(store);

        let reopened = FileModerationStore::open(&path).unwrap();
        assert!(reopened.is_banned("mallory", ip("10.0.0.1"), None));
        assert!(reopened.is_banned("someone", ip("10.0.0.66"), None));
        assert!(!reopened.is_banned("someone", ip("10.0.0.1"), Some("mac")));
    }

    #[test]
    fn test_expired_ban_is_ignored() {
        let dir = tempdir().unwrap();
        let store = FileModerationStore::open(dir.path().join("bans.toml")).unwrap();
        store
            .record_ban(&BanRecord {
                username: None,
                ip: None,
                mac: Some("m".into()),
                expires: Some(Utc::now() - Duration::seconds(5)),
            })
            .unwrap();
        assert!(!store.is_banned("x", ip("10.0.0.1"), Some("m")));
    }

    #[test]
    fn test_mute_times() {
        let dir = tempdir().unwrap();
        let store = FileModerationStore::open(dir.path().join("mutes.toml")).unwrap();
        let until = Utc::now() + Duration::minutes(10);
        store
            .record_mute(&MuteRecord {
                username: Some("bob".into()),
                mac: None,
                expires: Some(until),
            })
            .unwrap();
        store
            .record_mute(&MuteRecord {
                username: None,
                mac: Some("m".into()),
                expires: None,
            })
            .unwrap();

        assert_eq!(store.username_unmute_time("bob"), Some(until));
        assert_eq!(store.mac_unmute_time("m"), Some(DateTime::<Utc>::MAX_UTC));
        assert!(store.username_unmute_time("alice").is_none());
    }
}
