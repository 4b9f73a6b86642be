//! Admission name policy
//!
//! Every admitted node carries a name that is unique, case-insensitively,
//! among all nodes in the session. Colliding names get a " (n)" suffix with
//! the smallest free n. A name stays reserved from allocation until its
//! login fails or its node leaves, so the reserved set is the one place a
//! collision is decided.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;

use crate::node::name_key;

/// Names shorter than this are not accepted as requested
pub const MIN_NAME_LEN: usize = 2;

/// Names longer than this are truncated
pub const MAX_NAME_LEN: usize = 50;

/// Substitute for unusable names when nothing better is known
pub const PLACEHOLDER_NAME: &str = "Player";

/// Number of departed players whose names are remembered per IP
const REMEMBERED_NAMES: usize = 10;

#[derive(Default)]
struct NamingState {
    /// Folded names of logins in progress and of admitted nodes
    reserved: HashSet<String>,
    /// Most recent departures, oldest first
    previous: VecDeque<(IpAddr, String)>,
}

/// Allocates unique node names during admission
#[derive(Default)]
pub struct NameAllocator {
    state: Mutex<NamingState>,
}

impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick and reserve a unique name for a login from `ip`.
    ///
    /// `existing` yields names that are never released, such as the
    /// server's own. The reservation must be released with [`release`]
    /// when the login fails or the admitted node leaves.
    ///
    /// [`release`]: NameAllocator::release
    pub fn allocate<'a, I>(&self, requested: &str, ip: IpAddr, existing: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut state = self.state.lock();
        let base = sanitize_name(requested, previous_name(&state.previous, ip));

        let mut taken: HashSet<String> = existing.into_iter().map(name_key).collect();
        taken.extend(state.reserved.iter().cloned());

        let name = unique_name(&base, |candidate| taken.contains(&name_key(candidate)));
        state.reserved.insert(name_key(&name));
        name
    }

    /// Free a name for reuse
    pub fn release(&self, name: &str) {
        self.state.lock().reserved.remove(&name_key(name));
    }

    /// Record the name a departing player used from `ip`
    pub fn remember(&self, ip: IpAddr, name: &str) {
        let mut state = self.state.lock();
        state.previous.retain(|(prev_ip, _)| *prev_ip != ip);
        state.previous.push_back((ip, crate::node::real_name(name).to_string()));
        while state.previous.len() > REMEMBERED_NAMES {
            state.previous.pop_front();
        }
    }

    /// Name last used by a departed player from `ip`
    pub fn previous_name(&self, ip: IpAddr) -> Option<String> {
        let state = self.state.lock();
        previous_name(&state.previous, ip).map(str::to_string)
    }
}

fn previous_name(previous: &VecDeque<(IpAddr, String)>, ip: IpAddr) -> Option<&str> {
    previous
        .iter()
        .rev()
        .find(|(prev_ip, _)| *prev_ip == ip)
        .map(|(_, name)| name.as_str())
}

/// Apply the length policy to a requested name.
///
/// Too-short names fall back to the name previously used from the same
/// address, or to a fixed placeholder.
pub fn sanitize_name(requested: &str, previous: Option<&str>) -> String {
    let trimmed = requested.trim();
    let name: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    if name.chars().count() >= MIN_NAME_LEN {
        return name;
    }
    match previous {
        Some(prev) if prev.chars().count() >= MIN_NAME_LEN => prev.to_string(),
        _ => PLACEHOLDER_NAME.to_string(),
    }
}

/// Suffix `base` with " (n)" for the smallest n making it unique
pub fn unique_name<F>(base: &str, is_taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    if !is_taken(base) {
        return base.to_string();
    }
    (1u32..)
        .map(|i| format!("{} ({})", base, i))
        .find(|candidate| !is_taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
    const OTHER_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6));

    #[test]
    fn test_unique_name_suffixes() {
        let taken = ["host", "host (1)"];
        let name = unique_name("Host", |c| taken.contains(&c.to_lowercase().as_str()));
        assert_eq!(name, "Host (2)");
        assert_eq!(unique_name("Guest", |_| false), "Guest");
    }

    #[test]
    fn test_repeated_allocations_are_distinct() {
        let allocator = NameAllocator::new();
        let mut admitted = vec!["foo".to_string()];
        for k in 1..=5 {
            let name = allocator.allocate("foo", IP, admitted.iter().map(String::as_str));
            assert_eq!(name, format!("foo ({})", k));
            admitted.push(name.clone());
        }

        let lowered: HashSet<String> = admitted.iter().map(|n| n.to_lowercase()).collect();
        assert_eq!(lowered.len(), admitted.len());
    }

    #[test]
    fn test_reservation_blocks_concurrent_login() {
        let allocator = NameAllocator::new();
        let first = allocator.allocate("Bob", IP, ["Host"]);
        let second = allocator.allocate("bob", OTHER_IP, ["Host"]);
        assert_eq!(first, "Bob");
        assert_eq!(second, "bob (1)");

        allocator.release(&first);
        let third = allocator.allocate("Bob", IP, ["Host", "bob (1)"]);
        assert_eq!(third, "Bob");
    }

    #[test]
    fn test_concurrent_allocations_never_collide() {
        let allocator = NameAllocator::new();
        let names = parking_lot::Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for i in 0..16u8 {
                let allocator = &allocator;
                let names = &names;
                scope.spawn(move || {
                    let ip = IpAddr::V4(Ipv4Addr::new(10, 2, 0, i));
                    let name = allocator.allocate("foo", ip, ["Host"]);
                    names.lock().push(name);
                });
            }
        });

        let names = names.into_inner();
        let folded: HashSet<String> = names.iter().map(|n| name_key(n)).collect();
        assert_eq!(names.len(), 16);
        assert_eq!(folded.len(), 16);
        assert!(folded.contains("foo"));
        assert!(folded.contains("foo (15)"));
    }

    #[test]
    fn test_short_name_uses_placeholder() {
        let allocator = NameAllocator::new();
        assert_eq!(allocator.allocate(" x ", IP, ["Host"]), PLACEHOLDER_NAME);
    }

    #[test]
    fn test_short_name_reoffers_previous_name() {
        let allocator = NameAllocator::new();
        allocator.remember(IP, "Alice (2)");
        assert_eq!(allocator.previous_name(IP).as_deref(), Some("Alice"));
        assert_eq!(allocator.allocate("", IP, ["Host"]), "Alice");
        assert_eq!(allocator.allocate("", OTHER_IP, ["Host"]), PLACEHOLDER_NAME);
    }

    #[test]
    fn test_long_names_truncated() {
        let long = "a".repeat(80);
        assert_eq!(sanitize_name(&long, None).len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_remembered_names_are_bounded() {
        let allocator = NameAllocator::new();
        for i in 0..(REMEMBERED_NAMES as u8 + 5) {
            allocator.remember(IpAddr::V4(Ipv4Addr::new(10, 1, 0, i)), "someone");
        }
        assert_eq!(allocator.state.lock().previous.len(), REMEMBERED_NAMES);
        assert!(allocator.previous_name(IpAddr::V4(Ipv4Addr::new(10, 1, 0, 0))).is_none());
    }
}
