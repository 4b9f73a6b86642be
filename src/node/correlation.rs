//! Correlation identifiers
//!
//! A correlation id pairs an asynchronous request with its eventual response
//! across the wire. Ids combine a prefix minted once per process start with a
//! monotonic local counter, so ids from independently started processes do not
//! collide and ids within a process are never reused.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// Globally unique call-correlation token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId {
    prefix: Uuid,
    sequence: u64,
}

impl CorrelationId {
    /// Mint a new id from the process-wide generator
    pub fn new() -> Self {
        global().next()
    }

    pub fn prefix(&self) -> Uuid {
        self.prefix
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix.simple(), self.sequence)
    }
}

struct GeneratorState {
    prefix: Uuid,
    next: u64,
}

/// Source of correlation ids
pub struct CorrelationIdGenerator {
    state: Mutex<GeneratorState>,
}

impl CorrelationIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    fn starting_at(next: u64) -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                prefix: Uuid::new_v4(),
                next,
            }),
        }
    }

    /// Produce the next id. When the counter is exhausted a fresh prefix is
    /// minted and the counter restarts.
    pub fn next(&self) -> CorrelationId {
        let mut state = self.state.lock();
        let id = CorrelationId {
            prefix: state.prefix,
            sequence: state.next,
        };
        match state.next.checked_add(1) {
            Some(next) => state.next = next,
            None => {
                state.prefix = Uuid::new_v4();
                state.next = 0;
                tracing::debug!("Correlation counter wrapped, minted prefix {}", state.prefix);
            }
        }
        id
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn global() -> &'static CorrelationIdGenerator {
    static GENERATOR: OnceLock<CorrelationIdGenerator> = OnceLock::new();
    GENERATOR.get_or_init(CorrelationIdGenerator::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ten_thousand_ids_are_distinct() {
        let ids: HashSet<CorrelationId> = (0..10_000).map(|_| CorrelationId::new()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_independent_generators_use_different_prefixes() {
        let a = CorrelationIdGenerator::new().next();
        let b = CorrelationIdGenerator::new().next();
        assert_eq!(a.sequence(), b.sequence());
        assert_ne!(a, b);
    }

    #[test]
    fn test_overflow_mints_new_prefix() {
        let generator = CorrelationIdGenerator::starting_at(u64::MAX);
        let last = generator.next();
        let wrapped = generator.next();

        assert_eq!(last.sequence(), u64::MAX);
        assert_eq!(wrapped.sequence(), 0);
        assert_ne!(last.prefix(), wrapped.prefix());
        assert_ne!(last, wrapped);
    }

    #[test]
    fn test_concurrent_generation_is_unique() {
        let generator = std::sync::Arc::new(CorrelationIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || (0..1000).map(|_| generator.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 4000);
    }
}
