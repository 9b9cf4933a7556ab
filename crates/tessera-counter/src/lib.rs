//! Process-global debugging counters.
//!
//! Modules that talk to external systems (cloud providers, minions, the
//! Docker daemon) keep named monotonic counters addressable as
//! `(module, name)`. Counters only ever go up and are exported verbatim
//! through the daemon's query surface, which makes them a cheap way to
//! answer "did we ever call Boot?" and "how often does List fail?" from
//! a live deployment.

use std::collections::BTreeMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

static REGISTRY: Lazy<Mutex<BTreeMap<(String, String), u64>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

/// A handle that increments counters under a fixed module name.
///
/// Handles are cheap to clone and share; the underlying registry is
/// process-global so two handles with the same module name address the
/// same counters.
#[derive(Debug, Clone, Copy)]
pub struct Counter {
    module: &'static str,
}

/// Create a counter handle for `module`. Usable in statics.
pub const fn new(module: &'static str) -> Counter {
    Counter { module }
}

impl Counter {
    /// Increment the counter `name` under this handle's module.
    pub fn inc(&self, name: &str) {
        let mut registry = lock();
        *registry
            .entry((self.module.to_string(), name.to_string()))
            .or_insert(0) += 1;
    }
}

/// A point-in-time reading of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub module: String,
    pub name: String,
    pub value: u64,
}

/// Snapshot every counter, sorted by (module, name).
pub fn dump() -> Vec<Snapshot> {
    lock()
        .iter()
        .map(|((module, name), value)| Snapshot {
            module: module.clone(),
            name: name.clone(),
            value: *value,
        })
        .collect()
}

/// Current value of a single counter. Zero if it was never incremented.
pub fn value(module: &str, name: &str) -> u64 {
    lock()
        .get(&(module.to_string(), name.to_string()))
        .copied()
        .unwrap_or(0)
}

fn lock() -> std::sync::MutexGuard<'static, BTreeMap<(String, String), u64>> {
    // A poisoned registry still holds valid counts.
    REGISTRY.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_and_value() {
        let c = new("CounterTestA");
        assert_eq!(value("CounterTestA", "Boot"), 0);

        c.inc("Boot");
        c.inc("Boot");
        c.inc("List");

        assert_eq!(value("CounterTestA", "Boot"), 2);
        assert_eq!(value("CounterTestA", "List"), 1);
    }

    #[test]
    fn test_handles_share_registry() {
        let a = new("CounterTestB");
        let b = new("CounterTestB");

        a.inc("Stop");
        b.inc("Stop");

        assert_eq!(value("CounterTestB", "Stop"), 2);
    }

    #[test]
    fn test_dump_sorted() {
        let c = new("CounterTestC");
        c.inc("Zeta");
        c.inc("Alpha");

        let snapshots: Vec<_> = dump()
            .into_iter()
            .filter(|s| s.module == "CounterTestC")
            .collect();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].name, "Alpha");
        assert_eq!(snapshots[1].name, "Zeta");
        assert_eq!(snapshots[0].value, 1);
    }
}
