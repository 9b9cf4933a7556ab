//! Explicit context threaded through the cloud-side loops.
//!
//! Everything the reconciler and foreman reach out to (the store, the
//! wall clock, the daemon's own IP, provider construction, minion
//! dialing) arrives through this struct, so tests can substitute a
//! fake for each piece independently.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tessera_db::Conn;

use crate::foreman::MinionDialer;
use crate::provider::ProviderFactory;

/// A source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A settable clock for tests.
#[derive(Clone)]
pub struct FixedClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> FixedClock {
        FixedClock {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resolves the daemon's own public IP, used to substitute the `local`
/// ACL token at apply time.
pub trait IpSource: Send + Sync {
    fn my_ip(&self) -> Result<String>;
}

/// An IP source with a fixed answer.
pub struct StaticIpSource(pub String);

impl IpSource for StaticIpSource {
    fn my_ip(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Handles to everything the cloud side touches.
#[derive(Clone)]
pub struct Context {
    pub conn: Conn,
    pub clock: Arc<dyn Clock>,
    pub my_ip: Arc<dyn IpSource>,
    pub providers: Arc<dyn ProviderFactory>,
    pub dialer: Arc<dyn MinionDialer>,

    /// Optional administrator SSH key appended to every machine.
    pub admin_key: String,
}
