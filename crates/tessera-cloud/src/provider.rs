//! The uniform capability set over each cloud provider.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tessera_db::{Acl, Machine, ProviderName};

/// One (provider, region) pair's view of a cloud.
///
/// Adapters are stateless across calls; credentials and namespace are
/// captured at construction. Concrete SDK-backed adapters live outside
/// this crate and register through a [`ProviderFactory`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Enumerate live instances in this (provider, region). Populates
    /// `cloud_id`, the IPs, `size`, `preemptible`, `disk_size`, and
    /// `floating_ip` on every returned machine.
    async fn list(&self) -> Result<Vec<Machine>>;

    /// Provision instances matching the requests. Returns once the
    /// provider has acknowledged the request, not necessarily once the
    /// VMs are up. Where atomic per-machine failure isn't available,
    /// at-least-once is acceptable; the reconciler deduplicates against
    /// the next `list`.
    async fn boot(&self, machines: Vec<Machine>) -> Result<()>;

    /// Terminate instances by `cloud_id`.
    async fn stop(&self, machines: Vec<Machine>) -> Result<()>;

    /// Re-associate each machine's floating IP to match its
    /// `floating_ip` attribute.
    async fn update_floating_ips(&self, machines: Vec<Machine>) -> Result<()>;

    /// Replace the provider's ingress rule set with exactly this set.
    /// Idempotent.
    async fn set_acls(&self, acls: Vec<Acl>) -> Result<()>;
}

/// Constructs provider adapters and knows which regions to drive.
pub trait ProviderFactory: Send + Sync {
    /// Build an adapter for (provider, region) scoped to `namespace`.
    fn new_provider(
        &self,
        provider: ProviderName,
        region: &str,
        namespace: &str,
    ) -> Result<Arc<dyn Provider>>;

    /// The regions to run reconciliation loops for under `provider`.
    fn regions(&self, provider: ProviderName) -> Vec<String>;
}

/// An in-memory provider for tests.
///
/// Records every call, serves a configurable instance list, and can
/// optionally materialize booted machines as live instances so that
/// convergence tests can run the reconciler to a fixed point.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    machines: Vec<Machine>,
    boots: Vec<Vec<Machine>>,
    stops: Vec<Vec<Machine>>,
    ip_updates: Vec<Vec<Machine>>,
    acl_sets: Vec<Vec<Acl>>,
    auto_materialize: bool,
    next_instance: u32,
}

impl FakeProvider {
    pub fn new() -> Arc<FakeProvider> {
        Arc::new(FakeProvider::default())
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the instances `list` reports.
    pub fn set_machines(&self, machines: Vec<Machine>) {
        self.state().machines = machines;
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.state().machines.clone()
    }

    /// When enabled, `boot` immediately turns requests into live
    /// instances with assigned cloud IDs and addresses.
    pub fn auto_materialize(&self) {
        self.state().auto_materialize = true;
    }

    pub fn boots(&self) -> Vec<Vec<Machine>> {
        self.state().boots.clone()
    }

    pub fn stops(&self) -> Vec<Vec<Machine>> {
        self.state().stops.clone()
    }

    pub fn ip_updates(&self) -> Vec<Vec<Machine>> {
        self.state().ip_updates.clone()
    }

    pub fn acl_sets(&self) -> Vec<Vec<Acl>> {
        self.state().acl_sets.clone()
    }

    /// Total boot/stop/floating-IP calls seen so far.
    pub fn mutation_count(&self) -> usize {
        let state = self.state();
        state.boots.len() + state.stops.len() + state.ip_updates.len()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn list(&self) -> Result<Vec<Machine>> {
        Ok(self.state().machines.clone())
    }

    async fn boot(&self, machines: Vec<Machine>) -> Result<()> {
        let mut state = self.state();
        state.boots.push(machines.clone());
        if state.auto_materialize {
            for mut m in machines {
                state.next_instance += 1;
                let n = state.next_instance;
                m.cloud_id = format!("i-{:04}", n);
                m.public_ip = format!("203.0.113.{}", n);
                m.private_ip = format!("10.0.1.{}", n);
                state.machines.push(m);
            }
        }
        Ok(())
    }

    async fn stop(&self, machines: Vec<Machine>) -> Result<()> {
        let mut state = self.state();
        state.stops.push(machines.clone());
        if state.auto_materialize {
            state
                .machines
                .retain(|m| !machines.iter().any(|s| s.cloud_id == m.cloud_id));
        }
        Ok(())
    }

    async fn update_floating_ips(&self, machines: Vec<Machine>) -> Result<()> {
        let mut state = self.state();
        state.ip_updates.push(machines.clone());
        if state.auto_materialize {
            for update in &machines {
                for m in &mut state.machines {
                    if m.cloud_id == update.cloud_id {
                        m.floating_ip = update.floating_ip.clone();
                    }
                }
            }
        }
        Ok(())
    }

    async fn set_acls(&self, acls: Vec<Acl>) -> Result<()> {
        self.state().acl_sets.push(acls);
        Ok(())
    }
}

/// A factory serving one fake provider for a single (provider, region).
pub struct FakeProviderFactory {
    pub provider: Arc<FakeProvider>,
    pub name: ProviderName,
    pub region: String,
}

impl ProviderFactory for FakeProviderFactory {
    fn new_provider(
        &self,
        provider: ProviderName,
        region: &str,
        _namespace: &str,
    ) -> Result<Arc<dyn Provider>> {
        if provider != self.name || region != self.region {
            bail!("no credentials for {}-{}", provider, region);
        }
        Ok(self.provider.clone())
    }

    fn regions(&self, provider: ProviderName) -> Vec<String> {
        if provider == self.name {
            vec![self.region.clone()]
        } else {
            Vec::new()
        }
    }
}
