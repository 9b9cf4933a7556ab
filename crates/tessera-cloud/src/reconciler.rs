//! The per-(provider, region) reconciliation loop.
//!
//! Each loop repeatedly folds the provider's instance list into the
//! machine table (phase 1), diffs the table against the blueprint's
//! desired machines (phase 2), and applies the resulting boot, stop,
//! and floating-IP batches. Provider failures are logged and dropped;
//! the next tick re-derives the whole plan from fresh state, so nothing
//! is ever retried in a tight loop.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use tessera_counter::Counter;
use tessera_db::{self as db, Acl, Machine, ProviderName, Role, Status, Table, View};
use tessera_join::join;

use crate::context::Context;
use crate::provider::Provider;
use crate::sizes::{choose_size, default_region, DEFAULT_DISK_SIZE_GB};

static C: Counter = tessera_counter::new("Cloud");

/// Machines stuck in Booting or Stopping longer than this are dropped
/// from the table; if the instance exists it will resurface on the next
/// list.
const STALE_STATUS_MINUTES: i64 = 5;

/// One (provider, region) reconciliation loop.
pub struct Cloud {
    ctx: Context,
    namespace: String,
    provider_name: ProviderName,
    region: String,
    provider: Arc<dyn Provider>,
}

/// What one pass decided to do.
#[derive(Default)]
struct Plan {
    acls: Vec<Acl>,
    boot: Vec<Machine>,
    stop: Vec<Machine>,
    update_ips: Vec<Machine>,

    /// No machines live in or are wanted for this region; its provider
    /// rule set is cleared.
    region_empty: bool,
}

impl Plan {
    fn quiescent(&self) -> bool {
        self.boot.is_empty() && self.stop.is_empty() && self.update_ips.is_empty()
    }
}

impl Cloud {
    pub fn new(
        ctx: Context,
        provider_name: ProviderName,
        region: &str,
        namespace: &str,
    ) -> Result<Cloud> {
        let provider = ctx
            .providers
            .new_provider(provider_name, region, namespace)
            .with_context(|| format!("connect {}-{}", provider_name, region))?;
        Ok(Cloud {
            ctx,
            namespace: namespace.to_string(),
            provider_name,
            region: region.to_string(),
            provider,
        })
    }

    /// Drive this (provider, region) until `stop` flips.
    ///
    /// A mutating pass arms an expedited re-run on a linear 1-10 second
    /// ramp so the cloud converges quickly after changes while staying
    /// idle otherwise.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        debug!(cloud = %self, "Start cloud loop");
        let mut trigger = self
            .ctx
            .conn
            .trigger_tick(60, &[Table::Blueprint, Table::Machine]);
        let mut timeout_count: u64 = 0;

        loop {
            if timeout_count > 0 {
                let delay = Duration::from_secs(11 - timeout_count);
                tokio::select! {
                    _ = stop.changed() => {}
                    _ = trigger.recv() => {}
                    _ = tokio::time::sleep(delay) => { timeout_count -= 1; }
                }
            } else {
                tokio::select! {
                    _ = stop.changed() => {}
                    _ = trigger.recv() => {}
                }
            }

            if *stop.borrow() {
                debug!(cloud = %self, "Stop cloud loop");
                return;
            }

            if self.run_once().await {
                timeout_count = 10;
            }
        }
    }

    /// One reconciliation pass. Returns whether anything was mutated.
    pub async fn run_once(&self) -> bool {
        let cloud_machines = match self.list().await {
            Ok(machines) => machines,
            Err(e) => {
                debug!(cloud = %self, error = %e, "List failed");
                return false;
            }
        };

        let plan = match self.plan(cloud_machines) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(cloud = %self, error = %e, "Reconciliation transaction aborted");
                return false;
            }
        };

        if plan.quiescent() {
            // ACLs are only re-pushed while nothing else is in flight,
            // so rule changes never race provisioning.
            let acls = if plan.region_empty { &[] } else { &plan.acls[..] };
            self.sync_acls(acls).await;
            return false;
        }

        if !plan.boot.is_empty() {
            let count = plan.boot.len();
            self.apply("Boot", count, self.provider.boot(plan.boot)).await;
        }
        if !plan.stop.is_empty() {
            let count = plan.stop.len();
            self.apply("Stop", count, self.provider.stop(plan.stop)).await;
        }
        if !plan.update_ips.is_empty() {
            let count = plan.update_ips.len();
            self.apply(
                "UpdateFloatingIPs",
                count,
                self.provider.update_floating_ips(plan.update_ips),
            )
            .await;
        }

        true
    }

    async fn list(&self) -> Result<Vec<Machine>> {
        C.inc("List");
        let machines = self
            .provider
            .list()
            .await
            .with_context(|| format!("list {}", self))?;
        Ok(machines
            .into_iter()
            .map(|mut m| {
                m.provider = self.provider_name;
                m.region = self.region.clone();
                m
            })
            .collect())
    }

    /// Derive the full plan inside one transaction over (Blueprint,
    /// Machine, ACL).
    fn plan(&self, cloud_machines: Vec<Machine>) -> Result<Plan> {
        let now = self.ctx.clock.now();
        self.ctx.conn.txn(
            &[Table::Blueprint, Table::Machine, Table::Acl],
            |view| {
                let bp = view.get_blueprint();
                if let Some(bp) = &bp {
                    if bp.namespace != self.namespace {
                        bail!(
                            "namespace changed from \"{}\" to \"{}\"",
                            self.namespace,
                            bp.namespace
                        );
                    }
                }
                // A missing blueprint reads as "no desired machines":
                // everything in this region gets stopped.

                self.gc_stale_boots(view, now);
                self.sync_db_with_cloud(view, cloud_machines);
                let mut plan = self.plan_updates(view, bp.as_ref(), now);

                plan.acls = derive_acls(view, bp.as_ref());
                sync_acl_table(view, &plan.acls);
                plan.region_empty = view.select_from::<Machine>(|m| self.owns(m)).is_empty();
                Ok(plan)
            },
        )
    }

    fn owns(&self, m: &Machine) -> bool {
        m.provider == self.provider_name && m.region == self.region
    }

    fn gc_stale_boots(&self, view: &mut View<'_>, now: DateTime<Utc>) {
        for dbm in view.select_from::<Machine>(|m| self.owns(m)) {
            let stale = matches!(dbm.status, Status::Booting | Status::Stopping)
                && now - dbm.status_time > chrono::Duration::minutes(STALE_STATUS_MINUTES);
            if stale {
                warn!(machine = %dbm, status = %dbm.status, "Removing machine stuck in transition");
                view.remove(&dbm);
            }
        }
    }

    /// Phase 1: fold the provider's instance list into the machine
    /// table. Matched rows absorb the cloud-observed fields but keep
    /// their identity, status, and SSH keys; unknown instances get new
    /// rows; rows the cloud no longer backs are dropped unless we are
    /// still waiting on their boot.
    fn sync_db_with_cloud(&self, view: &mut View<'_>, cloud_machines: Vec<Machine>) {
        let dbms = view.select_from::<Machine>(|m| self.owns(m));
        let joined = join(dbms, cloud_machines, phase1_score);

        for dbm in joined.unmatched_left {
            if dbm.status != Status::Booting {
                view.remove(&dbm);
            }
        }

        let mut pairs = joined.pairs;
        for cm in joined.unmatched_right {
            pairs.push((view.insert::<Machine>(), cm));
        }

        for (mut dbm, cm) in pairs {
            dbm.cloud_id = cm.cloud_id;
            dbm.public_ip = cm.public_ip;
            dbm.private_ip = cm.private_ip;
            dbm.provider = cm.provider;
            dbm.region = cm.region;
            dbm.size = cm.size;
            dbm.floating_ip = cm.floating_ip;
            dbm.preemptible = cm.preemptible;
            dbm.disk_size = cm.disk_size;
            view.commit(dbm);
        }
    }

    /// Phase 2: diff the blueprint's desired machines against the
    /// table. Matched rows absorb the mutable fields; leftover desired
    /// machines become boots; leftover rows become stops.
    fn plan_updates(
        &self,
        view: &mut View<'_>,
        bp: Option<&db::Blueprint>,
        now: DateTime<Utc>,
    ) -> Plan {
        let mut plan = Plan::default();

        let desired = bp
            .map(|bp| self.desired_machines(&bp.spec))
            .unwrap_or_default();
        let dbms = view.select_from::<Machine>(|m| self.owns(m));
        let joined = join(desired, dbms, phase2_score);

        for mut dbm in joined.unmatched_right {
            // Told to stop a machine mid-boot: there is no cloud ID to
            // terminate yet, so drop the row. If the instance surfaces
            // later it will be stopped properly.
            if dbm.cloud_id.is_empty() {
                view.remove(&dbm);
                continue;
            }
            if dbm.status == Status::Stopping {
                continue;
            }
            dbm.set_status(Status::Stopping, now);
            view.commit(dbm.clone());
            plan.stop.push(dbm);
        }

        let mut pairs = joined.pairs;
        for sm in joined.unmatched_left {
            let mut dbm = view.insert::<Machine>();
            dbm.set_status(Status::Booting, now);
            dbm.provider = sm.provider;
            dbm.region = sm.region.clone();
            dbm.size = sm.size.clone();
            dbm.disk_size = sm.disk_size;
            dbm.preemptible = sm.preemptible;
            dbm.desired_role = sm.role;
            dbm.ssh_keys = sm.ssh_keys.clone();
            view.commit(dbm.clone());
            plan.boot.push(dbm.clone());
            pairs.push((sm, dbm));
        }

        for (sm, mut dbm) in pairs {
            if !dbm.cloud_id.is_empty() && dbm.floating_ip != sm.floating_ip {
                dbm.floating_ip = sm.floating_ip.clone();
                plan.update_ips.push(dbm.clone());
            }

            // These change without restarting the instance.
            dbm.desired_role = sm.role;
            dbm.ssh_keys = sm.ssh_keys;
            view.commit(dbm);
        }

        plan
    }

    /// The blueprint's machines for this (provider, region), with the
    /// default region and disk size substituted, a size chosen when
    /// unspecified, and the admin key appended.
    fn desired_machines(&self, spec: &tessera_blueprint::Blueprint) -> Vec<Machine> {
        let mut dbms = Vec::new();
        for bpm in &spec.machines {
            let provider = match bpm.provider.parse::<ProviderName>() {
                Ok(provider) => provider,
                Err(e) => {
                    C.inc("Unrecognized Provider");
                    warn!(error = %e, "Skipping desired machine");
                    continue;
                }
            };
            if provider != self.provider_name {
                continue;
            }

            let region = if bpm.region.is_empty() {
                default_region(provider).to_string()
            } else {
                bpm.region.clone()
            };
            if region != self.region {
                continue;
            }

            let role = match bpm.role.parse::<Role>() {
                Ok(role) => role,
                Err(e) => {
                    C.inc("Unrecognized Role");
                    warn!(error = %e, "Skipping desired machine");
                    continue;
                }
            };

            let mut dbm = Machine {
                provider,
                region,
                role,
                size: bpm.size.clone(),
                disk_size: bpm.disk_size,
                preemptible: bpm.preemptible,
                floating_ip: bpm.floating_ip.clone(),
                ssh_keys: bpm.ssh_keys.clone(),
                ..Default::default()
            };

            if dbm.size.is_empty() {
                dbm.size = choose_size(provider, bpm.ram, bpm.cpu, spec.max_price);
                if dbm.size.is_empty() {
                    warn!(provider = %provider, region = %dbm.region, "No valid size for machine");
                    continue;
                }
            }
            if dbm.disk_size == 0 {
                dbm.disk_size = DEFAULT_DISK_SIZE_GB;
            }
            if !self.ctx.admin_key.is_empty() {
                dbm.ssh_keys.push(self.ctx.admin_key.clone());
            }

            dbms.push(dbm);
        }
        dbms
    }

    async fn apply(
        &self,
        action: &'static str,
        count: usize,
        call: impl Future<Output = Result<()>>,
    ) {
        C.inc(action);
        match call.await {
            Ok(()) => info!(cloud = %self, action, count, "Updated machines"),
            Err(e) => error!(cloud = %self, action, count, error = %e, "Failed to update machines"),
        }
    }

    /// Push the rule set, resolving the `local` token to the daemon's
    /// own public IP at apply time.
    async fn sync_acls(&self, acls: &[Acl]) {
        let mut resolved = Vec::with_capacity(acls.len());
        for acl in acls {
            if acl.cidr_ip == "local" {
                let ip = match self.ctx.my_ip.my_ip() {
                    Ok(ip) => ip,
                    Err(e) => {
                        error!(error = %e, "Failed to resolve the local IP");
                        return;
                    }
                };
                resolved.push(Acl {
                    cidr_ip: format!("{}/32", ip),
                    ..acl.clone()
                });
            } else {
                resolved.push(acl.clone());
            }
        }

        C.inc("SetACLs");
        if let Err(e) = self.provider.set_acls(resolved).await {
            warn!(cloud = %self, error = %e, "Could not update ACLs");
        }
    }
}

impl fmt::Display for Cloud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.provider_name, self.region, self.namespace)
    }
}

fn phase1_score(dbm: &Machine, cm: &Machine) -> i32 {
    if cm.cloud_id == dbm.cloud_id {
        return 0;
    }

    // A row that already has a cloud ID only matches its own instance.
    if !dbm.cloud_id.is_empty() {
        return -1;
    }

    if cm.size != dbm.size
        || cm.preemptible != dbm.preemptible
        || (cm.disk_size != 0 && dbm.disk_size != 0 && cm.disk_size != dbm.disk_size)
    {
        return -1;
    }

    1
}

fn phase2_score(sm: &Machine, dbm: &Machine) -> i32 {
    if sm.size != dbm.size
        || sm.preemptible != dbm.preemptible
        || (dbm.disk_size != 0 && sm.disk_size != dbm.disk_size)
        || (dbm.role != Role::None && sm.role != dbm.role)
    {
        return -1;
    }

    let mut score = 7;
    if dbm.role != Role::None && dbm.role == sm.role {
        score -= 4;
    }
    if dbm.desired_role != Role::None && dbm.desired_role == sm.role {
        score -= 2;
    }
    if dbm.floating_ip == sm.floating_ip {
        score -= 1;
    }
    score
}

/// The ingress rule set for this namespace: the admin CIDRs plus the
/// daemon itself over all ports, every machine's public IP, and one
/// world-open rule per public connection.
fn derive_acls(view: &View<'_>, bp: Option<&db::Blueprint>) -> Vec<Acl> {
    let Some(bp) = bp else {
        return Vec::new();
    };

    let mut set = BTreeSet::new();
    for cidr in bp.admin_acl.iter().map(String::as_str).chain(["local"]) {
        set.insert(Acl {
            id: 0,
            cidr_ip: cidr.to_string(),
            min_port: 1,
            max_port: 65535,
        });
    }

    for m in view.select_from::<Machine>(|m| !m.public_ip.is_empty()) {
        set.insert(Acl {
            id: 0,
            cidr_ip: format!("{}/32", m.public_ip),
            min_port: 1,
            max_port: 65535,
        });
    }

    for conn in &bp.spec.connections {
        if conn.from == tessera_blueprint::PUBLIC_INTERNET {
            set.insert(Acl {
                id: 0,
                cidr_ip: "0.0.0.0/0".to_string(),
                min_port: conn.min_port,
                max_port: conn.max_port,
            });
        }
    }

    set.into_iter().collect()
}

/// Keep the ACL table in step with the derived rule set so the query
/// surface can show it.
fn sync_acl_table(view: &mut View<'_>, acls: &[Acl]) {
    let desired: BTreeSet<(String, u16, u16)> = acls
        .iter()
        .map(|a| (a.cidr_ip.clone(), a.min_port, a.max_port))
        .collect();

    let mut present = BTreeSet::new();
    for row in view.select_from::<Acl>(|_| true) {
        let key = (row.cidr_ip.clone(), row.min_port, row.max_port);
        if desired.contains(&key) && present.insert(key) {
            continue;
        }
        view.remove(&row);
    }

    for (cidr_ip, min_port, max_port) in desired {
        if present.contains(&(cidr_ip.clone(), min_port, max_port)) {
            continue;
        }
        let mut row = view.insert::<Acl>();
        row.cidr_ip = cidr_ip;
        row.min_port = min_port;
        row.max_port = max_port;
        view.commit(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(size: &str, cloud_id: &str) -> Machine {
        Machine {
            size: size.into(),
            cloud_id: cloud_id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_phase1_exact_cloud_id_wins() {
        let dbm = machine("m3.medium", "i-1");
        let cm = machine("m3.medium", "i-1");
        assert_eq!(phase1_score(&dbm, &cm), 0);
    }

    #[test]
    fn test_phase1_claimed_row_rejects_other_instances() {
        let dbm = machine("m3.medium", "i-1");
        let cm = machine("m3.medium", "i-2");
        assert_eq!(phase1_score(&dbm, &cm), -1);
    }

    #[test]
    fn test_phase1_unclaimed_row_matches_by_shape() {
        let dbm = machine("m3.medium", "");
        let cm = machine("m3.medium", "i-2");
        assert_eq!(phase1_score(&dbm, &cm), 1);

        let smaller = machine("t2.micro", "i-2");
        assert_eq!(phase1_score(&dbm, &smaller), -1);
    }

    #[test]
    fn test_phase1_zero_db_disk_tolerates_mismatch() {
        let mut dbm = machine("m3.medium", "");
        let mut cm = machine("m3.medium", "i-2");
        cm.disk_size = 64;

        dbm.disk_size = 0;
        assert_eq!(phase1_score(&dbm, &cm), 1);

        dbm.disk_size = 32;
        assert_eq!(phase1_score(&dbm, &cm), -1);
    }

    #[test]
    fn test_phase2_role_compatibility() {
        let mut sm = machine("m3.medium", "");
        sm.role = Role::Worker;

        let mut dbm = machine("m3.medium", "i-1");
        dbm.role = Role::Master;
        assert_eq!(phase2_score(&sm, &dbm), -1);

        dbm.role = Role::None;
        assert!(phase2_score(&sm, &dbm) >= 0);
    }

    #[test]
    fn test_phase2_prefers_matching_role_then_floating_ip() {
        let mut sm = machine("m3.medium", "");
        sm.role = Role::Worker;
        sm.floating_ip = "9.9.9.9".into();

        let mut reported = machine("m3.medium", "i-1");
        reported.role = Role::Worker;

        let mut desired_only = machine("m3.medium", "i-2");
        desired_only.desired_role = Role::Worker;

        let mut with_ip = machine("m3.medium", "i-3");
        with_ip.floating_ip = "9.9.9.9".into();

        let blank = machine("m3.medium", "i-4");

        let s_reported = phase2_score(&sm, &reported);
        let s_desired = phase2_score(&sm, &desired_only);
        let s_ip = phase2_score(&sm, &with_ip);
        let s_blank = phase2_score(&sm, &blank);

        assert!(s_reported < s_desired);
        assert!(s_desired < s_ip);
        assert!(s_ip < s_blank);
    }
}
