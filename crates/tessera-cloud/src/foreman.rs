//! The foreman: one loop per booted machine, driving its management
//! channel.
//!
//! A supervisor watches the machine table and spawns a foreman for each
//! row with both IPs populated; the foreman dials the minion, reads its
//! self-reported role, and pushes the configuration derived from the
//! blueprint. Foremen never write the machine table themselves: every
//! role/status write is queued onto a coalescing channel and applied in
//! batches, which bounds the store to a handful of write transactions
//! per second regardless of fleet size.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tonic::transport::Endpoint;
use tracing::debug;

use tessera_counter::Counter;
use tessera_db::{Machine, Role, Status, Table};
use tessera_proto::minion::v1::{GetMinionConfigRequest, MinionClient, MinionConfig};

use crate::context::Context;

static C: Counter = tessera_counter::new("Foreman");

/// The port minions listen on for management connections.
pub const MINION_PORT: u16 = 9999;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the update applier waits for the rest of a burst before
/// writing.
const COALESCE_WINDOW: Duration = Duration::from_millis(250);

/// A live management channel to one minion.
#[async_trait]
pub trait MinionChannel: Send + Sync {
    /// Fetch the minion's self-reported role and current configuration.
    async fn get_minion(&mut self) -> Result<MinionConfig>;

    /// Push the desired configuration.
    async fn set_minion(&mut self, config: MinionConfig) -> Result<()>;
}

/// Opens management channels. Injected so tests can script minions.
#[async_trait]
pub trait MinionDialer: Send + Sync {
    async fn dial(&self, ip: &str) -> Result<Box<dyn MinionChannel>>;
}

/// Dials minions over gRPC on [`MINION_PORT`].
pub struct GrpcDialer {
    pub port: u16,
}

impl Default for GrpcDialer {
    fn default() -> GrpcDialer {
        GrpcDialer { port: MINION_PORT }
    }
}

#[async_trait]
impl MinionDialer for GrpcDialer {
    async fn dial(&self, ip: &str) -> Result<Box<dyn MinionChannel>> {
        C.inc("New Minion Client");
        let endpoint = Endpoint::from_shared(format!("http://{}:{}", ip, self.port))?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(RPC_TIMEOUT);
        let channel = match endpoint.connect().await {
            Ok(channel) => channel,
            Err(e) => {
                C.inc("New Minion Client Error");
                return Err(e.into());
            }
        };
        Ok(Box::new(GrpcChannel {
            client: MinionClient::new(channel),
        }))
    }
}

struct GrpcChannel {
    client: MinionClient<tonic::transport::Channel>,
}

#[async_trait]
impl MinionChannel for GrpcChannel {
    async fn get_minion(&mut self) -> Result<MinionConfig> {
        C.inc("Get Minion");
        match self.client.get_minion_config(GetMinionConfigRequest {}).await {
            Ok(reply) => Ok(reply.into_inner()),
            Err(e) => {
                C.inc("Get Minion Error");
                Err(e.into())
            }
        }
    }

    async fn set_minion(&mut self, config: MinionConfig) -> Result<()> {
        C.inc("Set Minion");
        match self.client.set_minion_config(config).await {
            Ok(_) => Ok(()),
            Err(e) => {
                C.inc("Set Minion Error");
                Err(e.into())
            }
        }
    }
}

/// Map the wire role onto the table's role.
pub fn role_from_proto(role: i32) -> Role {
    use tessera_proto::minion::v1::Role as ProtoRole;
    match ProtoRole::try_from(role) {
        Ok(ProtoRole::Master) => Role::Master,
        Ok(ProtoRole::Worker) => Role::Worker,
        _ => Role::None,
    }
}

/// Map the table's role onto the wire role.
pub fn role_to_proto(role: Role) -> i32 {
    use tessera_proto::minion::v1::Role as ProtoRole;
    let proto = match role {
        Role::None => ProtoRole::None,
        Role::Master => ProtoRole::Master,
        Role::Worker => ProtoRole::Worker,
    };
    proto as i32
}

/// One queued role/status write, keyed by the machine's public IP.
#[derive(Debug, Clone, Default)]
pub struct Update {
    pub public_ip: String,
    pub role: Option<Role>,
    pub status: Option<Status>,
}

/// Spawn and reap one foreman per connectable machine until `shutdown`
/// flips.
pub async fn run(ctx: Context, mut shutdown: watch::Receiver<bool>) {
    let (update_tx, update_rx) = mpsc::channel(32);
    tokio::spawn(apply_updates(ctx.clone(), update_rx));

    let mut trigger = ctx.conn.trigger_tick(60, &[Table::Machine]);
    let (exit_tx, mut exit_rx) = mpsc::channel::<String>(32);
    let mut running: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            Some(ip) = exit_rx.recv() => { running.remove(&ip); }
            _ = trigger.recv() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        while let Ok(ip) = exit_rx.try_recv() {
            running.remove(&ip);
        }

        let dbms = ctx.conn.select_from::<Machine>(|m| {
            !m.public_ip.is_empty() && !m.private_ip.is_empty() && m.status != Status::Stopping
        });
        for dbm in dbms {
            if running.insert(dbm.public_ip.clone()) {
                let foreman = Foreman::new(ctx.clone(), dbm.public_ip.clone(), update_tx.clone());
                let exit_tx = exit_tx.clone();
                let shutdown = shutdown.clone();
                let ip = dbm.public_ip;
                tokio::spawn(async move {
                    foreman.run(shutdown).await;
                    let _ = exit_tx.send(ip).await;
                });
            }
        }
    }
}

/// Drain queued foreman writes and apply each batch in one transaction.
pub async fn apply_updates(ctx: Context, mut rx: mpsc::Receiver<Update>) {
    while let Some(first) = rx.recv().await {
        let mut pending: HashMap<String, Update> = HashMap::new();
        merge(&mut pending, first);

        // Let the rest of a burst arrive before writing.
        tokio::time::sleep(COALESCE_WINDOW).await;
        while let Ok(update) = rx.try_recv() {
            merge(&mut pending, update);
        }

        let now = ctx.clock.now();
        C.inc("Apply Updates");
        ctx.conn.txn(&[Table::Machine], |view| {
            let dbms = view
                .select_from::<Machine>(|m| !m.public_ip.is_empty() && m.status != Status::Stopping);
            for mut dbm in dbms {
                let Some(update) = pending.get(&dbm.public_ip) else {
                    continue;
                };
                if let Some(status) = update.status {
                    dbm.set_status(status, now);
                }
                if let Some(role) = update.role {
                    dbm.role = role;
                }
                view.commit(dbm);
            }
        });
    }
}

fn merge(pending: &mut HashMap<String, Update>, update: Update) {
    let entry = pending.entry(update.public_ip.clone()).or_default();
    entry.public_ip = update.public_ip;
    if update.role.is_some() {
        entry.role = update.role;
    }
    if update.status.is_some() {
        entry.status = update.status;
    }
}

/// The control loop for a single machine's management channel.
pub struct Foreman {
    ctx: Context,
    ip: String,
    status: Status,
    client: Option<Box<dyn MinionChannel>>,
    updates: mpsc::Sender<Update>,
}

impl Foreman {
    pub fn new(ctx: Context, ip: String, updates: mpsc::Sender<Update>) -> Foreman {
        Foreman {
            ctx,
            ip,
            status: Status::Unset,
            client: None,
            updates,
        }
    }

    /// Drive the connection state machine until the machine row vanishes
    /// or turns Stopping. A fast tick keeps reconnect attempts at five
    /// seconds while the channel is down.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!(ip = %self.ip, "Foreman start");
        let mut trigger = self
            .ctx
            .conn
            .trigger_tick(60, &[Table::Blueprint, Table::Machine]);
        let mut fast = tokio::time::interval(Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = trigger.recv() => {}
                _ = fast.tick() => {
                    if self.status == Status::Connected {
                        continue;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }

            if self.run_once().await.is_err() {
                break;
            }
        }
        debug!(ip = %self.ip, "Foreman exit");
    }

    /// One pass of the state machine. An error means the machine is
    /// gone and this foreman should exit.
    pub async fn run_once(&mut self) -> Result<()> {
        let (dbms, bp) = self
            .ctx
            .conn
            .txn(&[Table::Blueprint, Table::Machine], |view| {
                (
                    view.select_from::<Machine>(|m| m.status != Status::Stopping),
                    view.get_blueprint(),
                )
            });

        let mut target = None;
        let mut etcd_members = Vec::new();
        for m in &dbms {
            if m.public_ip == self.ip {
                target = Some(m.clone());
            }
            if m.role == Role::Master && !m.private_ip.is_empty() {
                etcd_members.push(m.private_ip.clone());
            }
        }
        etcd_members.sort();
        let dbm = target.context("machine gone")?;

        self.status = dbm.status;

        if self.client.is_none() {
            // A reconnect keeps its own label; a first attempt shows
            // Connecting.
            if self.status != Status::Reconnecting {
                self.set_status(Status::Connecting).await;
            }
            match self.ctx.dialer.dial(&self.ip).await {
                Ok(client) => self.client = Some(client),
                Err(e) => {
                    debug!(ip = %self.ip, error = %e, "Failed to dial minion");
                    return Ok(());
                }
            }
        }

        let reported = match self.client.as_mut() {
            Some(client) => client.get_minion().await,
            None => return Ok(()),
        };
        let reported = match reported {
            Ok(config) => config,
            Err(e) => {
                debug!(ip = %self.ip, error = %e, "Failed to get minion config");
                self.client = None;
                self.set_status(Status::Reconnecting).await;
                return Ok(());
            }
        };

        self.set_status(Status::Connected).await;

        let role = role_from_proto(reported.role);
        if role != Role::None && role != dbm.role {
            self.set_role(role).await;
        }

        let desired = MinionConfig {
            // The role is the minion's to report, not ours to assign.
            role: reported.role,
            floating_ip: dbm.floating_ip.clone(),
            private_ip: dbm.private_ip.clone(),
            blueprint: bp.map(|bp| bp.spec.to_json()).unwrap_or_default(),
            provider: dbm.provider.to_string(),
            size: dbm.size.clone(),
            region: dbm.region.clone(),
            etcd_members,
            authorized_keys: dbm.ssh_keys.clone(),
        };

        if desired == reported {
            return Ok(());
        }

        let pushed = match self.client.as_mut() {
            Some(client) => client.set_minion(desired).await,
            None => return Ok(()),
        };
        if let Err(e) = pushed {
            debug!(ip = %self.ip, error = %e, "Failed to set minion config");
            self.client = None;
            self.set_status(Status::Reconnecting).await;
        }
        Ok(())
    }

    async fn set_status(&mut self, status: Status) {
        if self.status != status {
            self.status = status;
            let _ = self
                .updates
                .send(Update {
                    public_ip: self.ip.clone(),
                    role: None,
                    status: Some(status),
                })
                .await;
        }
    }

    async fn set_role(&self, role: Role) {
        let _ = self
            .updates
            .send(Update {
                public_ip: self.ip.clone(),
                role: Some(role),
                status: None,
            })
            .await;
    }
}

/// A scriptable minion endpoint for tests: acts as both the dialer and
/// the channel it hands out.
#[derive(Clone, Default)]
pub struct FakeMinion {
    state: Arc<Mutex<FakeMinionState>>,
}

#[derive(Default)]
struct FakeMinionState {
    reported: MinionConfig,
    refuse_dials: bool,
    fail_rpcs: bool,
    pushed: Vec<MinionConfig>,
}

impl FakeMinion {
    pub fn new() -> FakeMinion {
        FakeMinion::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeMinionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the configuration (and role) the minion reports.
    pub fn set_reported(&self, config: MinionConfig) {
        self.state().reported = config;
    }

    pub fn reported(&self) -> MinionConfig {
        self.state().reported.clone()
    }

    pub fn refuse_dials(&self, refuse: bool) {
        self.state().refuse_dials = refuse;
    }

    pub fn fail_rpcs(&self, fail: bool) {
        self.state().fail_rpcs = fail;
    }

    /// Configurations pushed via `set_minion`, oldest first.
    pub fn pushed(&self) -> Vec<MinionConfig> {
        self.state().pushed.clone()
    }
}

#[async_trait]
impl MinionDialer for FakeMinion {
    async fn dial(&self, _ip: &str) -> Result<Box<dyn MinionChannel>> {
        if self.state().refuse_dials {
            bail!("connection refused");
        }
        Ok(Box::new(FakeMinionChannel {
            minion: self.clone(),
        }))
    }
}

struct FakeMinionChannel {
    minion: FakeMinion,
}

#[async_trait]
impl MinionChannel for FakeMinionChannel {
    async fn get_minion(&mut self) -> Result<MinionConfig> {
        let state = self.minion.state();
        if state.fail_rpcs {
            bail!("rpc failed");
        }
        Ok(state.reported.clone())
    }

    async fn set_minion(&mut self, config: MinionConfig) -> Result<()> {
        let mut state = self.minion.state();
        if state.fail_rpcs {
            bail!("rpc failed");
        }
        state.pushed.push(config.clone());
        // The minion adopts what it was given, but its role stays its
        // own to report.
        let role = state.reported.role;
        state.reported = config;
        state.reported.role = role;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_mapping_round_trip() {
        for role in [Role::None, Role::Master, Role::Worker] {
            assert_eq!(role_from_proto(role_to_proto(role)), role);
        }
        // Unknown wire values degrade to None.
        assert_eq!(role_from_proto(42), Role::None);
    }

    #[test]
    fn test_merge_keeps_both_fields() {
        let mut pending = HashMap::new();
        merge(
            &mut pending,
            Update {
                public_ip: "1.2.3.4".into(),
                role: None,
                status: Some(Status::Connected),
            },
        );
        merge(
            &mut pending,
            Update {
                public_ip: "1.2.3.4".into(),
                role: Some(Role::Worker),
                status: None,
            },
        );

        let update = &pending["1.2.3.4"];
        assert_eq!(update.status, Some(Status::Connected));
        assert_eq!(update.role, Some(Role::Worker));
    }

    #[test]
    fn test_merge_later_status_wins() {
        let mut pending = HashMap::new();
        for status in [Status::Connecting, Status::Connected] {
            merge(
                &mut pending,
                Update {
                    public_ip: "1.2.3.4".into(),
                    role: None,
                    status: Some(status),
                },
            );
        }
        assert_eq!(pending["1.2.3.4"].status, Some(Status::Connected));
    }
}
