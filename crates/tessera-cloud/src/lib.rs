//! Cloud-side control plane.
//!
//! This crate owns the daemon's half of the orchestrator: accepting
//! deployed blueprints, reconciling each (provider, region) pair
//! against the desired machine set, and running a foreman per booted
//! machine to exchange configuration with its minion.
//!
//! ## Architecture
//!
//! ```text
//! run(ctx)
//! ├── namespace watcher            (respawns clouds on namespace change)
//! │   └── Cloud(provider, region)  (list → join → boot/stop/IPs/ACLs)
//! └── foreman::run
//!     ├── update applier           (coalesced machine-table writes)
//!     └── Foreman(machine)         (dial → get config → push config)
//! ```
//!
//! Everything external arrives through [`Context`]: the store handle,
//! clock, local-IP source, provider factory, and minion dialer.

use tokio::sync::watch;
use tracing::debug;

use tessera_db::{self as db, Conn, ProviderName, Table};

pub mod api;
pub mod context;
pub mod foreman;
pub mod provider;
pub mod reconciler;
pub mod sizes;

pub use context::{Clock, Context, FixedClock, IpSource, StaticIpSource, SystemClock};
pub use provider::{FakeProvider, FakeProviderFactory, Provider, ProviderFactory};
pub use reconciler::Cloud;

/// Write `blueprint` into the store. Replacing the namespace removes
/// every machine row in the same transaction, so stale machines never
/// outlive their cluster identity.
pub fn deploy(conn: &Conn, blueprint: tessera_blueprint::Blueprint) {
    conn.txn(&[Table::Blueprint, Table::Machine], |view| {
        let mut row = match view.get_blueprint() {
            Some(row) => row,
            None => view.insert::<db::Blueprint>(),
        };

        if row.namespace != blueprint.namespace {
            debug!(from = %row.namespace, to = %blueprint.namespace, "Namespace change");
            for m in view.select_from::<db::Machine>(|_| true) {
                view.remove(&m);
            }
            row.namespace = blueprint.namespace.clone();
        }

        row.admin_acl = blueprint.admin_acl.clone();
        row.spec = blueprint;
        view.commit(row);
    });
}

/// Drive every (provider, region) pair toward the deployed blueprint
/// until `shutdown` flips.
///
/// A namespace change cancels the previous generation of cloud loops
/// and spawns a fresh one; the foreman supervisor runs for the lifetime
/// of the daemon.
pub async fn run(ctx: Context, shutdown: watch::Receiver<bool>) {
    tokio::spawn(foreman::run(ctx.clone(), shutdown.clone()));

    let mut shutdown = shutdown;
    let mut trigger = ctx
        .conn
        .trigger_tick(60, &[Table::Blueprint, Table::Machine]);
    let mut namespace = String::new();
    let mut stop_tx: Option<watch::Sender<bool>> = None;

    loop {
        tokio::select! {
            _ = trigger.recv() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    if let Some(stop) = stop_tx.take() {
                        let _ = stop.send(true);
                    }
                    return;
                }
            }
        }

        let new_namespace = ctx.conn.get_blueprint_namespace();
        if new_namespace == namespace {
            continue;
        }
        debug!(from = %namespace, to = %new_namespace, "Namespace change");
        namespace = new_namespace;

        if let Some(stop) = stop_tx.take() {
            let _ = stop.send(true);
        }
        if !namespace.is_empty() {
            let (tx, rx) = watch::channel(false);
            make_clouds(&ctx, &namespace, rx);
            stop_tx = Some(tx);
        }
    }
}

fn make_clouds(ctx: &Context, namespace: &str, stop: watch::Receiver<bool>) {
    for provider in ProviderName::ALL {
        for region in ctx.providers.regions(provider) {
            match Cloud::new(ctx.clone(), provider, &region, namespace) {
                Ok(cloud) => {
                    tokio::spawn(cloud.run(stop.clone()));
                }
                Err(e) => {
                    debug!(provider = %provider, region = %region, error = %e,
                        "Failed to create cloud provider");
                }
            }
        }
    }
}
