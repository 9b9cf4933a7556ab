//! Minion-side scheduling.
//!
//! This crate runs on every cluster machine. Masters assign containers
//! to workers and hand out cluster addresses; workers converge the
//! Docker daemon on their slice of the container table and keep the
//! packet-forwarding rules in step.
//!
//! ## Architecture
//!
//! ```text
//! run(ctx)
//! ├── network plugin bootstrap     (one-shot; failure is fatal)
//! └── tick/trigger loop
//!     ├── master: sync image digests, place containers, allocate IPs
//!     └── worker: list Docker → join → kill/boot → replace flows
//! ```
//!
//! The Docker daemon and the forwarding backend are collaborators
//! behind the [`docker::DockerClient`] and [`flow::FlowTable`] traits.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::sync::watch;

use tessera_db::{Conn, Role, Table};

pub mod docker;
pub mod flow;
pub mod ipdef;
pub mod scheduler;

pub use docker::{DockerClient, DockerContainer, FakeDocker, RunOptions};
pub use flow::{FlowTable, ForwardingRule, RecordingFlowTable};

/// Handles to everything the minion-side loops touch.
#[derive(Clone)]
pub struct Context {
    pub conn: Conn,
    pub docker: Arc<dyn DockerClient>,
    pub flows: Arc<dyn FlowTable>,
}

/// Run the scheduler until `shutdown` flips.
///
/// The one-shot network plugin bootstrap is the only fatal failure in
/// the system: without the plugin's base flows nothing the scheduler
/// installs can carry traffic.
pub async fn run(ctx: Context, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    ctx.docker
        .configure_network(docker::NETWORK_NAME)
        .await
        .context("configure network plugin")?;

    let mut trigger = ctx.conn.trigger_tick(
        60,
        &[
            Table::Minion,
            Table::Container,
            Table::Placement,
            Table::Etcd,
            Table::Image,
        ],
    );

    loop {
        tokio::select! {
            _ = trigger.recv() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }

        let Some(minion) = ctx.conn.minion_self() else {
            continue;
        };
        match minion.role {
            Role::Worker => scheduler::run_worker(&ctx, &minion.private_ip).await,
            Role::Master => scheduler::run_master(&ctx),
            Role::None => {}
        }
    }
}
