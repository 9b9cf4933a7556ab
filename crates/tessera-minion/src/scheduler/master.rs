//! Master-side placement: match unassigned containers to workers under
//! the placement constraints, and hand out cluster addresses.
//!
//! The contract is simple: after a pass, every container that can be
//! satisfied has a non-empty `minion` and `ip`. Assignment is least
//! loaded first with the worker's private IP as the tie-break, so runs
//! are deterministic.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use tessera_db::{Container, Image, Minion, Placement, Role, Table, View, IMAGE_BUILT};

use crate::ipdef::{self, GATEWAY_IP};
use crate::Context;

/// One master pass, in a single transaction.
pub fn run_master(ctx: &Context) {
    ctx.conn.txn(
        &[
            Table::Container,
            Table::Minion,
            Table::Placement,
            Table::Etcd,
            Table::Image,
        ],
        |view| {
            sync_image_ids(view);
            place_containers(view);
            allocate_ips(view);
        },
    );
}

/// Containers built from a cluster Dockerfile pick up the built digest
/// so workers can compare by digest rather than by name.
fn sync_image_ids(view: &mut View<'_>) {
    let images = view
        .select_from::<Image>(|img| img.status == IMAGE_BUILT && !img.docker_id.is_empty());

    for mut dbc in view.select_from::<Container>(|c| !c.dockerfile.is_empty()) {
        let Some(image) = images
            .iter()
            .find(|img| img.name == dbc.image && img.dockerfile == dbc.dockerfile)
        else {
            continue;
        };
        if dbc.image_id != image.docker_id {
            dbc.image_id = image.docker_id.clone();
            view.commit(dbc);
        }
    }
}

fn place_containers(view: &mut View<'_>) {
    let workers =
        view.select_from::<Minion>(|m| m.role == Role::Worker && !m.private_ip.is_empty());
    let placements = view.select_from::<Placement>(|_| true);
    let worker_ips: HashSet<&str> = workers.iter().map(|w| w.private_ip.as_str()).collect();

    // Unassign containers whose worker left the cluster.
    for mut dbc in view.select_from::<Container>(|c| !c.minion.is_empty()) {
        if !worker_ips.contains(dbc.minion.as_str()) {
            dbc.minion.clear();
            view.commit(dbc);
        }
    }

    let mut load: BTreeMap<String, usize> = workers
        .iter()
        .map(|w| (w.private_ip.clone(), 0))
        .collect();
    let mut hostnames_on: BTreeMap<String, HashSet<String>> = BTreeMap::new();
    for dbc in view.select_from::<Container>(|c| !c.minion.is_empty()) {
        *load.entry(dbc.minion.clone()).or_default() += 1;
        if !dbc.hostname.is_empty() {
            hostnames_on
                .entry(dbc.minion.clone())
                .or_default()
                .insert(dbc.hostname);
        }
    }

    let mut unassigned = view.select_from::<Container>(|c| c.minion.is_empty());
    unassigned.sort_by_key(|c| c.id);

    for mut dbc in unassigned {
        let choice = workers
            .iter()
            .filter(|w| placement_ok(&dbc, w, &placements, &hostnames_on))
            .min_by_key(|w| {
                (
                    load.get(&w.private_ip).copied().unwrap_or(0),
                    w.private_ip.clone(),
                )
            });

        let Some(worker) = choice else {
            debug!(hostname = %dbc.hostname, image = %dbc.image, "No valid placement");
            continue;
        };

        dbc.minion = worker.private_ip.clone();
        *load.entry(dbc.minion.clone()).or_default() += 1;
        if !dbc.hostname.is_empty() {
            hostnames_on
                .entry(dbc.minion.clone())
                .or_default()
                .insert(dbc.hostname.clone());
        }
        view.commit(dbc);
    }
}

fn placement_ok(
    dbc: &Container,
    worker: &Minion,
    placements: &[Placement],
    hostnames_on: &BTreeMap<String, HashSet<String>>,
) -> bool {
    let colocated = hostnames_on.get(&worker.private_ip);
    let colocated_with = |hostname: &str| colocated.is_some_and(|set| set.contains(hostname));

    for p in placements {
        if !dbc.hostname.is_empty() && p.target_container == dbc.hostname {
            if !p.provider.is_empty() && p.provider != worker.provider {
                return false;
            }
            if !p.size.is_empty() && p.size != worker.size {
                return false;
            }
            if !p.region.is_empty() && p.region != worker.region {
                return false;
            }
            if !p.floating_ip.is_empty() && p.floating_ip != worker.floating_ip {
                return false;
            }
            if p.exclusive && !p.other_container.is_empty() && colocated_with(&p.other_container) {
                return false;
            }
        }

        // Exclusivity cuts both ways.
        if p.exclusive
            && !dbc.hostname.is_empty()
            && p.other_container == dbc.hostname
            && colocated_with(&p.target_container)
        {
            return false;
        }
    }
    true
}

fn allocate_ips(view: &mut View<'_>) {
    let mut used: HashSet<String> = view
        .select_from::<Container>(|c| !c.ip.is_empty())
        .into_iter()
        .map(|c| c.ip)
        .collect();
    used.insert(GATEWAY_IP.to_string());

    let mut pending = view.select_from::<Container>(|c| c.ip.is_empty());
    pending.sort_by_key(|c| c.id);

    for mut dbc in pending {
        let seed = if !dbc.hostname.is_empty() {
            dbc.hostname.clone()
        } else if !dbc.blueprint_id.is_empty() {
            dbc.blueprint_id.clone()
        } else {
            format!("container-{}", dbc.id)
        };

        match ipdef::allocate_ip(&seed, &used) {
            Some(ip) => {
                used.insert(ip.clone());
                dbc.ip = ip;
                view.commit(dbc);
            }
            None => warn!("Cluster subnet exhausted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::FakeDocker;
    use crate::flow::RecordingFlowTable;
    use tessera_db as db;

    fn test_ctx(conn: db::Conn) -> Context {
        Context {
            conn,
            docker: FakeDocker::new(),
            flows: RecordingFlowTable::new(),
        }
    }

    fn add_worker(conn: &db::Conn, private_ip: &str, size: &str) {
        conn.txn(&[Table::Minion], |view| {
            let mut w: Minion = view.insert();
            w.role = Role::Worker;
            w.private_ip = private_ip.into();
            w.provider = "Amazon".into();
            w.size = size.into();
            w.region = "us-west-1".into();
            view.commit(w);
        });
    }

    fn add_container(conn: &db::Conn, hostname: &str) -> u64 {
        conn.txn(&[Table::Container], |view| {
            let mut c: Container = view.insert();
            c.image = "alpine".into();
            c.hostname = hostname.into();
            view.commit(c.clone());
            c.id
        })
    }

    #[test]
    fn test_every_container_gets_minion_and_ip() {
        let conn = db::new();
        add_worker(&conn, "10.0.1.1", "m3.medium");
        add_worker(&conn, "10.0.1.2", "m3.medium");
        for i in 0..4 {
            add_container(&conn, &format!("svc-{}", i));
        }

        run_master(&test_ctx(conn.clone()));

        let containers = conn.select_from::<Container>(|_| true);
        assert!(containers.iter().all(|c| !c.minion.is_empty()));
        assert!(containers.iter().all(|c| !c.ip.is_empty()));

        // Least-loaded assignment spreads evenly.
        let on_first = containers.iter().filter(|c| c.minion == "10.0.1.1").count();
        assert_eq!(on_first, 2);
    }

    #[test]
    fn test_ips_unique_and_stable() {
        let conn = db::new();
        add_worker(&conn, "10.0.1.1", "m3.medium");
        add_container(&conn, "web");
        add_container(&conn, "db");

        let ctx = test_ctx(conn.clone());
        run_master(&ctx);
        let first: BTreeMap<String, String> = conn
            .select_from::<Container>(|_| true)
            .into_iter()
            .map(|c| (c.hostname.clone(), c.ip))
            .collect();
        assert_eq!(first.len(), 2);
        assert_ne!(first["web"], first["db"]);

        // A second pass changes nothing.
        run_master(&ctx);
        let second: BTreeMap<String, String> = conn
            .select_from::<Container>(|_| true)
            .into_iter()
            .map(|c| (c.hostname.clone(), c.ip))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_exclusive_placement_respected() {
        let conn = db::new();
        add_worker(&conn, "10.0.1.1", "m3.medium");
        add_container(&conn, "web");
        add_container(&conn, "db");
        conn.txn(&[Table::Placement], |view| {
            let mut p: Placement = view.insert();
            p.target_container = "web".into();
            p.exclusive = true;
            p.other_container = "db".into();
            view.commit(p);
        });

        run_master(&test_ctx(conn.clone()));

        // Only one of the two fits on the single worker.
        let placed: Vec<Container> = conn.select_from(|c: &Container| !c.minion.is_empty());
        assert_eq!(placed.len(), 1);

        // A second worker resolves the conflict.
        add_worker(&conn, "10.0.1.2", "m3.medium");
        run_master(&test_ctx(conn.clone()));
        let placed: Vec<Container> = conn.select_from(|c: &Container| !c.minion.is_empty());
        assert_eq!(placed.len(), 2);
        assert_ne!(placed[0].minion, placed[1].minion);
    }

    #[test]
    fn test_machine_attribute_constraints() {
        let conn = db::new();
        add_worker(&conn, "10.0.1.1", "t2.micro");
        add_container(&conn, "web");
        conn.txn(&[Table::Placement], |view| {
            let mut p: Placement = view.insert();
            p.target_container = "web".into();
            p.size = "m4.large".into();
            view.commit(p);
        });

        run_master(&test_ctx(conn.clone()));
        assert!(conn.select_from::<Container>(|_| true)[0].minion.is_empty());

        add_worker(&conn, "10.0.1.2", "m4.large");
        run_master(&test_ctx(conn.clone()));
        assert_eq!(conn.select_from::<Container>(|_| true)[0].minion, "10.0.1.2");
    }

    #[test]
    fn test_dead_worker_unassigns() {
        let conn = db::new();
        add_worker(&conn, "10.0.1.1", "m3.medium");
        add_container(&conn, "web");
        run_master(&test_ctx(conn.clone()));
        assert_eq!(conn.select_from::<Container>(|_| true)[0].minion, "10.0.1.1");

        // The worker disappears from the cluster.
        conn.txn(&[Table::Minion], |view| {
            for w in view.select_from::<Minion>(|_| true) {
                view.remove(&w);
            }
        });
        run_master(&test_ctx(conn.clone()));
        assert!(conn.select_from::<Container>(|_| true)[0].minion.is_empty());
    }

    #[test]
    fn test_built_image_digest_synced() {
        let conn = db::new();
        conn.txn(&[Table::Container, Table::Image], |view| {
            let mut c: Container = view.insert();
            c.image = "custom".into();
            c.dockerfile = "FROM alpine".into();
            view.commit(c);

            let mut img: Image = view.insert();
            img.name = "custom".into();
            img.dockerfile = "FROM alpine".into();
            img.docker_id = "sha256:abc".into();
            img.status = IMAGE_BUILT.into();
            view.commit(img);
        });

        run_master(&test_ctx(conn.clone()));
        assert_eq!(
            conn.select_from::<Container>(|_| true)[0].image_id,
            "sha256:abc"
        );
    }
}
