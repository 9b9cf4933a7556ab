//! The worker-side scheduling loop.
//!
//! Reconciles the container table rows assigned to this worker against
//! the containers Docker actually has: matched pairs absorb the
//! Docker-reported fields, leftovers are killed or launched. A failed
//! launch or removal is logged and retried on the next tick; the loop
//! itself never aborts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use tessera_counter::Counter;
use tessera_db::{Connection, Container, Table};
use tessera_join::join;

use crate::docker::{
    DockerContainer, RunOptions, DNS_SEARCH_DOMAIN, FILES_KEY, LABEL_KEY, LABEL_PAIR, LABEL_VALUE,
    NETWORK_NAME,
};
use crate::flow::forwarding_rules;
use crate::ipdef::GATEWAY_IP;
use crate::Context;

static C: Counter = tessera_counter::new("Scheduler");

/// Bound on in-flight Docker operations.
const CONCURRENCY_LIMIT: usize = 32;

/// One worker pass: sync containers (up to two rounds, so a kill and
/// its replacement land in the same tick), then refresh the forwarding
/// rules.
pub async fn run_worker(ctx: &Context, my_ip: &str) {
    if my_ip.is_empty() {
        return;
    }

    let filters = BTreeMap::from([("label".to_string(), vec![LABEL_PAIR.to_string()])]);

    for _ in 0..2 {
        let dkcs = match ctx.docker.list(&filters).await {
            Ok(dkcs) => dkcs,
            Err(e) => {
                C.inc("List Error");
                warn!(error = %e, "Failed to list docker containers");
                return;
            }
        };

        let assigned_to_me = my_ip.to_string();
        let (to_boot, to_kill) = ctx.conn.txn(&[Table::Container], |view| {
            let dbcs = view
                .select_from::<Container>(|dbc| !dbc.ip.is_empty() && dbc.minion == assigned_to_me);
            let (changed, to_boot, to_kill) = sync_worker(dbcs, dkcs);
            for dbc in changed {
                view.commit(dbc);
            }
            (to_boot, to_kill)
        });

        if to_boot.is_empty() && to_kill.is_empty() {
            break;
        }

        let start = Instant::now();
        kill_containers(ctx, to_kill).await;
        boot_containers(ctx, to_boot).await;
        info!(elapsed = ?start.elapsed(), "Scheduler started/stopped containers");
    }

    update_flows(ctx, my_ip);
}

/// Pair table rows with live containers. Matched rows pick up the
/// Docker-reported fields; the leftovers are this pass's work.
fn sync_worker(
    dbcs: Vec<Container>,
    dkcs: Vec<DockerContainer>,
) -> (Vec<Container>, Vec<Container>, Vec<DockerContainer>) {
    let joined = join(dbcs, dkcs, sync_score);

    let mut changed = Vec::new();
    for (mut dbc, dkc) in joined.pairs {
        dbc.docker_id = dkc.id;
        dbc.endpoint_id = dkc.eid;
        dbc.status = dkc.status;
        dbc.created = dkc.created;
        changed.push(dbc);
    }

    (changed, joined.unmatched_left, joined.unmatched_right)
}

fn sync_score(dbc: &Container, dkc: &DockerContainer) -> i32 {
    if dbc.ip != dkc.ip {
        return -1;
    }
    let label_hash = dkc.labels.get(FILES_KEY).map(String::as_str).unwrap_or("");
    if files_hash(&dbc.filepath_to_content) != label_hash {
        return -1;
    }

    // Compare digests when we know one, names otherwise.
    let compare_ids = !dbc.image_id.is_empty();
    let names_match = dkc.image == dbc.image;
    let ids_match = dkc.image_id == dbc.image_id;
    if (compare_ids && !ids_match) || (!compare_ids && !names_match) {
        return -1;
    }

    for (key, value) in &dbc.env {
        if dkc.env.get(key) != Some(value) {
            return -1;
        }
    }

    // Depending on the image, the table's command is either the full
    // command or just its arguments. Accept both.
    if !dbc.command.is_empty() {
        let args_only = dbc.command == dkc.args;
        let with_path = dbc.command.len() == dkc.args.len() + 1
            && dbc.command[0] == dkc.path
            && dbc.command[1..] == dkc.args[..];
        if !args_only && !with_path {
            return -1;
        }
    }

    0
}

/// SHA-1 over the sorted file map. Carried as a label so a content
/// change forces a container replacement.
pub(crate) fn files_hash(files: &BTreeMap<String, String>) -> String {
    use sha1::{Digest, Sha1};

    let mut hasher = Sha1::new();
    for (path, content) in files {
        hasher.update(path.as_bytes());
        hasher.update(b"=");
        hasher.update(content.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

async fn boot_containers(ctx: &Context, dbcs: Vec<Container>) {
    let semaphore = Arc::new(Semaphore::new(CONCURRENCY_LIMIT));
    let mut handles = Vec::with_capacity(dbcs.len());
    for dbc in dbcs {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            return;
        };
        let docker = ctx.docker.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            info!(image = %dbc.image, hostname = %dbc.hostname, ip = %dbc.ip, "Start container");

            let mut labels = BTreeMap::new();
            labels.insert(LABEL_KEY.to_string(), LABEL_VALUE.to_string());
            labels.insert(FILES_KEY.to_string(), files_hash(&dbc.filepath_to_content));

            C.inc("Run");
            let opts = RunOptions {
                image: dbc.image.clone(),
                args: dbc.command.clone(),
                env: dbc.env.clone(),
                filepath_to_content: dbc.filepath_to_content.clone(),
                labels,
                ip: dbc.ip.clone(),
                network_mode: NETWORK_NAME.to_string(),
                dns: vec![GATEWAY_IP.to_string()],
                dns_search: vec![DNS_SEARCH_DOMAIN.to_string()],
            };
            if let Err(e) = docker.run(opts).await {
                C.inc("Run Error");
                warn!(image = %dbc.image, error = %e, "Failed to run container");
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn kill_containers(ctx: &Context, dkcs: Vec<DockerContainer>) {
    let semaphore = Arc::new(Semaphore::new(CONCURRENCY_LIMIT));
    let mut handles = Vec::with_capacity(dkcs.len());
    for dkc in dkcs {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            return;
        };
        let docker = ctx.docker.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            info!(id = %dkc.id, "Remove container");
            C.inc("Remove");
            if let Err(e) = docker.remove(&dkc.id).await {
                C.inc("Remove Error");
                warn!(id = %dkc.id, error = %e, "Failed to remove container");
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

/// Replace this worker's forwarding rules from the current table state.
fn update_flows(ctx: &Context, my_ip: &str) {
    let assigned_to_me = my_ip.to_string();
    let (dbcs, connections) = ctx.conn.txn(&[Table::Connection, Table::Container], |view| {
        (
            view.select_from::<Container>(|dbc| {
                !dbc.endpoint_id.is_empty() && !dbc.ip.is_empty() && dbc.minion == assigned_to_me
            }),
            view.select_from::<Connection>(|_| true),
        )
    });

    let rules = forwarding_rules(&dbcs, &connections);
    if let Err(e) = ctx.flows.replace_flows(&rules) {
        warn!(error = %e, "Failed to update forwarding rules");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dbc(image: &str, ip: &str) -> Container {
        Container {
            image: image.into(),
            ip: ip.into(),
            ..Default::default()
        }
    }

    fn dkc(image: &str, ip: &str) -> DockerContainer {
        let mut c = DockerContainer {
            image: image.into(),
            ip: ip.into(),
            ..Default::default()
        };
        c.labels.insert(
            FILES_KEY.into(),
            files_hash(&BTreeMap::new()),
        );
        c
    }

    #[test]
    fn test_sync_score_matches_identical() {
        assert_eq!(sync_score(&dbc("alpine", "10.0.0.2"), &dkc("alpine", "10.0.0.2")), 0);
    }

    #[test]
    fn test_sync_score_ip_mismatch() {
        assert_eq!(sync_score(&dbc("alpine", "10.0.0.2"), &dkc("alpine", "10.0.0.3")), -1);
    }

    #[test]
    fn test_sync_score_env_mismatch() {
        let mut left = dbc("alpine", "10.0.0.2");
        left.env.insert("A".into(), "1".into());
        let mut right = dkc("alpine", "10.0.0.2");

        assert_eq!(sync_score(&left, &right), -1);

        right.env.insert("A".into(), "1".into());
        assert_eq!(sync_score(&left, &right), 0);

        // Extra Docker-side environment is tolerated.
        right.env.insert("PATH".into(), "/bin".into());
        assert_eq!(sync_score(&left, &right), 0);
    }

    #[test]
    fn test_sync_score_files_hash_mismatch() {
        let mut left = dbc("alpine", "10.0.0.2");
        left.filepath_to_content
            .insert("/etc/conf".into(), "v2".into());
        let right = dkc("alpine", "10.0.0.2");
        assert_eq!(sync_score(&left, &right), -1);
    }

    #[test]
    fn test_sync_score_image_digest_preferred() {
        let mut left = dbc("custom", "10.0.0.2");
        left.image_id = "sha256:aaa".into();

        let mut right = dkc("custom", "10.0.0.2");
        right.image_id = "sha256:bbb".into();
        assert_eq!(sync_score(&left, &right), -1);

        right.image_id = "sha256:aaa".into();
        // Digest match wins even when the name drifted.
        right.image = "custom:stale-tag".into();
        assert_eq!(sync_score(&left, &right), 0);
    }

    #[test]
    fn test_sync_score_command_forms() {
        let mut left = dbc("alpine", "10.0.0.2");
        left.command = vec!["sleep".into(), "60".into()];

        // Command equals args.
        let mut right = dkc("alpine", "10.0.0.2");
        right.args = vec!["sleep".into(), "60".into()];
        assert_eq!(sync_score(&left, &right), 0);

        // Command equals path followed by args.
        let mut right = dkc("alpine", "10.0.0.2");
        right.path = "sleep".into();
        right.args = vec!["60".into()];
        assert_eq!(sync_score(&left, &right), 0);

        // Neither form.
        let mut right = dkc("alpine", "10.0.0.2");
        right.args = vec!["sleep".into(), "90".into()];
        assert_eq!(sync_score(&left, &right), -1);

        // An empty table command accepts whatever the image runs.
        left.command.clear();
        assert_eq!(sync_score(&left, &right), 0);
    }

    #[test]
    fn test_files_hash_depends_on_content() {
        let empty = BTreeMap::new();
        let mut files = BTreeMap::new();
        files.insert("/a".to_string(), "1".to_string());

        assert_ne!(files_hash(&empty), files_hash(&files));
        assert_eq!(files_hash(&files), files_hash(&files.clone()));
    }

    #[test]
    fn test_sync_worker_absorbs_docker_fields() {
        let mut left = dbc("alpine", "10.0.0.2");
        left.minion = "10.0.1.1".into();
        let mut right = dkc("alpine", "10.0.0.2");
        right.id = "dk-1".into();
        right.eid = "ep1".into();
        right.status = "running".into();

        let (changed, to_boot, to_kill) = sync_worker(vec![left], vec![right]);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].docker_id, "dk-1");
        assert_eq!(changed[0].endpoint_id, "ep1");
        assert_eq!(changed[0].status, "running");
        assert!(to_boot.is_empty());
        assert!(to_kill.is_empty());
    }
}
