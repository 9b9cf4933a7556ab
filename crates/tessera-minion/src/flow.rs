//! Packet-forwarding rules for the containers on a worker.
//!
//! For every assigned container with a network endpoint we derive its
//! veth, the switch patch port, its MAC, and the sets of ports open to
//! and from the public internet. The programming backend (OVS/OpenFlow)
//! is a collaborator behind [`FlowTable`]; it replaces the full rule
//! set atomically.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::debug;

use tessera_blueprint::PUBLIC_INTERNET;
use tessera_counter::Counter;
use tessera_db::{Connection, Container};

use crate::ipdef;

static C: Counter = tessera_counter::new("Scheduler");

/// One container's forwarding state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardingRule {
    pub veth: String,
    pub patch: String,
    pub mac: String,
    pub ip: String,

    /// Ports the public internet may reach this container on.
    pub from_public: BTreeSet<u16>,

    /// Ports this container may reach the public internet on.
    pub to_public: BTreeSet<u16>,
}

/// Installs forwarding rules, replacing the whole set atomically.
pub trait FlowTable: Send + Sync {
    fn replace_flows(&self, rules: &[ForwardingRule]) -> Result<()>;
}

/// Derive the rules for `containers` given the deployment's
/// connections. Public connections with a real port range are not
/// expressible in the forwarding layer; they are skipped and counted.
pub fn forwarding_rules(
    containers: &[Container],
    connections: &[Connection],
) -> Vec<ForwardingRule> {
    let mut from_public: BTreeMap<&str, BTreeSet<u16>> = BTreeMap::new();
    let mut to_public: BTreeMap<&str, BTreeSet<u16>> = BTreeMap::new();

    for conn in connections {
        let from_pub = conn.from == PUBLIC_INTERNET;
        let to_pub = conn.to == PUBLIC_INTERNET;
        if !from_pub && !to_pub {
            continue;
        }

        if conn.min_port != conn.max_port {
            C.inc("Unsupported Public Port Range");
            debug!(
                from = %conn.from,
                to = %conn.to,
                min_port = conn.min_port,
                max_port = conn.max_port,
                "Unsupported public port range"
            );
            continue;
        }

        if from_pub {
            from_public.entry(&conn.to).or_default().insert(conn.min_port);
        }
        if to_pub {
            to_public.entry(&conn.from).or_default().insert(conn.min_port);
        }
    }

    containers
        .iter()
        .map(|dbc| ForwardingRule {
            veth: ipdef::if_name(&dbc.endpoint_id),
            patch: ipdef::patch_peer(&dbc.endpoint_id),
            mac: ipdef::ip_to_mac(&dbc.ip),
            ip: dbc.ip.clone(),
            from_public: from_public
                .get(dbc.hostname.as_str())
                .cloned()
                .unwrap_or_default(),
            to_public: to_public
                .get(dbc.hostname.as_str())
                .cloned()
                .unwrap_or_default(),
        })
        .collect()
}

/// A flow table that records every installed set, for tests.
#[derive(Default)]
pub struct RecordingFlowTable {
    sets: Mutex<Vec<Vec<ForwardingRule>>>,
}

impl RecordingFlowTable {
    pub fn new() -> Arc<RecordingFlowTable> {
        Arc::new(RecordingFlowTable::default())
    }

    pub fn sets(&self) -> Vec<Vec<ForwardingRule>> {
        self.sets.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last(&self) -> Option<Vec<ForwardingRule>> {
        self.sets().last().cloned()
    }
}

impl FlowTable for RecordingFlowTable {
    fn replace_flows(&self, rules: &[ForwardingRule]) -> Result<()> {
        self.sets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(rules.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(hostname: &str, ip: &str, eid: &str) -> Container {
        Container {
            hostname: hostname.into(),
            ip: ip.into(),
            endpoint_id: eid.into(),
            ..Default::default()
        }
    }

    fn connection(from: &str, to: &str, min_port: u16, max_port: u16) -> Connection {
        Connection {
            id: 0,
            from: from.into(),
            to: to.into(),
            min_port,
            max_port,
        }
    }

    #[test]
    fn test_public_ports_land_on_the_right_container() {
        let containers = vec![
            container("web", "10.0.0.2", "epweb"),
            container("db", "10.0.0.3", "epdb"),
        ];
        let connections = vec![
            connection("public", "web", 80, 80),
            connection("web", "public", 443, 443),
            connection("web", "db", 5432, 5432),
        ];

        let rules = forwarding_rules(&containers, &connections);
        assert_eq!(rules.len(), 2);

        let web = &rules[0];
        assert_eq!(web.veth, "tve-epweb");
        assert_eq!(web.patch, "tbr-epweb");
        assert_eq!(web.mac, "02:00:0a:00:00:02");
        assert_eq!(web.from_public, BTreeSet::from([80]));
        assert_eq!(web.to_public, BTreeSet::from([443]));

        // Container-to-container traffic contributes nothing here.
        let db = &rules[1];
        assert!(db.from_public.is_empty());
        assert!(db.to_public.is_empty());
    }

    #[test]
    fn test_port_range_skipped_and_counted() {
        let containers = vec![container("svc", "10.0.0.2", "epsvc")];
        let connections = vec![connection("public", "svc", 80, 81)];

        let before = tessera_counter::value("Scheduler", "Unsupported Public Port Range");
        let rules = forwarding_rules(&containers, &connections);
        let after = tessera_counter::value("Scheduler", "Unsupported Public Port Range");

        assert_eq!(after - before, 1);
        assert!(rules[0].from_public.is_empty());
    }
}
