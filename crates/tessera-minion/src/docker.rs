//! Capability interface over the Docker daemon.
//!
//! The concrete client library is a collaborator; the scheduler only
//! depends on this trait, and tests run against [`FakeDocker`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

/// Label that marks containers as scheduler-owned.
pub const LABEL_KEY: &str = "tessera";
pub const LABEL_VALUE: &str = "scheduler";
pub const LABEL_PAIR: &str = "tessera=scheduler";

/// Label carrying the hash of a container's file map.
pub const FILES_KEY: &str = "files";

/// Name of the cluster network the plugin provides.
pub const NETWORK_NAME: &str = "tessera";

/// DNS search domain containers resolve cluster hostnames under.
pub const DNS_SEARCH_DOMAIN: &str = "t";

/// A container as the Docker daemon reports it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DockerContainer {
    pub id: String,

    /// Endpoint identifier on the cluster network.
    pub eid: String,

    pub image: String,
    pub image_id: String,
    pub ip: String,

    /// The entrypoint binary and its arguments.
    pub path: String,
    pub args: Vec<String>,

    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub status: String,
    pub created: Option<DateTime<Utc>>,
}

/// Options for launching a container.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub filepath_to_content: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub ip: String,
    pub network_mode: String,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
}

#[async_trait]
pub trait DockerClient: Send + Sync {
    /// Containers matching `filters` (filter name to acceptable values).
    async fn list(&self, filters: &BTreeMap<String, Vec<String>>)
        -> Result<Vec<DockerContainer>>;

    /// Launch a container, returning its ID.
    async fn run(&self, opts: RunOptions) -> Result<String>;

    /// Remove a container by ID.
    async fn remove(&self, id: &str) -> Result<()>;

    /// One-shot install of the cluster network plugin.
    async fn configure_network(&self, network: &str) -> Result<()>;
}

/// An in-memory Docker daemon for tests.
#[derive(Default)]
pub struct FakeDocker {
    state: Mutex<FakeDockerState>,
}

#[derive(Default)]
struct FakeDockerState {
    containers: Vec<DockerContainer>,
    removed: Vec<String>,
    next: u32,
    network_configured: bool,
    fail_network: bool,
    fail_runs: bool,
}

impl FakeDocker {
    pub fn new() -> Arc<FakeDocker> {
        Arc::new(FakeDocker::default())
    }

    fn state(&self) -> MutexGuard<'_, FakeDockerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a container as if it were already running.
    pub fn seed(&self, container: DockerContainer) {
        self.state().containers.push(container);
    }

    pub fn containers(&self) -> Vec<DockerContainer> {
        self.state().containers.clone()
    }

    /// IDs removed so far, oldest first.
    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    pub fn network_configured(&self) -> bool {
        self.state().network_configured
    }

    pub fn fail_network(&self, fail: bool) {
        self.state().fail_network = fail;
    }

    pub fn fail_runs(&self, fail: bool) {
        self.state().fail_runs = fail;
    }
}

#[async_trait]
impl DockerClient for FakeDocker {
    async fn list(
        &self,
        filters: &BTreeMap<String, Vec<String>>,
    ) -> Result<Vec<DockerContainer>> {
        let state = self.state();
        let wanted_labels = filters.get("label").cloned().unwrap_or_default();
        Ok(state
            .containers
            .iter()
            .filter(|c| {
                wanted_labels.iter().all(|pair| {
                    match pair.split_once('=') {
                        Some((key, value)) => c.labels.get(key).map(String::as_str) == Some(value),
                        None => c.labels.contains_key(pair),
                    }
                })
            })
            .cloned()
            .collect())
    }

    async fn run(&self, opts: RunOptions) -> Result<String> {
        let mut state = self.state();
        if state.fail_runs {
            bail!("image pull failed");
        }
        state.next += 1;
        let n = state.next;
        let id = format!("dk-{:04}", n);
        let created = Utc
            .timestamp_opt(1_700_000_000 + i64::from(n), 0)
            .single();
        state.containers.push(DockerContainer {
            id: id.clone(),
            eid: format!("ep{:012x}", n),
            image: opts.image,
            image_id: String::new(),
            ip: opts.ip,
            path: String::new(),
            args: opts.args,
            env: opts.env,
            labels: opts.labels,
            status: "running".into(),
            created,
        });
        Ok(id)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.removed.push(id.to_string());
        state.containers.retain(|c| c.id != id);
        Ok(())
    }

    async fn configure_network(&self, _network: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_network {
            bail!("plugin install failed");
        }
        state.network_configured = true;
        Ok(())
    }
}
