//! Live node inventory.
//!
//! `RuntimeInspector` gathers OS-level metrics of a node with a single shell round-trip (locally
//! or over SSH) and turns them into a `RuntimeSnapshot`. `InventoryService` keeps the latest
//! snapshot per node, refreshed on a ticker, and answers "which node has the most headroom".

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::RwLock;

use crate::error::{ExecError, Result};
use crate::node::NodeDescription;
use crate::periodic::Ticker;
use crate::session::{LocalHosts, SshPool};

/// Point-in-time host metrics. Replaced wholesale on every poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSnapshot {
    /// One-minute load average divided by the core count.
    pub cpu_load: f64,
    pub cores: usize,
    pub total_memory_mb: i64,
    pub available_memory_mb: i64,
    pub total_disk_mb: i64,
    pub used_disk_mb: i64,
    pub captured_at: DateTime<Utc>,
}

impl RuntimeSnapshot {
    pub fn free_disk_mb(&self) -> i64 {
        self.total_disk_mb - self.used_disk_mb
    }
}

/// Runs a probe script on a node and returns its stdout.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn run(&self, node: &NodeDescription, script: &str) -> Result<String>;
}

/// Runs probe scripts with the local shell.
#[derive(Debug, Default)]
pub struct LocalProbe;

#[async_trait]
impl Probe for LocalProbe {
    async fn run(&self, _node: &NodeDescription, script: &str) -> Result<String> {
        let output = Command::new("sh").arg("-c").arg(script).output().await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Runs probe scripts locally for local hosts and over SSH otherwise.
pub struct ShellProbe {
    local_hosts: LocalHosts,
    pool: Arc<SshPool>,
}

impl ShellProbe {
    pub fn new(local_hosts: LocalHosts, pool: Arc<SshPool>) -> Self {
        Self { local_hosts, pool }
    }
}

#[async_trait]
impl Probe for ShellProbe {
    async fn run(&self, node: &NodeDescription, script: &str) -> Result<String> {
        if self.local_hosts.is_local(&node.hostname) {
            LocalProbe.run(node, script).await
        } else {
            let output = self.pool.run(node, script).await?;
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
    }
}

const SECTION: &str = "--eoflow--";

pub struct RuntimeInspector {
    probe: Arc<dyn Probe>,
    /// Path whose filesystem is reported as the node's disk.
    disk_path: String,
}

impl RuntimeInspector {
    pub fn new(probe: Arc<dyn Probe>, disk_path: impl Into<String>) -> Self {
        Self {
            probe,
            disk_path: disk_path.into(),
        }
    }

    fn script(&self) -> String {
        format!(
            "cat /proc/loadavg; echo {s}; cat /proc/meminfo; echo {s}; df -Pk {p} | tail -n 1; echo {s}; nproc",
            s = SECTION,
            p = crate::command::shell_quote(&self.disk_path)
        )
    }

    pub async fn inspect(&self, node: &NodeDescription) -> Result<RuntimeSnapshot> {
        let output = self.probe.run(node, &self.script()).await?;
        parse_snapshot(&output, node.flavor.cpus)
    }
}

fn probe_error(what: &str) -> ExecError {
    ExecError::Poll {
        job: "runtime-probe".to_string(),
        reason: format!("could not parse {}", what),
    }
}

/// Parses the probe output: loadavg, meminfo, one `df -Pk` line and `nproc`, separated by
/// section markers.
pub fn parse_snapshot(output: &str, fallback_cores: usize) -> Result<RuntimeSnapshot> {
    let sections: Vec<&str> = output.split(SECTION).collect();
    if sections.len() < 3 {
        return Err(probe_error("probe output"));
    }
    let load = parse_loadavg(sections[0]).ok_or_else(|| probe_error("load average"))?;
    let (total_memory_mb, available_memory_mb) =
        parse_meminfo(sections[1]).ok_or_else(|| probe_error("meminfo"))?;
    let (total_disk_mb, used_disk_mb) = parse_df(sections[2]).ok_or_else(|| probe_error("df"))?;
    let cores = sections
        .get(3)
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(fallback_cores.max(1));
    Ok(RuntimeSnapshot {
        cpu_load: load / cores as f64,
        cores,
        total_memory_mb,
        available_memory_mb,
        total_disk_mb,
        used_disk_mb,
        captured_at: Utc::now(),
    })
}

/// One-minute load average from `/proc/loadavg`.
pub fn parse_loadavg(text: &str) -> Option<f64> {
    text.split_whitespace().next()?.parse().ok()
}

/// `(total, available)` memory in MB from `/proc/meminfo`.
pub fn parse_meminfo(text: &str) -> Option<(i64, i64)> {
    let fields: HashMap<&str, i64> = text
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let kb = rest.split_whitespace().next()?.parse().ok()?;
            Some((key.trim(), kb))
        })
        .collect();
    let total = *fields.get("MemTotal")?;
    let available = match fields.get("MemAvailable") {
        Some(&kb) => kb,
        // Kernels before 3.14 lack MemAvailable.
        None => {
            fields.get("MemFree")? + fields.get("Buffers").unwrap_or(&0)
                + fields.get("Cached").unwrap_or(&0)
        }
    };
    Some((total / 1024, available / 1024))
}

/// `(total, used)` disk in MB from a `df -Pk` data line.
pub fn parse_df(text: &str) -> Option<(i64, i64)> {
    let line = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("Filesystem"))
        .last()?;
    let columns: Vec<&str> = line.split_whitespace().collect();
    let total: i64 = columns.get(1)?.parse().ok()?;
    let used: i64 = columns.get(2)?.parse().ok()?;
    Some((total / 1024, used / 1024))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Lowest load relative to core count.
    #[default]
    LowestLoad,
    MostFreeMemory,
}

/// The set of nodes available for scheduling.
#[async_trait]
pub trait NodeInventory: Send + Sync {
    async fn current_nodes(&self) -> Vec<NodeDescription>;

    /// Best node satisfying the memory request and the free memory/disk thresholds, if any.
    async fn available_node(
        &self,
        user: &str,
        cpu: usize,
        memory_mb: i64,
        strategy: SelectionStrategy,
    ) -> Option<NodeDescription>;

    /// Refreshes the runtime snapshot of one host.
    async fn update_node_info(&self, host: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default)]
    pub min_free_memory_mb: i64,
    #[serde(default)]
    pub min_free_disk_mb: i64,
}

pub struct InventoryService {
    nodes: RwLock<Vec<NodeDescription>>,
    snapshots: RwLock<HashMap<String, RuntimeSnapshot>>,
    inspector: RuntimeInspector,
    thresholds: Thresholds,
}

impl InventoryService {
    pub fn new(
        nodes: Vec<NodeDescription>,
        inspector: RuntimeInspector,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            nodes: RwLock::new(nodes),
            snapshots: RwLock::new(HashMap::new()),
            inspector,
            thresholds,
        }
    }

    pub async fn set_active(&self, host: &str, active: bool) {
        if let Some(node) = self
            .nodes
            .write()
            .await
            .iter_mut()
            .find(|n| n.hostname == host)
        {
            node.active = active;
        }
    }

    pub async fn record_snapshot(&self, host: &str, snapshot: RuntimeSnapshot) {
        self.snapshots
            .write()
            .await
            .insert(host.to_string(), snapshot);
    }

    pub async fn snapshot(&self, host: &str) -> Option<RuntimeSnapshot> {
        self.snapshots.read().await.get(host).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.nodes.read().await.iter().filter(|n| n.active).count()
    }

    /// Refreshes every active node. Probe failures are logged and leave the old snapshot.
    pub async fn refresh_all(&self) {
        let hosts: Vec<String> = self
            .nodes
            .read()
            .await
            .iter()
            .filter(|n| n.active)
            .map(|n| n.hostname.clone())
            .collect();
        let updates = hosts.iter().map(|host| self.update_node_info(host));
        for (host, result) in hosts.iter().zip(futures::future::join_all(updates).await) {
            if let Err(e) = result {
                tracing::warn!(host = %host, error = %e, "Failed to refresh node info");
            }
        }
    }

    pub fn spawn_refresher(self: &Arc<Self>, period: Duration) -> Ticker {
        let inventory = Arc::clone(self);
        Ticker::start("inventory-refresh", period, move || {
            let inventory = Arc::clone(&inventory);
            async move {
                inventory.refresh_all().await;
                ControlFlow::Continue(())
            }
        })
    }

    fn fits(&self, snapshot: &RuntimeSnapshot, memory_mb: i64) -> bool {
        snapshot.available_memory_mb >= self.thresholds.min_free_memory_mb.max(memory_mb)
            && snapshot.free_disk_mb() >= self.thresholds.min_free_disk_mb
    }
}

#[async_trait]
impl NodeInventory for InventoryService {
    async fn current_nodes(&self) -> Vec<NodeDescription> {
        self.nodes.read().await.clone()
    }

    async fn available_node(
        &self,
        user: &str,
        cpu: usize,
        memory_mb: i64,
        strategy: SelectionStrategy,
    ) -> Option<NodeDescription> {
        let nodes = self.nodes.read().await;
        let snapshots = self.snapshots.read().await;
        let candidates = nodes.iter().filter(|n| n.active).filter_map(|n| {
            let snapshot = snapshots.get(&n.hostname)?;
            self.fits(snapshot, memory_mb).then_some((n, snapshot))
        });
        let best = match strategy {
            SelectionStrategy::LowestLoad => candidates
                .min_by(|(_, a), (_, b)| a.cpu_load.total_cmp(&b.cpu_load)),
            SelectionStrategy::MostFreeMemory => candidates
                .min_by_key(|(_, s)| std::cmp::Reverse(s.available_memory_mb)),
        };
        tracing::trace!(
            user,
            cpu,
            memory_mb,
            candidate = ?best.map(|(n, _)| &n.hostname),
            "Inventory lookup"
        );
        best.map(|(n, _)| n.clone())
    }

    async fn update_node_info(&self, host: &str) -> Result<()> {
        let node = self
            .nodes
            .read()
            .await
            .iter()
            .find(|n| n.hostname == host)
            .cloned()
            .ok_or_else(|| ExecError::Config(format!("unknown node '{}'", host)))?;
        let snapshot = self.inspector.inspect(&node).await?;
        tracing::debug!(
            host,
            cpu_load = snapshot.cpu_load,
            available_memory_mb = snapshot.available_memory_mb,
            free_disk_mb = snapshot.free_disk_mb(),
            "Node snapshot updated"
        );
        self.record_snapshot(host, snapshot).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Flavor;

    const SAMPLE: &str = "1.50 1.20 0.90 2/345 6789
--eoflow--
MemTotal:       16384000 kB
MemFree:         1024000 kB
MemAvailable:    8192000 kB
Buffers:          100000 kB
--eoflow--
/dev/sda1      102400000 51200000 51200000 50% /
--eoflow--
4
";

    #[test]
    fn test_parse_snapshot() {
        let snapshot = parse_snapshot(SAMPLE, 1).unwrap();
        assert_eq!(snapshot.cores, 4);
        assert!((snapshot.cpu_load - 0.375).abs() < 1e-9);
        assert_eq!(snapshot.total_memory_mb, 16000);
        assert_eq!(snapshot.available_memory_mb, 8000);
        assert_eq!(snapshot.total_disk_mb, 100000);
        assert_eq!(snapshot.free_disk_mb(), 50000);
    }

    #[test]
    fn test_parse_meminfo_without_available() {
        let (total, available) =
            parse_meminfo("MemTotal: 2048 kB\nMemFree: 512 kB\nBuffers: 256 kB\nCached: 256 kB")
                .unwrap();
        assert_eq!(total, 2);
        assert_eq!(available, 1);
    }

    #[test]
    fn test_parse_snapshot_rejects_garbage() {
        assert!(parse_snapshot("nothing here", 1).is_err());
    }

    struct CannedProbe(String);

    #[async_trait]
    impl Probe for CannedProbe {
        async fn run(&self, _node: &NodeDescription, _script: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn snapshot(cpu_load: f64, available_memory_mb: i64) -> RuntimeSnapshot {
        RuntimeSnapshot {
            cpu_load,
            cores: 4,
            total_memory_mb: 16000,
            available_memory_mb,
            total_disk_mb: 1000,
            used_disk_mb: 100,
            captured_at: Utc::now(),
        }
    }

    fn service(names: &[&str], thresholds: Thresholds) -> InventoryService {
        let nodes = names
            .iter()
            .map(|n| NodeDescription::new(*n, Flavor::default()))
            .collect();
        InventoryService::new(
            nodes,
            RuntimeInspector::new(Arc::new(CannedProbe(SAMPLE.to_string())), "/"),
            thresholds,
        )
    }

    #[tokio::test]
    async fn test_lowest_load_wins() {
        let inventory = service(&["a", "b", "c"], Thresholds::default());
        inventory.record_snapshot("a", snapshot(0.9, 4000)).await;
        inventory.record_snapshot("b", snapshot(0.2, 4000)).await;
        inventory.record_snapshot("c", snapshot(0.5, 9000)).await;
        let best = inventory
            .available_node("u", 1, 0, SelectionStrategy::LowestLoad)
            .await
            .unwrap();
        assert_eq!(best.hostname, "b");
        let best = inventory
            .available_node("u", 1, 0, SelectionStrategy::MostFreeMemory)
            .await
            .unwrap();
        assert_eq!(best.hostname, "c");
    }

    #[tokio::test]
    async fn test_thresholds_and_active_flag_filter() {
        let inventory = service(
            &["a", "b", "c"],
            Thresholds {
                min_free_memory_mb: 1000,
                min_free_disk_mb: 500,
            },
        );
        inventory.record_snapshot("a", snapshot(0.1, 500)).await;
        inventory.record_snapshot("b", snapshot(0.2, 4000)).await;
        // "c" has no snapshot yet.
        assert_eq!(
            inventory
                .available_node("u", 1, 0, SelectionStrategy::LowestLoad)
                .await
                .unwrap()
                .hostname,
            "b"
        );
        assert!(inventory
            .available_node("u", 1, 5000, SelectionStrategy::LowestLoad)
            .await
            .is_none());
        inventory.set_active("b", false).await;
        assert!(inventory
            .available_node("u", 1, 0, SelectionStrategy::LowestLoad)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_refresh_uses_probe() {
        let inventory = service(&["a"], Thresholds::default());
        inventory.refresh_all().await;
        let snapshot = inventory.snapshot("a").await.unwrap();
        assert_eq!(snapshot.available_memory_mb, 8000);
        assert!(inventory.update_node_info("zzz").await.is_err());
    }
}
