//! Configuration for eoflow.
//!
//! `Config` holds the clap structs for command line arguments and flags. `EngineConfig` is the
//! optional YAML file describing the execution backend, the selector's thresholds and the
//! timers. Every field has a default so an empty file (or none) gives a local setup.

use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::command::VolumeMap;
use crate::error::Result;
use crate::inventory::{SelectionStrategy, Thresholds};

#[derive(Parser)]
#[command(version, author)]
pub struct Config {
    /// Run (r), Probe (p), and Export (x) mode
    #[arg(value_enum)]
    pub mode: Mode,

    /// Node inventory file to use. Defaults to `nodes.yaml`
    #[arg(long, default_value = "nodes.yaml")]
    pub nodes_file: String,

    /// Engine configuration file. Built-in defaults are used when absent
    #[arg(long)]
    pub engine_file: Option<String>,

    /// Task file to use. Defaults to `tasks.yaml`
    #[arg(long, default_value = "tasks.yaml")]
    pub tasks_file: String,

    /// Application id tasks are recorded under
    #[arg(long, default_value = "eoflow")]
    pub app_id: String,
}

#[derive(PartialEq, Clone, ValueEnum)]
pub enum Mode {
    #[value(name = "r")]
    Run,
    #[value(name = "p")]
    Probe,
    #[value(name = "x")]
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Child processes of eoflow, master node only.
    #[default]
    Local,
    /// Every node over SSH.
    Ssh,
    /// Local processes for this host, SSH for the others.
    Process,
    /// Record commands to `export_file` instead of running them.
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Re-poll interval while no node has room.
    pub backoff_secs: u64,
    pub min_free_memory_mb: i64,
    pub min_free_disk_mb: i64,
    /// Memory reserved for tasks that declare none.
    pub default_memory_mb: i64,
    pub strategy: SelectionStrategy,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            backoff_secs: 5,
            min_free_memory_mb: 0,
            min_free_disk_mb: 0,
            default_memory_mb: 512,
            strategy: SelectionStrategy::default(),
        }
    }
}

impl SelectorConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            min_free_memory_mb: self.min_free_memory_mb,
            min_free_disk_mb: self.min_free_disk_mb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineKind,
    /// Hostname of the node eoflow itself runs on.
    pub master_host: Option<String>,
    /// e.g. `docker`. Tasks of containerized components run uncontainerized when unset.
    pub container_runtime: Option<String>,
    pub volumes: VolumeMap,
    pub selector: SelectorConfig,
    pub monitor_period_secs: u64,
    pub inventory_refresh_secs: u64,
    pub queue_capacity: usize,
    /// Where the ssh engine keeps job output and exit files.
    pub remote_work_dir: String,
    /// Temporary output root for components that manage their own output.
    pub temp_dir: PathBuf,
    pub export_file: Option<PathBuf>,
    /// Resolve PENDING_FINALISATION to DONE in the same monitor pass.
    pub auto_finalize: bool,
    /// `user[:group]` outputs are handed to after completion.
    pub output_owner: Option<String>,
    pub components_file: Option<String>,
    /// Filesystem reported as node disk.
    pub disk_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            master_host: None,
            container_runtime: None,
            volumes: VolumeMap::default(),
            selector: SelectorConfig::default(),
            monitor_period_secs: 5,
            inventory_refresh_secs: 30,
            queue_capacity: 64,
            remote_work_dir: "/tmp/eoflow".to_string(),
            temp_dir: PathBuf::from("/tmp/eoflow/work"),
            export_file: None,
            auto_finalize: true,
            output_owner: None,
            components_file: None,
            disk_path: "/".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &str) -> Result<Self> {
        Ok(serde_yaml::from_reader(File::open(path)?)?)
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn monitor_period(&self) -> Duration {
        Duration::from_secs(self.monitor_period_secs.max(1))
    }

    pub fn inventory_refresh(&self) -> Duration {
        Duration::from_secs(self.inventory_refresh_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::parse("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.selector.backoff(), Duration::from_secs(5));
        assert!(config.auto_finalize);
    }

    #[test]
    fn test_partial_file() {
        let config = EngineConfig::parse(
            r#"
engine: process
master_host: master.eo
container_runtime: docker
volumes:
  workspace: { host: /data/ws, container: /home/eo/ws }
selector:
  min_free_memory_mb: 1024
  strategy: most_free_memory
export_file: run.sh
"#,
        )
        .unwrap();
        assert_eq!(config.engine, EngineKind::Process);
        assert_eq!(config.selector.backoff_secs, 5);
        assert_eq!(config.selector.thresholds().min_free_memory_mb, 1024);
        assert_eq!(config.selector.strategy, SelectionStrategy::MostFreeMemory);
        assert_eq!(
            config.volumes.workspace.unwrap().container,
            "/home/eo/ws".to_string()
        );
        assert_eq!(config.export_file, Some(PathBuf::from("run.sh")));
    }

    #[test]
    fn test_unknown_engine() {
        assert!(EngineConfig::parse("engine: drmaa").is_err());
    }
}
