use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use futures::future::join_all;
use tracing_subscriber::EnvFilter;

use eoflow::component::StaticRegistry;
use eoflow::config::{Config, EngineConfig, EngineKind, Mode};
use eoflow::context::ExecutionContext;
use eoflow::error::Result;
use eoflow::inventory::{InventoryService, NodeInventory, Probe, RuntimeInspector, ShellProbe};
use eoflow::lifecycle::{ChownFinalizer, TaskLifecycleManager};
use eoflow::listener::LoggingListener;
use eoflow::node::{get_nodes, NodeDescription};
use eoflow::session::{build_engine, LocalHosts, SshPool};
use eoflow::task::{get_tasks, ExecutionStatus, Task};

const EXPORT_FILE: &str = "eoflow-export.sh";

fn load_engine_config(cli: &Config) -> Result<EngineConfig> {
    match &cli.engine_file {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::default()),
    }
}

fn load_nodes(cli: &Config) -> Result<Vec<NodeDescription>> {
    if Path::new(&cli.nodes_file).exists() {
        get_nodes(&cli.nodes_file)
    } else {
        tracing::warn!(file = %cli.nodes_file, "No node inventory, running on the master only");
        Ok(Vec::new())
    }
}

async fn run_probe(cli: &Config) -> Result<ExitCode> {
    let config = load_engine_config(cli)?;
    let nodes = load_nodes(cli)?;
    let pool = Arc::new(SshPool::new());
    let probe: Arc<dyn Probe> = Arc::new(ShellProbe::new(
        LocalHosts::detect(config.master_host.as_deref()),
        Arc::clone(&pool),
    ));
    let inspector = RuntimeInspector::new(probe, config.disk_path.clone());

    let snapshots = join_all(nodes.iter().map(|node| inspector.inspect(node))).await;
    let mut failures = 0;
    for (node, snapshot) in nodes.iter().zip(snapshots) {
        match snapshot {
            Ok(s) => println!(
                "{} load {:.2} on {} cores, memory {}/{} MB free, disk {}/{} MB free",
                node.hostname.bold(),
                s.cpu_load,
                s.cores,
                s.available_memory_mb,
                s.total_memory_mb,
                s.free_disk_mb(),
                s.total_disk_mb,
            ),
            Err(e) => {
                failures += 1;
                println!("{} {}", node.hostname.bold(), e.to_string().red());
            }
        }
    }
    pool.close_all().await;
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_tasks(cli: &Config, mut config: EngineConfig, export: bool) -> Result<ExitCode> {
    let tasks = get_tasks(&cli.tasks_file)?;
    let pool = Arc::new(SshPool::new());

    if export {
        config.engine = EngineKind::Simulated;
        let path = config
            .export_file
            .get_or_insert_with(|| PathBuf::from(EXPORT_FILE))
            .clone();
        tokio::fs::write(&path, "#!/bin/sh\nset -e\n").await?;
        eprintln!("[eoflow] Exporting {} tasks to {}", tasks.len(), path.display());
    }
    let engine = build_engine(&config, Arc::clone(&pool));

    let mut builder = ExecutionContext::builder(cli.app_id.clone(), engine)
        .config(config.clone())
        .listener(Arc::new(LoggingListener));
    if let Some(file) = &config.components_file {
        builder = builder.components(Arc::new(StaticRegistry::load(file)?));
    }
    let local_hosts = LocalHosts::detect(config.master_host.as_deref());
    let shell: Arc<dyn Probe> = Arc::new(ShellProbe::new(local_hosts, Arc::clone(&pool)));
    if let Some(owner) = &config.output_owner {
        builder = builder.finalizer(Arc::new(ChownFinalizer::new(
            owner.clone(),
            Arc::clone(&shell),
        )));
    }

    // Multi-node selection only makes sense when the engine can reach other nodes.
    let nodes = load_nodes(cli)?;
    let mut inventory = None;
    if !export && config.engine != EngineKind::Local && !nodes.is_empty() {
        let service = Arc::new(InventoryService::new(
            nodes,
            RuntimeInspector::new(shell, config.disk_path.clone()),
            config.selector.thresholds(),
        ));
        service.refresh_all().await;
        builder = builder.inventory(Arc::clone(&service) as Arc<dyn NodeInventory>);
        inventory = Some(service);
    }

    let manager = TaskLifecycleManager::new(Arc::new(builder.build()));
    let workers = manager.start().await;
    let refresher = inventory
        .as_ref()
        .map(|service| service.spawn_refresher(config.inventory_refresh()));
    let monitor = manager.spawn_monitor(manager.context().monitor_period);
    eprintln!(
        "[eoflow] {} tasks, {} workers, {} engine",
        tasks.len(),
        workers,
        manager.context().engine.name()
    );

    let mut submitted = Vec::with_capacity(tasks.len());
    for task in tasks {
        submitted.push(manager.execute(task).await?);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                eprintln!("[eoflow] Interrupted, cancelling unfinished tasks");
                for task in manager.context().store.list_all(&cli.app_id).await? {
                    if let (Some(id), false) = (task.id, task.status.is_terminal()) {
                        manager.stop(id).await?;
                    }
                }
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                // Finalize here when the monitor leaves it to the caller.
                for task in manager.context().store.list_all(&cli.app_id).await? {
                    if let (Some(id), ExecutionStatus::PendingFinalisation) = (task.id, task.status) {
                        manager.finalize(id).await?;
                    }
                }
                if manager.unfinished().await? == 0 {
                    break;
                }
            }
        }
    }

    monitor.stop().await;
    if let Some(refresher) = refresher {
        refresher.stop().await;
    }
    manager.shutdown();
    pool.close_all().await;

    let ids: Vec<_> = submitted.iter().filter_map(|t| t.id).collect();
    let finished = manager.context().store.list(&ids).await?;
    print_summary(&finished);
    Ok(if finished.iter().all(|t| t.status == ExecutionStatus::Done) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_summary(tasks: &[Task]) {
    for task in tasks {
        let status = task.status.to_string();
        let status = match task.status {
            ExecutionStatus::Done => status.green(),
            ExecutionStatus::Failed => status.red(),
            ExecutionStatus::Cancelled => status.yellow(),
            _ => status.normal(),
        };
        println!(
            "{} {} {}",
            status,
            task.name.bold(),
            task.execution_node_host_name.as_deref().unwrap_or("-")
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Config::parse();
    let result = match cli.mode {
        Mode::Run => {
            eprintln!("[eoflow] Running in run mode!");
            match load_engine_config(&cli) {
                Ok(config) => run_tasks(&cli, config, false).await,
                Err(e) => Err(e),
            }
        }
        Mode::Probe => {
            eprintln!("[eoflow] Running in probe mode!");
            run_probe(&cli).await
        }
        Mode::Export => {
            eprintln!("[eoflow] Running in export mode!");
            match load_engine_config(&cli) {
                Ok(config) => run_tasks(&cli, config, true).await,
                Err(e) => Err(e),
            }
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "eoflow failed");
            ExitCode::FAILURE
        }
    }
}
