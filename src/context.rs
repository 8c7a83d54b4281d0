//! The collaborators an execution engine runs with.
//!
//! Everything is constructed once at start-up and passed down explicitly.

use std::sync::Arc;
use std::time::Duration;

use crate::command::CommandBuilder;
use crate::component::{ComponentRegistry, StaticRegistry};
use crate::config::EngineConfig;
use crate::inventory::NodeInventory;
use crate::ledger::ResourceLedger;
use crate::lifecycle::{NoopFinalizer, OutputFinalizer};
use crate::listener::{ExecutionListener, ListenerRegistry};
use crate::node::{Flavor, NodeDescription};
use crate::selector::NodeSelector;
use crate::session::SessionEngine;
use crate::store::{InMemoryTaskStore, TaskStore};

pub struct ExecutionContext {
    pub app_id: String,
    pub store: Arc<dyn TaskStore>,
    pub components: Arc<dyn ComponentRegistry>,
    pub inventory: Option<Arc<dyn NodeInventory>>,
    pub ledger: Arc<ResourceLedger>,
    pub selector: Arc<NodeSelector>,
    pub builder: Arc<CommandBuilder>,
    pub engine: Arc<dyn SessionEngine>,
    pub listeners: ListenerRegistry,
    pub finalizer: Arc<dyn OutputFinalizer>,
    pub auto_finalize: bool,
    pub queue_capacity: usize,
    pub monitor_period: Duration,
}

impl ExecutionContext {
    pub fn builder(app_id: impl Into<String>, engine: Arc<dyn SessionEngine>) -> ContextBuilder {
        ContextBuilder {
            app_id: app_id.into(),
            engine,
            store: None,
            components: None,
            inventory: None,
            master: None,
            listeners: ListenerRegistry::new(),
            finalizer: None,
            config: EngineConfig::default(),
        }
    }
}

pub struct ContextBuilder {
    app_id: String,
    engine: Arc<dyn SessionEngine>,
    store: Option<Arc<dyn TaskStore>>,
    components: Option<Arc<dyn ComponentRegistry>>,
    inventory: Option<Arc<dyn NodeInventory>>,
    master: Option<NodeDescription>,
    listeners: ListenerRegistry,
    finalizer: Option<Arc<dyn OutputFinalizer>>,
    config: EngineConfig,
}

impl ContextBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn components(mut self, components: Arc<dyn ComponentRegistry>) -> Self {
        self.components = Some(components);
        self
    }

    /// Enables multi-node selection. Without an inventory every task runs on the master.
    pub fn inventory(mut self, inventory: Arc<dyn NodeInventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn master(mut self, master: NodeDescription) -> Self {
        self.master = Some(master);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ExecutionListener>) -> Self {
        self.listeners.register(listener);
        self
    }

    pub fn finalizer(mut self, finalizer: Arc<dyn OutputFinalizer>) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    pub fn build(self) -> ExecutionContext {
        let config = self.config;
        let master = self.master.unwrap_or_else(|| {
            let hostname = config
                .master_host
                .clone()
                .unwrap_or_else(|| "localhost".to_string());
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            NodeDescription::master(
                hostname,
                Flavor {
                    cpus,
                    ..Flavor::default()
                },
            )
        });
        let ledger = Arc::new(ResourceLedger::new());
        let selector = Arc::new(NodeSelector::new(
            master,
            self.inventory.clone(),
            Arc::clone(&ledger),
            &config.selector,
        ));
        let builder = Arc::new(CommandBuilder::new(
            config.container_runtime.clone(),
            config.volumes.clone(),
            config.temp_dir.clone(),
        ));
        ExecutionContext {
            app_id: self.app_id,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new())),
            components: self
                .components
                .unwrap_or_else(|| Arc::new(StaticRegistry::new())),
            inventory: self.inventory,
            ledger,
            selector,
            builder,
            engine: self.engine,
            listeners: self.listeners,
            finalizer: self.finalizer.unwrap_or_else(|| Arc::new(NoopFinalizer)),
            auto_finalize: config.auto_finalize,
            queue_capacity: config.queue_capacity.max(1),
            monitor_period: config.monitor_period(),
        }
    }
}
