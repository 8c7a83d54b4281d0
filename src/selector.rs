//! Node selection with backpressure.
//!
//! `select_node` does not resolve until some node has room for the request. Excess submissions
//! wait here instead of overcommitting a node. There is no timeout and no ordering among
//! waiters: a request nobody can satisfy waits forever.

use std::sync::Arc;
use std::time::Duration;

use crate::config::SelectorConfig;
use crate::inventory::{NodeInventory, SelectionStrategy};
use crate::ledger::ResourceLedger;
use crate::node::NodeDescription;

/// The node a task goes to and the share of it the task may use.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeData {
    pub node: NodeDescription,
    pub cpu_to_use: usize,
    pub memory_to_use: i64,
}

pub struct NodeSelector {
    master: NodeDescription,
    inventory: Option<Arc<dyn NodeInventory>>,
    ledger: Arc<ResourceLedger>,
    backoff: Duration,
    strategy: SelectionStrategy,
    default_memory_mb: i64,
}

impl NodeSelector {
    /// Without an inventory every task goes to `master`.
    pub fn new(
        master: NodeDescription,
        inventory: Option<Arc<dyn NodeInventory>>,
        ledger: Arc<ResourceLedger>,
        config: &SelectorConfig,
    ) -> Self {
        Self {
            master,
            inventory,
            ledger,
            backoff: config.backoff(),
            strategy: config.strategy,
            default_memory_mb: config.default_memory_mb,
        }
    }

    pub fn master(&self) -> &NodeDescription {
        &self.master
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    fn node_data(&self, node: NodeDescription, cpu_hint: usize, memory_mb: i64) -> NodeData {
        let cpu_to_use = if cpu_hint > 0 {
            cpu_hint.min(node.flavor.cpus.max(1))
        } else {
            node.flavor.cpus.max(1)
        };
        NodeData {
            node,
            cpu_to_use,
            memory_to_use: memory_mb,
        }
    }

    pub async fn select_node(&self, user: &str, cpu_hint: usize, memory_hint: i64) -> NodeData {
        let memory_mb = if memory_hint > 0 {
            memory_hint
        } else {
            self.default_memory_mb
        };
        let inventory = match &self.inventory {
            Some(inventory) => inventory,
            None => return self.node_data(self.master.clone(), cpu_hint, memory_mb),
        };

        let mut attempts = 0u64;
        loop {
            // Registered before checking so a release in between is not missed.
            let released = self.ledger.released();
            let candidate = inventory
                .available_node(user, cpu_hint, memory_mb, self.strategy)
                .await;
            match candidate {
                Some(node) if self.ledger.can_accept(&node.hostname, memory_mb) => {
                    tracing::debug!(
                        host = %node.hostname,
                        memory_mb,
                        attempts,
                        "Selected node"
                    );
                    return self.node_data(node, cpu_hint, memory_mb);
                }
                Some(node) => tracing::trace!(
                    host = %node.hostname,
                    memory_mb,
                    "Best node has no headroom left"
                ),
                None => tracing::trace!(memory_mb, "No node satisfies the thresholds"),
            }
            attempts += 1;
            if attempts % 12 == 0 {
                tracing::info!(user, memory_mb, attempts, "Still waiting for a node");
            }
            let _ = tokio::time::timeout(self.backoff, released).await;
        }
    }
}
