//! Outstanding resource reservations per host.
//!
//! The ledger is the admission gate of the scheduler: a node only receives a new task when its
//! installed memory exceeds what in-flight tasks already reserved plus the new request.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::node::NodeDescription;

/// Outstanding reservations of one host.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub node: NodeDescription,
    /// Memory (MB) reserved by in-flight tasks. Not floored at zero.
    pub outstanding_mb: i64,
}

impl Reservation {
    pub fn installed_mb(&self) -> i64 {
        self.node.flavor.memory_mb()
    }
}

#[derive(Debug, Default)]
pub struct ResourceLedger {
    entries: Mutex<HashMap<String, Reservation>>,
    released: Notify,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Reservation>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `amount_mb` to the host's outstanding memory, creating the entry if absent.
    pub fn reserve(&self, node: &NodeDescription, amount_mb: i64) {
        let mut entries = self.entries();
        let entry = entries
            .entry(node.hostname.clone())
            .or_insert_with(|| Reservation {
                node: node.clone(),
                outstanding_mb: 0,
            });
        entry.outstanding_mb += amount_mb;
        tracing::debug!(
            host = %node.hostname,
            amount_mb,
            outstanding_mb = entry.outstanding_mb,
            "Reserved memory"
        );
    }

    /// Subtracts `amount_mb` from the host's outstanding memory. Unknown hosts are ignored.
    pub fn release(&self, host: &str, amount_mb: i64) {
        {
            let mut entries = self.entries();
            match entries.get_mut(host) {
                Some(entry) => {
                    entry.outstanding_mb -= amount_mb;
                    tracing::debug!(
                        host,
                        amount_mb,
                        outstanding_mb = entry.outstanding_mb,
                        "Released memory"
                    );
                }
                None => {
                    tracing::debug!(host, amount_mb, "Release for host without reservations");
                    return;
                }
            }
        }
        self.released.notify_waiters();
    }

    /// Whether `additional_mb` more fits on the host. Hosts never reserved on are accepted.
    pub fn can_accept(&self, host: &str, additional_mb: i64) -> bool {
        match self.entries().get(host) {
            Some(entry) => entry.installed_mb() > entry.outstanding_mb + additional_mb,
            None => true,
        }
    }

    pub fn outstanding(&self, host: &str) -> Option<i64> {
        self.entries().get(host).map(|e| e.outstanding_mb)
    }

    pub fn snapshot(&self) -> Vec<Reservation> {
        let mut reservations: Vec<_> = self.entries().values().cloned().collect();
        reservations.sort_by(|a, b| a.node.hostname.cmp(&b.node.hostname));
        reservations
    }

    /// Resolves on the next `release`. Registered as soon as it is created, so create it
    /// before checking `can_accept` to avoid missing a wakeup.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Flavor;
    use std::sync::Arc;

    fn node(name: &str, memory_gb: u64) -> NodeDescription {
        NodeDescription::new(
            name,
            Flavor {
                cpus: 4,
                memory_gb,
                disk_gb: 100,
            },
        )
    }

    #[test]
    fn test_unknown_host_is_accepted() {
        let ledger = ResourceLedger::new();
        assert!(ledger.can_accept("nowhere", i64::MAX / 2));
        assert_eq!(ledger.outstanding("nowhere"), None);
    }

    #[test]
    fn test_release_without_reserve_is_noop() {
        let ledger = ResourceLedger::new();
        ledger.release("nowhere", 100);
        assert_eq!(ledger.outstanding("nowhere"), None);
        assert!(ledger.snapshot().is_empty());
    }

    #[test]
    fn test_conservation() {
        let ledger = ResourceLedger::new();
        let n = node("n1", 8);
        let ops: [(bool, i64); 6] = [
            (true, 1000),
            (true, 500),
            (false, 1000),
            (true, 250),
            (false, 500),
            (true, 4000),
        ];
        let mut net = 0;
        for (reserve, amount) in ops {
            if reserve {
                ledger.reserve(&n, amount);
                net += amount;
            } else {
                ledger.release("n1", amount);
                net -= amount;
            }
        }
        assert_eq!(ledger.outstanding("n1"), Some(net));
    }

    #[test]
    fn test_can_accept_boundary() {
        let ledger = ResourceLedger::new();
        let n = node("n1", 1); // 1024 MB installed
        ledger.reserve(&n, 512);
        assert!(ledger.can_accept("n1", 511));
        // outstanding + requested == installed is refused.
        assert!(!ledger.can_accept("n1", 512));
        assert!(!ledger.can_accept("n1", 2048));
        ledger.release("n1", 512);
        assert!(ledger.can_accept("n1", 1023));
        assert!(!ledger.can_accept("n1", 1024));
    }

    #[test]
    fn test_release_may_go_negative() {
        let ledger = ResourceLedger::new();
        let n = node("n1", 1);
        ledger.reserve(&n, 100);
        ledger.release("n1", 300);
        assert_eq!(ledger.outstanding("n1"), Some(-200));
    }

    #[test]
    fn test_concurrent_reserve_release() {
        let ledger = Arc::new(ResourceLedger::new());
        let n = node("n1", 64);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let n = n.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        ledger.reserve(&n, 3);
                        ledger.release("n1", 3);
                    }
                    ledger.reserve(&n, 1);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.outstanding("n1"), Some(8));
    }

    #[tokio::test]
    async fn test_release_wakes_waiters() {
        let ledger = Arc::new(ResourceLedger::new());
        let n = node("n1", 1);
        ledger.reserve(&n, 1024);
        let waiter = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                loop {
                    let released = ledger.released();
                    if ledger.can_accept("n1", 100) {
                        return;
                    }
                    released.await;
                }
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        ledger.release("n1", 1024);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
