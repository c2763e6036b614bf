//! Broker liveness tracking.
//!
//! Brokers heartbeat the controller; a master that stops is detected by a
//! periodic scan which then kicks off an election for its group.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::registry::ReplicaRegistry;

#[derive(Clone, Debug)]
pub struct BrokerAliveInfo {
    pub broker_name: String,
    pub last_heartbeat_ms: u64,
    pub max_phy_offset: i64,
}

#[derive(Debug)]
pub struct BrokerLivenessTracker {
    timeout_ms: u64,
    inner: Mutex<HashMap<String, BrokerAliveInfo>>,
}

impl BrokerLivenessTracker {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn on_heartbeat(
        &self,
        broker_address: &str,
        broker_name: &str,
        max_phy_offset: i64,
        now_ms: u64,
    ) {
        let mut inner = self.inner.lock();
        inner.insert(
            broker_address.to_string(),
            BrokerAliveInfo {
                broker_name: broker_name.to_string(),
                last_heartbeat_ms: now_ms,
                max_phy_offset,
            },
        );
    }

    /// A broker that never heartbeated is not alive.
    pub fn is_alive(&self, broker_address: &str, now_ms: u64) -> bool {
        let inner = self.inner.lock();
        inner
            .get(broker_address)
            .map(|info| now_ms.saturating_sub(info.last_heartbeat_ms) < self.timeout_ms)
            .unwrap_or(false)
    }

    pub fn last_info(&self, broker_address: &str) -> Option<BrokerAliveInfo> {
        self.inner.lock().get(broker_address).cloned()
    }

    /// Groups that need an election: the recorded master went quiet, or
    /// the group is masterless while some replica is alive to take over.
    pub fn scan_needs_election(&self, registry: &ReplicaRegistry, now_ms: u64) -> Vec<String> {
        registry
            .infos()
            .filter(|info| {
                if info.has_master() {
                    !self.is_alive(info.master_address(), now_ms)
                } else {
                    info.replica_set()
                        .keys()
                        .any(|addr| self.is_alive(addr, now_ms))
                }
            })
            .map(|info| info.broker_name().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use hamq_rpc_types::RegisterBrokerRequest;

    use super::*;

    #[test]
    fn test_liveness_window() {
        let tracker = BrokerLivenessTracker::new(10_000);
        tracker.on_heartbeat("a:9000", "broker1", 0, 1_000);

        assert!(tracker.is_alive("a:9000", 5_000));
        assert!(!tracker.is_alive("a:9000", 11_000));
        assert!(!tracker.is_alive("a:9001", 5_000));
    }

    #[test]
    fn test_scan_flags_quiet_master() {
        let mut registry = ReplicaRegistry::new();
        let result = registry.handle_register_broker(&RegisterBrokerRequest {
            cluster_name: "cluster".into(),
            broker_name: "broker1".into(),
            broker_address: "a:9000".into(),
            broker_ha_address: None,
        });
        for ev in &result.events {
            registry.apply_event(ev);
        }

        let tracker = BrokerLivenessTracker::new(10_000);
        tracker.on_heartbeat("a:9000", "broker1", 0, 1_000);

        assert!(tracker.scan_needs_election(&registry, 5_000).is_empty());
        assert_eq!(
            tracker.scan_needs_election(&registry, 20_000),
            vec!["broker1".to_string()]
        );
    }
}
