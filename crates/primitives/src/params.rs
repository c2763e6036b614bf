//! Runtime configuration for brokers and the controller.

use std::path::PathBuf;

use serde::Deserialize;

/// Broker-side configuration.  Loaded from TOML by the broker binary; the
/// periods here drive the metadata-sync and ISR-maintenance tasks.
#[derive(Clone, Debug, Deserialize)]
pub struct BrokerConfig {
    pub cluster_name: String,
    pub broker_name: String,

    /// Address other replicas and the controller reach this broker at.
    pub broker_address: String,

    /// Listen address for the replication transport.
    pub ha_listen_address: String,

    /// Controller candidates; whichever self-identifies as leader wins.
    pub controller_addrs: Vec<String>,

    /// Directory holding the epoch log and other local state.
    pub datadir: PathBuf,

    /// How often to re-discover the controller leader (ms).
    pub sync_controller_metadata_period_ms: u64,

    /// How often to pull this broker's replica metadata (ms).
    pub sync_broker_metadata_period_ms: u64,

    /// How often the master reconciles the in-sync set (ms).
    pub check_sync_state_set_period_ms: u64,

    /// Slave offset-report/heartbeat interval (ms).
    pub ha_send_heartbeat_interval_ms: u64,

    /// Close a replication connection after this long without a read (ms).
    pub ha_housekeeping_interval_ms: u64,

    /// Max bytes a slave may trail the master and still count as in sync.
    pub ha_in_sync_lag_bytes: u64,

    /// Bytes per transfer message from master to slave.
    pub ha_transfer_batch_bytes: usize,

    /// Expected size of the replica group.
    pub total_replicas: u32,

    /// Minimum in-sync replicas the group aims for.
    pub in_sync_replicas: u32,

    /// When a slave starts with an empty log, begin syncing from the
    /// master's current tail instead of offset zero.
    pub sync_from_last_file: bool,

    /// Run under controller coordination from startup rather than with a
    /// statically configured role.
    pub startup_controller_mode: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            cluster_name: "DefaultCluster".to_string(),
            broker_name: "broker-a".to_string(),
            broker_address: "127.0.0.1:10911".to_string(),
            ha_listen_address: "127.0.0.1:10912".to_string(),
            controller_addrs: vec!["127.0.0.1:9878".to_string()],
            datadir: PathBuf::from("hamq-data"),
            sync_controller_metadata_period_ms: 10_000,
            sync_broker_metadata_period_ms: 5_000,
            check_sync_state_set_period_ms: 5_000,
            ha_send_heartbeat_interval_ms: 5_000,
            ha_housekeeping_interval_ms: 20_000,
            ha_in_sync_lag_bytes: 256 * 1024,
            ha_transfer_batch_bytes: 64 * 1024,
            total_replicas: 3,
            in_sync_replicas: 2,
            sync_from_last_file: false,
            startup_controller_mode: true,
        }
    }
}

impl BrokerConfig {
    /// Parses the `";"`-separated controller address list accepted on the
    /// command line.
    pub fn parse_controller_addrs(raw: &str) -> Vec<String> {
        raw.split(';')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }
}

/// Controller-side configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ControllerConfig {
    /// RPC listen address.
    pub listen_address: String,

    /// Directory holding the durable event log.
    pub datadir: PathBuf,

    /// A master that hasn't heartbeated within this window is considered
    /// dead and a re-election is triggered (ms).
    pub broker_inactive_timeout_ms: u64,

    /// How often to scan for inactive masters (ms).
    pub scan_inactive_period_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:9878".to_string(),
            datadir: PathBuf::from("hamq-controller-data"),
            broker_inactive_timeout_ms: 10_000,
            scan_inactive_period_ms: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_controller_addrs() {
        let addrs = BrokerConfig::parse_controller_addrs("127.0.0.1:9878; 127.0.0.1:9879;");
        assert_eq!(addrs, vec!["127.0.0.1:9878", "127.0.0.1:9879"]);
    }
}
