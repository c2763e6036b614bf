//! Pure request handlers over the replica metadata table.
//!
//! Every handler reads current state and returns a [`ControllerResult`]:
//! the events to commit, the response to send, and the response code.  No
//! handler mutates anything; [`ReplicaRegistry::apply_event`] is the only
//! writer and is fed committed events in order.

use std::collections::{BTreeMap, BTreeSet};

use hamq_primitives::prelude::*;
use hamq_rpc_types::{
    AlterSyncStateSetRequest, AlterSyncStateSetResponse, BrokerTableEntry, ElectMasterRequest,
    ElectMasterResponse, GetReplicaInfoRequest, GetReplicaInfoResponse, RegisterBrokerRequest,
    RegisterBrokerResponse, SyncStateSet,
};
use hamq_state::{operation, RegistryEvent, ReplicaInfo};
use tracing::*;

/// Outcome of one request: events for the consensus layer to commit, the
/// response for the caller, and the code summarizing validation.
#[derive(Clone, Debug)]
pub struct ControllerResult<R> {
    pub events: Vec<RegistryEvent>,
    pub response: R,
    pub error_code: ReplicaErrorCode,
}

impl<R> ControllerResult<R> {
    fn ok(events: Vec<RegistryEvent>, response: R) -> Self {
        Self {
            events,
            response,
            error_code: ReplicaErrorCode::None,
        }
    }

    fn rejected(error_code: ReplicaErrorCode, response: R) -> Self {
        Self {
            events: Vec::new(),
            response,
            error_code,
        }
    }
}

/// The in-memory replica metadata table.
#[derive(Debug, Default)]
pub struct ReplicaRegistry {
    table: BTreeMap<String, ReplicaInfo>,
}

fn identity(info: &ReplicaInfo, address: &str) -> String {
    format!(
        "{}/{}/{}",
        info.cluster_name(),
        info.broker_name(),
        info.broker_id_of(address)
    )
}

fn broker_table(info: &ReplicaInfo) -> BTreeMap<String, BrokerTableEntry> {
    info.replica_set()
        .iter()
        .map(|(address, broker_id)| {
            (
                identity(info, address),
                BrokerTableEntry {
                    broker_id: *broker_id,
                    broker_address: address.clone(),
                },
            )
        })
        .collect()
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, broker_name: &str) -> Option<&ReplicaInfo> {
        self.table.get(broker_name)
    }

    pub fn broker_names(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(|s| s.as_str())
    }

    pub fn infos(&self) -> impl Iterator<Item = &ReplicaInfo> {
        self.table.values()
    }

    /// Applies one committed event.  This is the only mutation path.
    pub fn apply_event(&mut self, event: &RegistryEvent) {
        debug!(?event, "applying registry event");
        operation::apply_event(&mut self.table, event);
    }

    /// Registers a broker replica.  The first replica of a masterless
    /// group is elected master in the same breath, so a fresh cluster
    /// bootstraps from a single call.
    pub fn handle_register_broker(
        &self,
        req: &RegisterBrokerRequest,
    ) -> ControllerResult<RegisterBrokerResponse> {
        let ha_address = req.broker_ha_address.clone().unwrap_or_default();

        let (broker_id, known_address, info) = match self.table.get(&req.broker_name) {
            Some(info) => {
                let existing = info.broker_id_of(&req.broker_address);
                if existing != UNKNOWN_BROKER_ID {
                    (existing, true, Some(info))
                } else {
                    (info.next_broker_id(), false, Some(info))
                }
            }
            None => (1, false, None),
        };

        let mut events = Vec::new();
        if !known_address {
            events.push(RegistryEvent::BrokerRegistered {
                cluster_name: req.cluster_name.clone(),
                broker_name: req.broker_name.clone(),
                broker_address: req.broker_address.clone(),
                broker_ha_address: ha_address.clone(),
                broker_id,
            });
        }

        // A group without a master takes whoever shows up.
        let masterless = info.map(|i| !i.has_master()).unwrap_or(true);
        let (master_address, master_epoch, ss_epoch, master_ha_address) = if masterless {
            let cur_master_epoch = info.map(|i| i.master_epoch()).unwrap_or(0);
            let cur_ss_epoch = info.map(|i| i.sync_state_set_epoch()).unwrap_or(0);
            let new_epoch = cur_master_epoch + 1;
            let new_ss_epoch = cur_ss_epoch + 1;
            info!(
                broker_name = %req.broker_name,
                address = %req.broker_address,
                epoch = %new_epoch,
                "electing registering broker as master"
            );
            events.push(RegistryEvent::MasterElected {
                broker_name: req.broker_name.clone(),
                new_master_address: req.broker_address.clone(),
                master_epoch: new_epoch,
                sync_state_set: [req.broker_address.clone()].into(),
                sync_state_set_epoch: new_ss_epoch,
                new_master_elected: true,
            });
            let ha = (!ha_address.is_empty()).then(|| ha_address.clone());
            (req.broker_address.clone(), new_epoch, new_ss_epoch, ha)
        } else {
            let info = info.expect("registry: masterful group must exist");
            (
                info.master_address().to_string(),
                info.master_epoch(),
                info.sync_state_set_epoch(),
                info.master_ha_address().map(|s| s.to_string()),
            )
        };

        ControllerResult::ok(
            events,
            RegisterBrokerResponse {
                broker_id,
                master_address,
                master_epoch,
                sync_state_set_epoch: ss_epoch,
                master_ha_address,
            },
        )
    }

    /// Read-only replica metadata fetch.
    pub fn handle_get_replica_info(
        &self,
        req: &GetReplicaInfoRequest,
    ) -> ControllerResult<GetReplicaInfoResponse> {
        let Some(info) = self.table.get(&req.broker_name) else {
            return ControllerResult::rejected(
                ReplicaErrorCode::BrokerNotExist,
                GetReplicaInfoResponse {
                    master_address: String::new(),
                    master_epoch: 0,
                    broker_id: UNKNOWN_BROKER_ID,
                    master_ha_address: None,
                    error_code: ReplicaErrorCode::BrokerNotExist.into(),
                    sync_state_set: SyncStateSet::default(),
                },
            );
        };

        let broker_id = req
            .broker_address
            .as_deref()
            .map(|addr| info.broker_id_of(addr))
            .unwrap_or(UNKNOWN_BROKER_ID);

        ControllerResult::ok(
            Vec::new(),
            GetReplicaInfoResponse {
                master_address: info.master_address().to_string(),
                master_epoch: info.master_epoch(),
                broker_id,
                master_ha_address: info.master_ha_address().map(|s| s.to_string()),
                error_code: ReplicaErrorCode::None.into(),
                sync_state_set: SyncStateSet {
                    sync_state_set: info.sync_state_set().iter().cloned().collect(),
                    sync_state_set_epoch: info.sync_state_set_epoch(),
                },
            },
        )
    }

    /// Validates and stages an in-sync-set change from the master.
    pub fn handle_alter_sync_state_set(
        &self,
        req: &AlterSyncStateSetRequest,
    ) -> ControllerResult<AlterSyncStateSetResponse> {
        let Some(info) = self.table.get(&req.broker_name) else {
            return ControllerResult::rejected(
                ReplicaErrorCode::BrokerNotExist,
                AlterSyncStateSetResponse {
                    error_code: ReplicaErrorCode::BrokerNotExist.into(),
                    sync_state_set: SyncStateSet::default(),
                },
            );
        };

        let current = SyncStateSet {
            sync_state_set: info.sync_state_set().iter().cloned().collect(),
            sync_state_set_epoch: info.sync_state_set_epoch(),
        };
        let reject = |code: ReplicaErrorCode| {
            ControllerResult::rejected(
                code,
                AlterSyncStateSetResponse {
                    error_code: code.into(),
                    sync_state_set: current.clone(),
                },
            )
        };

        if !info.is_master(&req.master_address) {
            return reject(ReplicaErrorCode::NotMaster);
        }
        if req.master_epoch != info.master_epoch() {
            return reject(ReplicaErrorCode::StaleMasterEpoch);
        }
        if req.sync_state_set_epoch != info.sync_state_set_epoch() {
            return reject(ReplicaErrorCode::StaleSyncStateSetEpoch);
        }

        let new_set: BTreeSet<String> = req.new_sync_state_set.iter().cloned().collect();
        let in_replicas = |addr: &String| {
            info.replica_set().contains_key(addr) || *addr == req.master_address
        };
        if new_set.is_empty()
            || !new_set.contains(&req.master_address)
            || !new_set.iter().all(in_replicas)
        {
            return reject(ReplicaErrorCode::InvalidSyncStateSet);
        }

        let new_epoch = info.sync_state_set_epoch() + 1;
        info!(
            broker_name = %req.broker_name,
            ?new_set,
            ss_epoch = %new_epoch,
            "accepting sync state set change"
        );
        ControllerResult::ok(
            vec![RegistryEvent::SyncStateSetAltered {
                broker_name: req.broker_name.clone(),
                sync_state_set: new_set.clone(),
                sync_state_set_epoch: new_epoch,
            }],
            AlterSyncStateSetResponse {
                error_code: ReplicaErrorCode::None.into(),
                sync_state_set: SyncStateSet {
                    sync_state_set: new_set.into_iter().collect(),
                    sync_state_set_epoch: new_epoch,
                },
            },
        )
    }

    /// Picks a new master from the in-sync set, skipping the incumbent and
    /// anything `alive` vetoes.  Candidates are tried in address order so
    /// the choice is deterministic.
    ///
    /// When nobody qualifies the master is cleared but the master epoch is
    /// left alone; the next successful election still gets a fresh term.
    pub fn handle_elect_master(
        &self,
        req: &ElectMasterRequest,
        alive: &dyn Fn(&str) -> bool,
    ) -> ControllerResult<ElectMasterResponse> {
        let Some(info) = self.table.get(&req.broker_name) else {
            return ControllerResult::rejected(
                ReplicaErrorCode::BrokerNotExist,
                ElectMasterResponse {
                    new_master_identity: String::new(),
                    new_master_address: String::new(),
                    master_epoch: 0,
                    sync_state_set_epoch: 0,
                    broker_table: BTreeMap::new(),
                    error_code: ReplicaErrorCode::BrokerNotExist.into(),
                },
            );
        };

        let candidate = info
            .sync_state_set()
            .iter()
            .find(|addr| !info.is_master(addr) && alive(addr));

        match candidate {
            Some(new_master) => {
                let new_epoch = info.master_epoch() + 1;
                let new_ss_epoch = info.sync_state_set_epoch() + 1;
                let sync_state_set: BTreeSet<String> = [new_master.clone()].into();
                info!(
                    broker_name = %req.broker_name,
                    %new_master,
                    epoch = %new_epoch,
                    "elected new master"
                );
                ControllerResult::ok(
                    vec![RegistryEvent::MasterElected {
                        broker_name: req.broker_name.clone(),
                        new_master_address: new_master.clone(),
                        master_epoch: new_epoch,
                        sync_state_set,
                        sync_state_set_epoch: new_ss_epoch,
                        new_master_elected: true,
                    }],
                    ElectMasterResponse {
                        new_master_identity: identity(info, new_master),
                        new_master_address: new_master.clone(),
                        master_epoch: new_epoch,
                        sync_state_set_epoch: new_ss_epoch,
                        broker_table: broker_table(info),
                        error_code: ReplicaErrorCode::None.into(),
                    },
                )
            }
            None => {
                warn!(broker_name = %req.broker_name, "no candidate for master election");
                let mut result = ControllerResult::rejected(
                    ReplicaErrorCode::ElectMasterFailed,
                    ElectMasterResponse {
                        new_master_identity: String::new(),
                        new_master_address: String::new(),
                        master_epoch: info.master_epoch(),
                        sync_state_set_epoch: info.sync_state_set_epoch(),
                        broker_table: broker_table(info),
                        error_code: ReplicaErrorCode::ElectMasterFailed.into(),
                    },
                );
                // The failed election still commits: the dead master's
                // address has to come off the record.
                result.events.push(RegistryEvent::MasterElected {
                    broker_name: req.broker_name.clone(),
                    new_master_address: String::new(),
                    master_epoch: info.master_epoch(),
                    sync_state_set: BTreeSet::new(),
                    sync_state_set_epoch: info.sync_state_set_epoch(),
                    new_master_elected: false,
                });
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const A: &str = "127.0.0.1:9000";
    const B: &str = "127.0.0.1:9001";
    const C: &str = "127.0.0.1:9002";

    fn all_alive(_: &str) -> bool {
        true
    }

    fn register_req(address: &str) -> RegisterBrokerRequest {
        RegisterBrokerRequest {
            cluster_name: "cluster".into(),
            broker_name: "broker1".into(),
            broker_address: address.into(),
            broker_ha_address: Some(format!("{address}-ha")),
        }
    }

    fn commit<R>(registry: &mut ReplicaRegistry, result: &ControllerResult<R>) {
        for ev in &result.events {
            registry.apply_event(ev);
        }
    }

    /// Three replicas registered, A master at epoch 1 with everyone in
    /// sync at ss epoch 1.
    fn three_replica_group() -> ReplicaRegistry {
        let mut registry = ReplicaRegistry::new();
        for (addr, id) in [(A, 1), (B, 2), (C, 3)] {
            registry.apply_event(&RegistryEvent::BrokerRegistered {
                cluster_name: "cluster".into(),
                broker_name: "broker1".into(),
                broker_address: addr.into(),
                broker_ha_address: format!("{addr}-ha"),
                broker_id: id,
            });
        }
        registry.apply_event(&RegistryEvent::MasterElected {
            broker_name: "broker1".into(),
            new_master_address: A.into(),
            master_epoch: 1,
            sync_state_set: [A, B, C].map(String::from).into(),
            sync_state_set_epoch: 1,
            new_master_elected: true,
        });
        registry
    }

    #[test]
    fn test_register_first_broker_becomes_master() {
        let mut registry = ReplicaRegistry::new();
        let result = registry.handle_register_broker(&register_req(A));

        assert_eq!(result.error_code, ReplicaErrorCode::None);
        assert_eq!(result.events.len(), 2);
        assert_eq!(result.response.broker_id, 1);
        assert_eq!(result.response.master_address, A);
        assert_eq!(result.response.master_epoch, 1);
        assert_eq!(result.response.sync_state_set_epoch, 1);

        commit(&mut registry, &result);
        let info = registry.info("broker1").unwrap();
        assert_eq!(info.master_address(), A);
        assert_eq!(info.master_epoch(), 1);
        assert_eq!(info.sync_state_set().len(), 1);
        assert_eq!(info.master_ha_address(), Some(format!("{A}-ha").as_str()));
    }

    #[test]
    fn test_register_second_broker_joins_as_slave() {
        let mut registry = ReplicaRegistry::new();
        let first = registry.handle_register_broker(&register_req(A));
        commit(&mut registry, &first);

        let second = registry.handle_register_broker(&register_req(B));
        assert_eq!(second.response.broker_id, 2);
        assert_eq!(second.response.master_address, A);
        assert_eq!(second.response.master_epoch, 1);
        // Joining doesn't touch the ISR.
        assert_eq!(second.events.len(), 1);
        commit(&mut registry, &second);
        assert!(!registry
            .info("broker1")
            .unwrap()
            .sync_state_set()
            .contains(B));
    }

    #[test]
    fn test_register_idempotent() {
        let mut registry = ReplicaRegistry::new();
        let first = registry.handle_register_broker(&register_req(A));
        commit(&mut registry, &first);
        let before = registry.info("broker1").unwrap().clone();

        let again = registry.handle_register_broker(&register_req(A));
        assert!(again.events.is_empty());
        assert_eq!(again.response.broker_id, 1);
        assert_eq!(again.response.master_address, A);
        commit(&mut registry, &again);
        assert_eq!(registry.info("broker1").unwrap(), &before);
    }

    #[test]
    fn test_elect_master_multiple_candidates() {
        let mut registry = three_replica_group();
        let result = registry.handle_elect_master(
            &ElectMasterRequest {
                broker_name: "broker1".into(),
            },
            &all_alive,
        );

        assert_eq!(result.error_code, ReplicaErrorCode::None);
        // Sorted candidate order makes B the deterministic pick.
        assert_eq!(result.response.new_master_address, B);
        assert_eq!(result.response.master_epoch, 2);
        assert_eq!(result.response.sync_state_set_epoch, 2);
        assert_eq!(result.response.broker_table.len(), 3);

        commit(&mut registry, &result);
        let info = registry.info("broker1").unwrap();
        assert_eq!(info.master_address(), B);
        assert_eq!(
            info.sync_state_set(),
            &[B.to_string()].into_iter().collect()
        );
    }

    #[test]
    fn test_elect_master_skips_dead_candidates() {
        let registry = three_replica_group();
        let only_c = |addr: &str| addr == C;
        let result = registry.handle_elect_master(
            &ElectMasterRequest {
                broker_name: "broker1".into(),
            },
            &only_c,
        );
        assert_eq!(result.response.new_master_address, C);
    }

    #[test]
    fn test_elect_master_no_candidate() {
        let mut registry = three_replica_group();
        // Shrink the ISR to just the master, as if every slave fell out.
        registry.apply_event(&RegistryEvent::SyncStateSetAltered {
            broker_name: "broker1".into(),
            sync_state_set: [A.to_string()].into(),
            sync_state_set_epoch: 2,
        });
        registry.apply_event(&RegistryEvent::MasterElected {
            broker_name: "broker1".into(),
            new_master_address: A.into(),
            master_epoch: 2,
            sync_state_set: [A.to_string()].into(),
            sync_state_set_epoch: 3,
            new_master_elected: true,
        });

        let result = registry.handle_elect_master(
            &ElectMasterRequest {
                broker_name: "broker1".into(),
            },
            &all_alive,
        );

        assert_eq!(result.error_code, ReplicaErrorCode::ElectMasterFailed);
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.response.new_master_address, "");
        // The term is not burned on a failed election.
        assert_eq!(result.response.master_epoch, 2);

        commit(&mut registry, &result);
        let info = registry.info("broker1").unwrap();
        assert!(!info.has_master());
        assert_eq!(info.master_epoch(), 2);
    }

    #[test]
    fn test_alter_sync_state_set_accepted() {
        let mut registry = ReplicaRegistry::new();
        let first = registry.handle_register_broker(&register_req(A));
        commit(&mut registry, &first);
        let second = registry.handle_register_broker(&register_req(B));
        commit(&mut registry, &second);

        let result = registry.handle_alter_sync_state_set(&AlterSyncStateSetRequest {
            broker_name: "broker1".into(),
            master_address: A.into(),
            master_epoch: 1,
            new_sync_state_set: vec![A.into(), B.into()],
            sync_state_set_epoch: 1,
        });
        assert_eq!(result.error_code, ReplicaErrorCode::None);
        assert_eq!(result.response.sync_state_set.sync_state_set_epoch, 2);

        commit(&mut registry, &result);
        let info = registry.info("broker1").unwrap();
        // ISR stays inside the replica set and contains the master.
        assert!(info
            .sync_state_set()
            .iter()
            .all(|a| info.replica_set().contains_key(a)));
        assert!(info.sync_state_set().contains(A));
        assert_eq!(info.sync_state_set_epoch(), 2);
    }

    #[test]
    fn test_alter_sync_state_set_rejections() {
        let mut registry = ReplicaRegistry::new();
        let first = registry.handle_register_broker(&register_req(A));
        commit(&mut registry, &first);
        let second = registry.handle_register_broker(&register_req(B));
        commit(&mut registry, &second);

        let base = AlterSyncStateSetRequest {
            broker_name: "broker1".into(),
            master_address: A.into(),
            master_epoch: 1,
            new_sync_state_set: vec![A.into(), B.into()],
            sync_state_set_epoch: 1,
        };

        struct Case {
            description: &'static str,
            mutate: fn(&mut AlterSyncStateSetRequest),
            expect: ReplicaErrorCode,
        }

        let cases = [
            Case {
                description: "unknown broker group",
                mutate: |req| req.broker_name = "nope".into(),
                expect: ReplicaErrorCode::BrokerNotExist,
            },
            Case {
                description: "requester is not the master",
                mutate: |req| req.master_address = B.into(),
                expect: ReplicaErrorCode::NotMaster,
            },
            Case {
                description: "master epoch behind",
                mutate: |req| req.master_epoch = 0,
                expect: ReplicaErrorCode::StaleMasterEpoch,
            },
            Case {
                description: "sync state set epoch behind",
                mutate: |req| req.sync_state_set_epoch = 0,
                expect: ReplicaErrorCode::StaleSyncStateSetEpoch,
            },
            Case {
                description: "set includes unregistered replica",
                mutate: |req| req.new_sync_state_set.push("127.0.0.1:9999".into()),
                expect: ReplicaErrorCode::InvalidSyncStateSet,
            },
            Case {
                description: "set missing the master",
                mutate: |req| req.new_sync_state_set = vec![B.into()],
                expect: ReplicaErrorCode::InvalidSyncStateSet,
            },
        ];

        for case in cases {
            let mut req = base.clone();
            (case.mutate)(&mut req);
            let result = registry.handle_alter_sync_state_set(&req);
            assert_eq!(result.error_code, case.expect, "{}", case.description);
            assert!(result.events.is_empty(), "{}", case.description);
        }
    }

    #[test]
    fn test_get_replica_info() {
        let mut registry = ReplicaRegistry::new();
        let first = registry.handle_register_broker(&register_req(A));
        commit(&mut registry, &first);

        let result = registry.handle_get_replica_info(&GetReplicaInfoRequest {
            broker_name: "broker1".into(),
            broker_address: Some(A.into()),
        });
        assert_eq!(result.response.master_address, A);
        assert_eq!(result.response.broker_id, 1);
        assert_eq!(
            result.response.master_ha_address.as_deref(),
            Some(format!("{A}-ha").as_str())
        );

        let missing = registry.handle_get_replica_info(&GetReplicaInfoRequest {
            broker_name: "ghost".into(),
            broker_address: None,
        });
        assert_eq!(missing.error_code, ReplicaErrorCode::BrokerNotExist);
    }

    #[test]
    fn test_one_master_per_epoch_across_trace() {
        let mut registry = ReplicaRegistry::new();
        let mut seen: HashMap<u32, String> = HashMap::new();

        let mut observe = |registry: &ReplicaRegistry| {
            let info = registry.info("broker1").unwrap();
            if info.has_master() {
                let prev = seen
                    .entry(info.master_epoch())
                    .or_insert_with(|| info.master_address().to_string());
                assert_eq!(prev, info.master_address(), "two masters in one epoch");
            }
        };

        for addr in [A, B, C] {
            let r = registry.handle_register_broker(&register_req(addr));
            commit(&mut registry, &r);
            observe(&registry);
        }

        // Grow the ISR, fail the master over twice, then lose everyone.
        let grow = registry.handle_alter_sync_state_set(&AlterSyncStateSetRequest {
            broker_name: "broker1".into(),
            master_address: A.into(),
            master_epoch: 1,
            new_sync_state_set: vec![A.into(), B.into(), C.into()],
            sync_state_set_epoch: 1,
        });
        commit(&mut registry, &grow);
        observe(&registry);

        for _ in 0..2 {
            let elect = registry.handle_elect_master(
                &ElectMasterRequest {
                    broker_name: "broker1".into(),
                },
                &all_alive,
            );
            assert_eq!(elect.error_code, ReplicaErrorCode::None);
            commit(&mut registry, &elect);
            observe(&registry);

            // Fresh masters start alone; rebuild the ISR so the next
            // failover has candidates.
            let (master, master_epoch, ss_epoch) = {
                let info = registry.info("broker1").unwrap();
                (
                    info.master_address().to_string(),
                    info.master_epoch(),
                    info.sync_state_set_epoch(),
                )
            };
            let regrow = registry.handle_alter_sync_state_set(&AlterSyncStateSetRequest {
                broker_name: "broker1".into(),
                master_address: master.clone(),
                master_epoch,
                new_sync_state_set: vec![master, A.into(), B.into(), C.into()],
                sync_state_set_epoch: ss_epoch,
            });
            assert_eq!(regrow.error_code, ReplicaErrorCode::None);
            commit(&mut registry, &regrow);
            observe(&registry);
        }

        let dead = registry.handle_elect_master(
            &ElectMasterRequest {
                broker_name: "broker1".into(),
            },
            &|_| false,
        );
        assert_eq!(dead.error_code, ReplicaErrorCode::ElectMasterFailed);
        commit(&mut registry, &dead);
        observe(&registry);
    }
}
