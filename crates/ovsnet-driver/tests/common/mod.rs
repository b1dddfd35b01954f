#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use ovsnet_driver::{
    ControllerSettings, CreateEndpointRequest, CreateNetworkRequest, MemoryProvisioner, NetworkController,
    Orchestrator, OrchestratorSettings,
};
use ovsnet_network::{MemoryBridge, MemoryLinks, MemoryTopology};
use ovsnet_store::{FileStore, RecoveryPolicy};

pub const NB: &str = "tcp:192.168.100.5:6641";
pub const SB: &str = "tcp:192.168.100.5:6642";

/// Controller over a temp-dir store and in-memory backends
pub struct TestEnv {
    pub dir: TempDir,
    pub store: Arc<FileStore>,
    pub bridge: Arc<MemoryBridge>,
    pub topology: Arc<MemoryTopology>,
    pub links: Arc<MemoryLinks>,
    pub provisioner: Arc<MemoryProvisioner>,
    pub controller: Arc<NetworkController>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::open(TempDir::new().unwrap(), RecoveryPolicy::Lenient, MemoryProvisioner::reachable())
    }

    pub fn with_provisioner(provisioner: MemoryProvisioner) -> Self {
        Self::open(TempDir::new().unwrap(), RecoveryPolicy::Lenient, provisioner)
    }

    pub fn open(dir: TempDir, policy: RecoveryPolicy, provisioner: MemoryProvisioner) -> Self {
        let store = Arc::new(FileStore::open(dir.path(), policy).unwrap());
        let bridge = Arc::new(MemoryBridge::new());
        let topology = Arc::new(MemoryTopology::new());
        let links = Arc::new(MemoryLinks::new());
        let provisioner = Arc::new(provisioner);
        let orchestrator = Orchestrator::new(
            bridge.clone(),
            links.clone(),
            Arc::new(topology.clone()),
            provisioner.clone(),
            OrchestratorSettings {
                ready_attempts: 3,
                ready_interval: Duration::from_millis(1),
                ..OrchestratorSettings::default()
            },
        );
        let controller = Arc::new(NetworkController::new(
            store.clone(),
            orchestrator,
            ControllerSettings::default(),
        ));
        Self {
            dir,
            store,
            bridge,
            topology,
            links,
            provisioner,
            controller,
        }
    }

    /// Every mutating backend call so far, across all three backends.
    pub fn mutations(&self) -> Vec<String> {
        let mut all = self.bridge.mutations();
        all.extend(self.topology.mutations());
        all.extend(self.links.mutations());
        all
    }
}

pub fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub fn pool(subnet: &str, gateway: &str) -> Value {
    json!([{"AddressSpace": "", "Pool": subnet, "Gateway": gateway}])
}

pub fn tenant_network(id: &str, switch: &str, subnet: &str, gateway: &str) -> CreateNetworkRequest {
    CreateNetworkRequest {
        network_id: id.to_string(),
        options: options(&[
            ("bridge", "br-int"),
            ("ovn.switch", switch),
            ("ovn.nb_connection", NB),
            ("ovn.sb_connection", SB),
        ]),
        ipv4_data: Some(pool(subnet, gateway)),
    }
}

pub fn transit_network(id: &str) -> CreateNetworkRequest {
    CreateNetworkRequest {
        network_id: id.to_string(),
        options: options(&[
            ("ovn.role", "transit"),
            ("ovn.external_gateway", "100.64.0.254"),
            ("ovn.nb_connection", NB),
            ("ovn.sb_connection", SB),
        ]),
        ipv4_data: Some(pool("100.64.0.0/24", "100.64.0.1/24")),
    }
}

pub fn endpoint(network_id: &str, endpoint_id: &str) -> CreateEndpointRequest {
    CreateEndpointRequest {
        network_id: network_id.to_string(),
        endpoint_id: endpoint_id.to_string(),
        ..CreateEndpointRequest::default()
    }
}
