//! Lifecycle controller
//!
//! One operation per runtime lifecycle hook. Operations on different
//! networks run in parallel; allocation within one network is serialized by
//! a per-network lock, join/leave by a per-endpoint lock, and anything that
//! touches the transit network by a single controller-wide transit lock.
//! Lock order: transit, switch, network, veth, endpoint.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use ovsnet_core::naming::{endpoint_mac, endpoint_mac_from_id, logical_port_name, veth_name, veth_peer_name};
use ovsnet_core::{Error, Result};
use ovsnet_store::{endpoint_key, EndpointRecord, NetworkRecord, StateStore};

use crate::ipam::parse_requested;
use crate::options::{IpamMode, NetworkOptions};
use crate::orchestrator::{NetworkPlan, Orchestrator};

/// Capability scope reported to the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Local,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Local => "local",
            Scope::Global => "global",
        }
    }
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Scope::Local),
            "global" => Ok(Scope::Global),
            other => Err(Error::configuration(format!("unknown scope '{}' (local|global)", other))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ControllerSettings {
    pub scope: Scope,
    /// Let networks without connection strings use the local defaults
    pub allow_default_sdn_endpoints: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CreateNetworkRequest {
    pub network_id: String,
    pub options: BTreeMap<String, String>,
    pub ipv4_data: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateEndpointRequest {
    pub network_id: String,
    pub endpoint_id: String,
    /// Requested address, with or without prefix length
    pub address: Option<String>,
    pub mac_address: Option<String>,
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAllocation {
    /// `addr/len`
    pub address: Option<String>,
    pub mac_address: String,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinInfo {
    pub src_name: String,
    pub dst_prefix: String,
    pub gateway: Option<String>,
    pub disable_gateway_service: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub scope: Scope,
    pub connectivity_scope: Scope,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub applied: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub orphaned_endpoints: Vec<String>,
}

/// Lazily created async mutex per key
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().await.entry(key.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// Drop the entry for a key nobody is holding.
    async fn forget(&self, key: &str) {
        let mut locks = self.locks.lock().await;
        if locks.get(key).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
            locks.remove(key);
        }
    }
}

fn allocation_of(endpoint: &EndpointRecord) -> EndpointAllocation {
    EndpointAllocation {
        address: endpoint.ip_address.clone(),
        mac_address: endpoint.mac_address.clone(),
        gateway: endpoint.gateway.clone(),
    }
}

fn endpoint_addr(endpoint: &EndpointRecord) -> Option<Ipv4Addr> {
    endpoint.ip_address.as_deref().and_then(|a| parse_requested(a).ok())
}

fn touches_transit(options: &NetworkOptions) -> bool {
    options.is_transit() || options.transit_network.is_some()
}

pub struct NetworkController {
    store: Arc<dyn StateStore>,
    orchestrator: Orchestrator,
    settings: ControllerSettings,
    network_locks: KeyedLocks,
    endpoint_locks: KeyedLocks,
    /// Held by CreateNetwork so two ids cannot claim one switch
    switch_locks: KeyedLocks,
    /// Host interface names are shortened ids, so distinct endpoints can clash
    veth_locks: KeyedLocks,
    transit_lock: Mutex<()>,
}

impl NetworkController {
    pub fn new(store: Arc<dyn StateStore>, orchestrator: Orchestrator, settings: ControllerSettings) -> Self {
        Self {
            store,
            orchestrator,
            settings,
            network_locks: KeyedLocks::default(),
            endpoint_locks: KeyedLocks::default(),
            switch_locks: KeyedLocks::default(),
            veth_locks: KeyedLocks::default(),
            transit_lock: Mutex::new(()),
        }
    }

    async fn lock_transit(&self, needed: bool) -> Option<MutexGuard<'_, ()>> {
        if needed {
            Some(self.transit_lock.lock().await)
        } else {
            None
        }
    }

    /// Stored networks in plan form; unreadable ones are skipped.
    async fn plans(&self) -> Result<Vec<NetworkPlan>> {
        let mut plans = Vec::new();
        for record in self.store.list_networks().await? {
            match NetworkPlan::from_record(&record) {
                Ok(plan) => plans.push(plan),
                Err(e) => warn!(network_id = %record.id, "Skipping unreadable network record: {}", e),
            }
        }
        Ok(plans)
    }

    /// The transit network a tenant links to, if it names one.
    async fn transit_peer(&self, plan: &NetworkPlan) -> Result<Option<NetworkPlan>> {
        let Some(name) = plan.options.transit_network.as_deref() else {
            return Ok(None);
        };
        self.plans()
            .await?
            .into_iter()
            .find(|p| p.is_transit() && p.answers_to(name))
            .map(Some)
            .ok_or_else(|| Error::precondition(format!("transit network '{}' does not exist", name)))
    }

    async fn addresses_on(&self, network_id: &str) -> Result<BTreeSet<Ipv4Addr>> {
        Ok(self
            .store
            .list_network_endpoints(network_id)
            .await?
            .iter()
            .filter_map(endpoint_addr)
            .collect())
    }

    async fn transit_used(&self, transit: Option<&NetworkPlan>) -> Result<BTreeSet<Ipv4Addr>> {
        match transit {
            Some(t) => self.addresses_on(&t.id).await,
            None => Ok(BTreeSet::new()),
        }
    }

    /// Validate, build topology, then persist. Identical re-creation re-applies
    /// the topology; a different configuration under the same id is refused.
    #[instrument(skip(self, request), fields(network_id = %request.network_id))]
    pub async fn create_network(&self, request: CreateNetworkRequest) -> Result<()> {
        let options = NetworkOptions::parse(&request.options)?;
        options.validate(self.settings.allow_default_sdn_endpoints)?;
        let mut plan = NetworkPlan::new(
            &request.network_id,
            options,
            request.ipv4_data.clone(),
            self.settings.allow_default_sdn_endpoints,
        )?;

        let _transit = self.lock_transit(touches_transit(&plan.options)).await;
        let _switch = self.switch_locks.lock(&plan.switch).await;
        let _network = self.network_locks.lock(&plan.id).await;

        if let Some(existing) = self.store.get_network(&plan.id).await? {
            if !plan.same_configuration(&existing) {
                return Err(Error::precondition(format!(
                    "network {} already exists with a different configuration",
                    plan.id
                )));
            }
            let mut stored = NetworkPlan::from_record(&existing)?;
            let transit = self.transit_peer(&stored).await?;
            let used = self.transit_used(transit.as_ref()).await?;
            self.orchestrator.ensure_control_plane(&mut stored).await?;
            self.orchestrator.apply_network(&stored, transit.as_ref(), &used).await?;
            info!("Network already exists; topology re-applied");
            return Ok(());
        }

        let existing = self.plans().await?;
        if let Some(other) = existing
            .iter()
            .find(|o| o.switch == plan.switch && o.endpoints.northbound == plan.endpoints.northbound)
        {
            return Err(Error::precondition(format!(
                "logical switch {} already belongs to network {}",
                plan.switch, other.id
            )));
        }
        if plan.is_transit() {
            if let Some(other) = existing.into_iter().find(NetworkPlan::is_transit) {
                return Err(Error::precondition(format!(
                    "transit network {} already exists; only one is supported",
                    other.id
                )));
            }
        }
        let transit = self.transit_peer(&plan).await?;
        self.orchestrator.check_live(&plan).await?;

        self.orchestrator.ensure_control_plane(&mut plan).await?;
        let used = self.transit_used(transit.as_ref()).await?;
        self.orchestrator.apply_network(&plan, transit.as_ref(), &used).await?;
        self.store.save_network(&plan.to_record()).await?;

        info!(switch = %plan.switch, bridge = %plan.options.bridge, "Network created");
        Ok(())
    }

    /// Remove an empty network's topology and record. Unknown ids succeed.
    #[instrument(skip(self))]
    pub async fn delete_network(&self, network_id: &str) -> Result<()> {
        let Some(record) = self.store.get_network(network_id).await? else {
            debug!("Network not known; nothing to delete");
            return Ok(());
        };
        let related = NetworkPlan::from_record(&record)
            .map(|p| touches_transit(&p.options))
            .unwrap_or(true);

        let _transit = self.lock_transit(related).await;
        let network = self.network_locks.lock(network_id).await;

        // Re-read under the lock
        let Some(record) = self.store.get_network(network_id).await? else {
            return Ok(());
        };
        let plan = NetworkPlan::from_record(&record)?;

        let endpoints = self.store.list_network_endpoints(network_id).await?;
        if !endpoints.is_empty() {
            return Err(Error::precondition(format!(
                "network {} still has {} endpoint(s)",
                network_id,
                endpoints.len()
            )));
        }

        let others: Vec<NetworkPlan> = self
            .plans()
            .await?
            .into_iter()
            .filter(|p| p.id != plan.id)
            .collect();
        if plan.is_transit() {
            if let Some(tenant) = others.iter().find(|o| {
                o.options
                    .transit_network
                    .as_deref()
                    .map(|name| plan.answers_to(name))
                    .unwrap_or(false)
            }) {
                return Err(Error::precondition(format!(
                    "transit network {} is still used by network {}",
                    network_id, tenant.id
                )));
            }
        }
        let transit = plan.options.transit_network.as_deref().and_then(|name| {
            others
                .iter()
                .find(|o| o.is_transit() && o.answers_to(name))
                .cloned()
        });

        self.orchestrator
            .teardown_network(&plan, transit.as_ref(), &others)
            .await?;
        self.store.delete_network(network_id).await?;

        drop(network);
        self.network_locks.forget(network_id).await;
        info!("Network deleted");
        Ok(())
    }

    /// Allocate (or validate a requested) address and persist the endpoint
    /// before any data-path change.
    #[instrument(skip(self, request), fields(network_id = %request.network_id, endpoint_id = %request.endpoint_id))]
    pub async fn create_endpoint(&self, request: CreateEndpointRequest) -> Result<EndpointAllocation> {
        let network_id = request.network_id.as_str();
        let endpoint_id = request.endpoint_id.as_str();
        let _network = self.network_locks.lock(network_id).await;

        let record = self
            .store
            .get_network(network_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("network {}", network_id)))?;
        let plan = NetworkPlan::from_record(&record)?;

        let requested = request
            .address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(parse_requested)
            .transpose()?;

        if let Some(existing) = self.store.get_endpoint(network_id, endpoint_id).await? {
            if let Some(addr) = requested {
                if endpoint_addr(&existing) != Some(addr) {
                    return Err(Error::conflict(
                        network_id,
                        addr,
                        format!(
                            "endpoint {} already holds {}",
                            endpoint_id,
                            existing.ip_address.as_deref().unwrap_or("no address")
                        ),
                    ));
                }
            }
            debug!("Endpoint already exists; returning stored allocation");
            return Ok(allocation_of(&existing));
        }

        let veth = veth_name(endpoint_id);
        let veth_guard = self.veth_locks.lock(&veth).await;
        if let Some(other) = self
            .store
            .list_endpoints()
            .await?
            .into_iter()
            .find(|e| e.veth_name == veth)
        {
            return Err(Error::precondition(format!(
                "interface {} is already used by endpoint {} on network {}",
                veth, other.endpoint_id, other.network_id
            )));
        }

        let used = self.addresses_on(network_id).await?;
        let ip = match (&plan.pool, requested) {
            (Some(pool), Some(addr)) => {
                pool.check_requested(network_id, addr, &used)?;
                Some(addr)
            }
            (Some(pool), None) if plan.options.ipam == IpamMode::Internal => Some(pool.allocate(network_id, &used)?),
            (_, requested) => requested,
        };
        if let Some(addr) = ip {
            if plan.pool.is_none() && used.contains(&addr) {
                return Err(Error::conflict(network_id, addr, "already allocated"));
            }
        }

        let ip_address = ip.map(|addr| match &plan.pool {
            Some(pool) => pool.with_prefix(addr),
            None => request
                .address
                .as_deref()
                .map(str::trim)
                .filter(|a| a.contains('/'))
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}/32", addr)),
        });
        let mac_address = request
            .mac_address
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_lowercase)
            .unwrap_or_else(|| match ip {
                Some(addr) => endpoint_mac(addr),
                None => endpoint_mac_from_id(endpoint_id),
            });

        let endpoint = EndpointRecord {
            network_id: network_id.to_string(),
            endpoint_id: endpoint_id.to_string(),
            container_id: request.container_id.clone().unwrap_or_default(),
            veth_name: veth.clone(),
            ip_address,
            mac_address,
            gateway: plan.pool.as_ref().map(|p| p.gateway.to_string()),
            ovn_port: Some(logical_port_name(endpoint_id)),
            sandbox_key: None,
        };
        self.store.save_endpoint(&endpoint).await?;
        drop(veth_guard);
        self.veth_locks.forget(&veth).await;

        info!(
            address = endpoint.ip_address.as_deref().unwrap_or("-"),
            mac = %endpoint.mac_address,
            "Endpoint created"
        );
        Ok(allocation_of(&endpoint))
    }

    /// Remove data-path wiring and logical port, then the record. Unknown
    /// endpoints succeed.
    #[instrument(skip(self))]
    pub async fn delete_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<()> {
        let _network = self.network_locks.lock(network_id).await;
        let key = endpoint_key(network_id, endpoint_id);
        let endpoint_guard = self.endpoint_locks.lock(&key).await;

        let Some(endpoint) = self.store.get_endpoint(network_id, endpoint_id).await? else {
            debug!("Endpoint not known; nothing to delete");
            return Ok(());
        };
        match self.store.get_network(network_id).await? {
            Some(record) => {
                let plan = NetworkPlan::from_record(&record)?;
                self.orchestrator.remove_endpoint(&plan, &endpoint).await?;
            }
            None => warn!("Owning network is gone; removing endpoint record only"),
        }
        self.store.delete_endpoint(network_id, endpoint_id).await?;

        drop(endpoint_guard);
        self.endpoint_locks.forget(&key).await;
        info!("Endpoint deleted");
        Ok(())
    }

    /// Wire the endpoint into the bridge and the logical switch. Re-joining a
    /// joined endpoint changes nothing.
    #[instrument(skip(self))]
    pub async fn join(&self, network_id: &str, endpoint_id: &str, sandbox_key: &str) -> Result<JoinInfo> {
        let _endpoint = self.endpoint_locks.lock(&endpoint_key(network_id, endpoint_id)).await;

        let record = self
            .store
            .get_network(network_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("network {}", network_id)))?;
        let mut endpoint = self
            .store
            .get_endpoint(network_id, endpoint_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("endpoint {} on network {}", endpoint_id, network_id)))?;
        let plan = NetworkPlan::from_record(&record)?;

        if self.orchestrator.is_joined(&endpoint).await? {
            debug!("Endpoint already joined");
        } else {
            self.orchestrator.attach_endpoint(&plan, &endpoint).await?;
            info!(sandbox = sandbox_key, "Endpoint joined");
        }

        let sandbox = Some(sandbox_key.to_string()).filter(|s| !s.is_empty());
        if endpoint.sandbox_key != sandbox {
            endpoint.sandbox_key = sandbox;
            self.store.save_endpoint(&endpoint).await?;
        }

        Ok(JoinInfo {
            src_name: endpoint.veth_name.clone(),
            dst_prefix: "eth".to_string(),
            gateway: endpoint
                .gateway
                .as_deref()
                .map(|g| g.split('/').next().unwrap_or(g).to_string()),
            disable_gateway_service: plan.options.disables_gateway_service(),
        })
    }

    /// Remove the data-path wiring; the endpoint record stays.
    #[instrument(skip(self))]
    pub async fn leave(&self, network_id: &str, endpoint_id: &str) -> Result<()> {
        let _endpoint = self.endpoint_locks.lock(&endpoint_key(network_id, endpoint_id)).await;

        let (Some(record), Some(mut endpoint)) = (
            self.store.get_network(network_id).await?,
            self.store.get_endpoint(network_id, endpoint_id).await?,
        ) else {
            debug!("Endpoint not known; nothing to leave");
            return Ok(());
        };
        let plan = NetworkPlan::from_record(&record)?;
        self.orchestrator.detach_endpoint(&plan, &endpoint).await?;
        if endpoint.sandbox_key.take().is_some() {
            self.store.save_endpoint(&endpoint).await?;
        }
        info!("Endpoint left");
        Ok(())
    }

    /// Operational data of an endpoint.
    #[instrument(skip(self))]
    pub async fn endpoint_info(&self, network_id: &str, endpoint_id: &str) -> Result<BTreeMap<String, String>> {
        let endpoint = self
            .store
            .get_endpoint(network_id, endpoint_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("endpoint {} on network {}", endpoint_id, network_id)))?;

        let mut info = BTreeMap::new();
        info.insert("mac_address".to_string(), endpoint.mac_address.clone());
        if let Some(ip) = &endpoint.ip_address {
            info.insert("ipv4_address".to_string(), ip.clone());
        }
        if let Some(port) = &endpoint.ovn_port {
            info.insert("ovn_port".to_string(), port.clone());
        }
        if let Some(sandbox) = &endpoint.sandbox_key {
            info.insert("sandbox_key".to_string(), sandbox.clone());
        }
        match self.orchestrator.is_joined(&endpoint).await {
            Ok(true) => {
                info.insert("ovs_port".to_string(), veth_peer_name(endpoint_id));
            }
            Ok(false) => {}
            Err(e) => debug!("Bridge state unavailable: {}", e),
        }
        Ok(info)
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            scope: self.settings.scope,
            connectivity_scope: self.settings.scope,
        }
    }

    /// Re-apply every stored network (transit first) and drop endpoint
    /// records whose network is gone. Failures are reported, not fatal.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let records: Vec<NetworkRecord> = self.store.list_networks().await?;

        let mut plans = Vec::new();
        for record in &records {
            match NetworkPlan::from_record(record) {
                Ok(plan) => plans.push((record.clone(), plan)),
                Err(e) => {
                    warn!(network_id = %record.id, "Cannot reconcile network: {}", e);
                    report.failed.push((record.id.clone(), e.to_string()));
                }
            }
        }
        plans.sort_by_key(|(_, plan)| !plan.is_transit());

        for (record, plan) in &plans {
            let _transit = self.lock_transit(touches_transit(&plan.options)).await;
            let _network = self.network_locks.lock(&plan.id).await;

            let transit = plan.options.transit_network.as_deref().and_then(|name| {
                plans
                    .iter()
                    .map(|(_, p)| p)
                    .find(|p| p.is_transit() && p.answers_to(name))
            });
            let result = async {
                let used = self.transit_used(transit).await?;
                let mut current = plan.clone();
                self.orchestrator.ensure_control_plane(&mut current).await?;
                self.orchestrator.apply_network(&current, transit, &used).await?;
                let updated = current.to_record();
                if &updated != record {
                    self.store.save_network(&updated).await?;
                }
                Ok::<_, Error>(())
            }
            .await;

            match result {
                Ok(()) => report.applied.push(plan.id.clone()),
                Err(e) => {
                    warn!(network_id = %plan.id, "Reconcile failed: {}", e);
                    report.failed.push((plan.id.clone(), e.to_string()));
                }
            }
        }

        let known: BTreeSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        for endpoint in self.store.list_endpoints().await? {
            if !known.contains(endpoint.network_id.as_str()) {
                self.store
                    .delete_endpoint(&endpoint.network_id, &endpoint.endpoint_id)
                    .await?;
                warn!(endpoint_id = %endpoint.endpoint_id, "Removed endpoint of unknown network {}", endpoint.network_id);
                report.orphaned_endpoints.push(endpoint.key());
            }
        }

        info!(
            applied = report.applied.len(),
            failed = report.failed.len(),
            orphaned = report.orphaned_endpoints.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }
}
