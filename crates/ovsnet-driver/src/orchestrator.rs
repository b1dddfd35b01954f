//! Topology orchestrator
//!
//! Translates a validated network into an ordered sequence of "ensure" calls
//! on the bridge, link and logical-topology adapters. Every step re-reads
//! live state through the adapters, so applying the same plan twice
//! converges instead of failing.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use ovsnet_core::naming::{
    self, logical_port_name, mirror_name, router_mac, router_switch_port, switch_router_port, transit_router_port,
    transit_switch_port, veth_peer_name, GATEWAY_ROUTER,
};
use ovsnet_core::{Backend, Error, Result};
use ovsnet_network::{
    BridgeAdapter, ChassisConfig, DbEndpoint, LinkManager, LogicalTopology, OvsError, PortConfig, SwitchPortSpec,
    TopologyConnector,
};
use ovsnet_store::{EndpointRecord, NetworkRecord};

use crate::ipam::{parse_requested, AddressPool};
use crate::options::{self, DhcpMode, NetworkOptions, SdnEndpoints};
use crate::provision::ControlPlaneProvisioner;

/// First host offset considered for tenant-to-transit link addresses
pub const TRANSIT_LINK_OFFSET: u32 = 10;

const DEFAULT_ROUTE: &str = "0.0.0.0/0";
const DHCP_LEASE_TIME: &str = "3600";

fn bridge_err(e: OvsError) -> Error {
    e.into_error(Backend::Bridge)
}

fn sdn_err(e: OvsError) -> Error {
    e.into_error(Backend::Sdn)
}

fn link_err(e: OvsError) -> Error {
    e.into_error(Backend::Link)
}

fn ids(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn network_ids(network_id: &str) -> BTreeMap<String, String> {
    ids(&[("network_id", network_id)])
}

/// What a logical switch port is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortKind {
    /// A container endpoint
    Tenant {
        mac: String,
        ip: Option<Ipv4Addr>,
        port_security: bool,
    },
    /// Peer of a logical router port
    Router { router_port: String },
}

impl PortKind {
    pub fn into_spec(self, name: &str, external_ids: BTreeMap<String, String>) -> SwitchPortSpec {
        match self {
            PortKind::Tenant { mac, ip, port_security } => {
                let address = match ip {
                    Some(ip) => format!("{} {}", mac, ip),
                    None => mac,
                };
                SwitchPortSpec {
                    name: name.to_string(),
                    addresses: vec![address.clone()],
                    port_security: if port_security { vec![address] } else { Vec::new() },
                    port_type: String::new(),
                    options: BTreeMap::new(),
                    external_ids,
                }
            }
            // Router peers are trusted: reserved address keyword, no port security
            PortKind::Router { router_port } => SwitchPortSpec {
                name: name.to_string(),
                addresses: vec!["router".to_string()],
                port_security: Vec::new(),
                port_type: "router".to_string(),
                options: ids(&[("router-port", router_port.as_str())]),
                external_ids,
            },
        }
    }
}

/// A network in resolved form: typed options, pool, switch and endpoints
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkPlan {
    pub id: String,
    pub options: NetworkOptions,
    pub pool: Option<AddressPool>,
    pub ipam_data: Option<Value>,
    pub switch: String,
    pub endpoints: SdnEndpoints,
}

impl NetworkPlan {
    /// Plan for a network about to be created; options already validated.
    pub fn new(
        id: &str,
        options: NetworkOptions,
        ipam_data: Option<Value>,
        allow_default_endpoints: bool,
    ) -> Result<Self> {
        let pool = match &ipam_data {
            Some(data) => AddressPool::from_ipam_data(data)?,
            None => None,
        };

        if pool.is_none() {
            if options.dhcp == DhcpMode::Sdn {
                return Err(Error::configuration(format!(
                    "{}=ovn needs an IPv4 subnet",
                    options::DHCP
                )));
            }
            if options.is_transit() {
                return Err(Error::configuration("a transit network needs an IPv4 subnet"));
            }
            if options.router.is_some() || options.transit_network.is_some() {
                return Err(Error::configuration(format!(
                    "{} and {} need an IPv4 subnet",
                    options::OVN_ROUTER,
                    options::OVN_TRANSIT_NETWORK
                )));
            }
        }

        let switch = match (&options.switch, options.is_transit()) {
            (Some(switch), _) => switch.clone(),
            (None, true) => naming::transit_switch_name(id),
            (None, false) => {
                return Err(Error::configuration(format!(
                    "{} is required for a tenant network",
                    options::OVN_SWITCH
                )))
            }
        };
        let endpoints = options.sdn_endpoints(allow_default_endpoints)?;

        Ok(Self {
            id: id.to_string(),
            options,
            pool,
            ipam_data,
            switch,
            endpoints,
        })
    }

    /// Plan of a stored network. Stored options are not re-validated.
    pub fn from_record(record: &NetworkRecord) -> Result<Self> {
        let options = NetworkOptions::parse(&record.options)?;
        let pool = match &record.ipam_data {
            Some(data) => AddressPool::from_ipam_data(data)?,
            None => None,
        };
        let switch = record
            .ovn_switch
            .clone()
            .or_else(|| options.switch.clone())
            .unwrap_or_else(|| naming::transit_switch_name(&record.id));
        // Stored without connection strings means created with defaults allowed
        let endpoints = options.sdn_endpoints(true)?;
        Ok(Self {
            id: record.id.clone(),
            options,
            pool,
            ipam_data: record.ipam_data.clone(),
            switch,
            endpoints,
        })
    }

    pub fn to_record(&self) -> NetworkRecord {
        NetworkRecord {
            id: self.id.clone(),
            name: self.id.clone(),
            bridge: self.options.bridge.clone(),
            vlan: self.options.vlan,
            tenant_id: self.options.tenant_id.clone(),
            ovn_switch: Some(self.switch.clone()),
            ovn_router: self.router(),
            options: self.options.to_map(),
            ipam_data: self.ipam_data.clone(),
        }
    }

    pub fn is_transit(&self) -> bool {
        self.options.is_transit()
    }

    /// Tenant router: the declared one, or a derived one when linking to transit.
    pub fn router(&self) -> Option<String> {
        if self.is_transit() {
            return None;
        }
        self.options.router.clone().or_else(|| {
            self.options
                .transit_network
                .as_ref()
                .map(|_| naming::tenant_router_name(&self.switch))
        })
    }

    /// Whether `name` (as used in `ovn.transit_network`) designates this network.
    pub fn answers_to(&self, name: &str) -> bool {
        self.id == name || self.switch == name
    }

    /// Same configuration as a stored record. Connection strings rewritten by
    /// auto-provisioning are not compared.
    pub fn same_configuration(&self, record: &NetworkRecord) -> bool {
        let Ok(stored) = NetworkPlan::from_record(record) else {
            return false;
        };
        let mut mine = self.options.to_map();
        let mut theirs = stored.options.to_map();
        if self.options.auto_create {
            for key in [options::OVN_NB_CONNECTION, options::OVN_SB_CONNECTION] {
                mine.remove(key);
                theirs.remove(key);
            }
        }
        mine == theirs && self.pool == stored.pool && self.switch == stored.switch
    }

    fn switch_ids(&self) -> BTreeMap<String, String> {
        let mut map = network_ids(&self.id);
        if let Some(tenant) = &self.options.tenant_id {
            map.insert("tenant_id".to_string(), tenant.clone());
        }
        if self.is_transit() {
            map.insert("role".to_string(), "transit".to_string());
        }
        map
    }

    fn endpoint_ids(&self, endpoint: &EndpointRecord) -> BTreeMap<String, String> {
        let mut map = network_ids(&self.id);
        map.insert("endpoint_id".to_string(), endpoint.endpoint_id.clone());
        if let Some(tenant) = &self.options.tenant_id {
            map.insert("tenant_id".to_string(), tenant.clone());
        }
        map
    }
}

/// DHCP server options for a subnet
pub fn dhcp_server_options(pool: &AddressPool, dns_server: Option<Ipv4Addr>) -> BTreeMap<String, String> {
    let gateway = pool.gateway.to_string();
    let mut opts = ids(&[
        ("lease_time", DHCP_LEASE_TIME),
        ("router", gateway.as_str()),
        ("server_id", gateway.as_str()),
    ]);
    opts.insert("server_mac".to_string(), router_mac(pool.gateway));
    if let Some(dns) = dns_server {
        opts.insert("dns_server".to_string(), dns.to_string());
    }
    opts
}

fn endpoint_ip(endpoint: &EndpointRecord) -> Option<Ipv4Addr> {
    endpoint
        .ip_address
        .as_deref()
        .and_then(|a| parse_requested(a).ok())
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_management_network: String,
    pub ready_attempts: u32,
    pub ready_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_management_network: "transit-overlay".to_string(),
            ready_attempts: 30,
            ready_interval: Duration::from_secs(1),
        }
    }
}

/// Drives the adapters for network and endpoint lifecycle steps
pub struct Orchestrator {
    bridge: Arc<dyn BridgeAdapter>,
    links: Arc<dyn LinkManager>,
    topology: Arc<dyn TopologyConnector>,
    provisioner: Arc<dyn ControlPlaneProvisioner>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        bridge: Arc<dyn BridgeAdapter>,
        links: Arc<dyn LinkManager>,
        topology: Arc<dyn TopologyConnector>,
        provisioner: Arc<dyn ControlPlaneProvisioner>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            bridge,
            links,
            topology,
            provisioner,
            settings,
        }
    }

    fn northbound(&self, plan: &NetworkPlan) -> Arc<dyn LogicalTopology> {
        self.topology.northbound(&plan.endpoints.northbound)
    }

    /// Read-only checks against live state, run before any mutation.
    pub async fn check_live(&self, plan: &NetworkPlan) -> Result<()> {
        let opts = &plan.options;
        if opts.mirror_ports.is_empty() {
            return Ok(());
        }
        let Some(dest) = opts.mirror_dest.as_deref() else {
            return Ok(());
        };
        let exists = self.bridge.bridge_exists(&opts.bridge).await.map_err(bridge_err)?
            && self
                .bridge
                .list_ports(&opts.bridge)
                .await
                .map_err(bridge_err)?
                .iter()
                .any(|p| p.name == dest);
        if !exists {
            return Err(Error::configuration(format!(
                "{} '{}' does not exist on bridge {}",
                options::MIRROR_DEST,
                dest,
                opts.bridge
            )));
        }
        Ok(())
    }

    /// Make sure the control plane answers, provisioning it when allowed.
    /// Rewrites the plan's connection strings to the provisioned address.
    pub async fn ensure_control_plane(&self, plan: &mut NetworkPlan) -> Result<()> {
        if self.provisioner.reachable(&plan.endpoints).await {
            debug!(network_id = %plan.id, "Control plane reachable at {}", plan.endpoints.northbound);
            return Ok(());
        }
        if !plan.options.auto_create {
            return Err(Error::unavailable(
                Backend::Sdn,
                format!(
                    "control plane at {} / {} is unreachable and {} is off",
                    plan.endpoints.northbound,
                    plan.endpoints.southbound,
                    options::OVN_AUTO_CREATE
                ),
            ));
        }

        let management = plan
            .options
            .management_network
            .clone()
            .unwrap_or_else(|| self.settings.default_management_network.clone());
        info!(network_id = %plan.id, "Control plane unreachable; provisioning on {}", management);
        let address = self.provisioner.provision(&management).await?;

        let rewrite = |current: &DbEndpoint, default_port: u16| {
            DbEndpoint::Tcp(format!("{}:{}", address, current.port().unwrap_or(default_port)))
        };
        let endpoints = SdnEndpoints {
            northbound: rewrite(&plan.endpoints.northbound, 6641),
            southbound: rewrite(&plan.endpoints.southbound, 6642),
        };
        plan.options.nb_connection = Some(endpoints.northbound.clone());
        plan.options.sb_connection = Some(endpoints.southbound.clone());
        plan.endpoints = endpoints;

        for attempt in 1..=self.settings.ready_attempts {
            if self.provisioner.reachable(&plan.endpoints).await {
                info!(network_id = %plan.id, "Control plane ready at {} (attempt {})", address, attempt);
                return Ok(());
            }
            tokio::time::sleep(self.settings.ready_interval).await;
        }
        Err(Error::unavailable(
            Backend::Sdn,
            format!(
                "control plane at {} not ready after {} attempts",
                address, self.settings.ready_attempts
            ),
        ))
    }

    /// Ensure bridge, chassis settings and logical topology of a network.
    /// `transit_used` holds the endpoint addresses on the transit network.
    pub async fn apply_network(
        &self,
        plan: &NetworkPlan,
        transit: Option<&NetworkPlan>,
        transit_used: &BTreeSet<Ipv4Addr>,
    ) -> Result<()> {
        let opts = &plan.options;
        self.bridge.ensure_bridge(&opts.bridge).await.map_err(bridge_err)?;
        self.bridge
            .ensure_chassis_config(&ChassisConfig {
                ovn_remote: Some(plan.endpoints.southbound.to_string()),
                encap_type: opts.encap.map(|e| e.as_str().to_string()),
                encap_ip: opts.encap_ip.map(|ip| ip.to_string()),
            })
            .await
            .map_err(bridge_err)?;

        let nb = self.northbound(plan);
        nb.ensure_switch(&plan.switch, &plan.switch_ids())
            .await
            .map_err(sdn_err)?;

        if opts.dhcp == DhcpMode::Sdn {
            if let Some(pool) = &plan.pool {
                nb.ensure_dhcp_options(
                    &pool.subnet.to_string(),
                    &dhcp_server_options(pool, opts.dns_server),
                    &network_ids(&plan.id),
                )
                .await
                .map_err(sdn_err)?;
            }
        }

        if plan.is_transit() {
            self.apply_gateway(nb.as_ref(), plan).await?;
        }

        if let Some(router) = plan.router() {
            self.attach_router(nb.as_ref(), plan, &router).await?;
            if let Some(transit) = transit {
                self.link_transit(nb.as_ref(), plan, transit, &router, transit_used)
                    .await?;
            }
        }

        info!(network_id = %plan.id, switch = %plan.switch, "Network topology applied");
        Ok(())
    }

    async fn apply_gateway(&self, nb: &dyn LogicalTopology, plan: &NetworkPlan) -> Result<()> {
        let pool = plan
            .pool
            .as_ref()
            .ok_or_else(|| Error::configuration("a transit network needs an IPv4 subnet"))?;
        let external = plan
            .options
            .external_gateway
            .ok_or_else(|| Error::configuration(format!("{} is required", options::OVN_EXTERNAL_GATEWAY)))?;

        nb.ensure_router(GATEWAY_ROUTER, &ids(&[("network_id", plan.id.as_str()), ("role", "gateway")]))
            .await
            .map_err(sdn_err)?;
        let router_port = switch_router_port(&plan.switch);
        nb.ensure_router_port(
            GATEWAY_ROUTER,
            &router_port,
            &router_mac(pool.gateway),
            &[pool.gateway_cidr()],
        )
        .await
        .map_err(sdn_err)?;
        let spec = PortKind::Router {
            router_port: router_port.clone(),
        }
        .into_spec(&router_switch_port(GATEWAY_ROUTER, &plan.switch), network_ids(&plan.id));
        nb.ensure_switch_port(&plan.switch, &spec).await.map_err(sdn_err)?;
        nb.add_static_route(GATEWAY_ROUTER, DEFAULT_ROUTE, &external.to_string())
            .await
            .map_err(sdn_err)?;
        Ok(())
    }

    async fn attach_router(&self, nb: &dyn LogicalTopology, plan: &NetworkPlan, router: &str) -> Result<()> {
        let pool = plan.pool.as_ref().ok_or_else(|| {
            Error::configuration(format!("{} needs an IPv4 subnet", options::OVN_ROUTER))
        })?;
        nb.ensure_router(router, &ids(&[("network_id", plan.id.as_str())]))
            .await
            .map_err(sdn_err)?;
        let router_port = switch_router_port(&plan.switch);
        nb.ensure_router_port(router, &router_port, &router_mac(pool.gateway), &[pool.gateway_cidr()])
            .await
            .map_err(sdn_err)?;
        let spec = PortKind::Router { router_port }
            .into_spec(&router_switch_port(router, &plan.switch), network_ids(&plan.id));
        nb.ensure_switch_port(&plan.switch, &spec).await.map_err(sdn_err)?;
        Ok(())
    }

    /// Link address of `router` on the transit subnet: reused from the live
    /// port when present, else the lowest free host from the link offset.
    async fn transit_link_address(
        &self,
        nb: &dyn LogicalTopology,
        transit: &NetworkPlan,
        transit_pool: &AddressPool,
        router: &str,
        transit_used: &BTreeSet<Ipv4Addr>,
    ) -> Result<Ipv4Addr> {
        let port_name = transit_router_port(router);
        let ports = nb.list_router_ports(None).await.map_err(sdn_err)?;
        let port_ips = |networks: &[String]| -> Vec<Ipv4Addr> {
            networks
                .iter()
                .filter_map(|n| parse_requested(n).ok())
                .filter(|ip| transit_pool.subnet.contains(ip))
                .collect()
        };

        if let Some(existing) = ports.iter().find(|p| p.name == port_name) {
            if let Some(ip) = port_ips(&existing.networks).into_iter().next() {
                debug!("Reusing transit link address {} for {}", ip, router);
                return Ok(ip);
            }
        }

        let mut used = transit_used.clone();
        used.extend(ports.iter().flat_map(|p| port_ips(&p.networks)));
        if let Some(external) = transit.options.external_gateway {
            used.insert(external);
        }
        transit_pool
            .first_free(TRANSIT_LINK_OFFSET, &used)
            .ok_or_else(|| Error::AddressExhausted(transit.id.clone()))
    }

    async fn link_transit(
        &self,
        nb: &dyn LogicalTopology,
        plan: &NetworkPlan,
        transit: &NetworkPlan,
        router: &str,
        transit_used: &BTreeSet<Ipv4Addr>,
    ) -> Result<()> {
        if plan.endpoints.northbound != transit.endpoints.northbound {
            return Err(Error::precondition(format!(
                "network {} and transit network {} use different control planes ({} vs {})",
                plan.id, transit.id, plan.endpoints.northbound, transit.endpoints.northbound
            )));
        }
        let (Some(pool), Some(transit_pool)) = (&plan.pool, &transit.pool) else {
            return Err(Error::configuration(format!(
                "{} needs IPv4 subnets on both networks",
                options::OVN_TRANSIT_NETWORK
            )));
        };

        let link = self
            .transit_link_address(nb, transit, transit_pool, router, transit_used)
            .await?;
        let router_port = transit_router_port(router);
        nb.ensure_router_port(router, &router_port, &router_mac(link), &[transit_pool.with_prefix(link)])
            .await
            .map_err(sdn_err)?;
        let spec = PortKind::Router {
            router_port: router_port.clone(),
        }
        .into_spec(&transit_switch_port(router), network_ids(&plan.id));
        nb.ensure_switch_port(&transit.switch, &spec).await.map_err(sdn_err)?;

        // Default route out through the gateway router, and the way back in
        nb.add_static_route(router, DEFAULT_ROUTE, &transit_pool.gateway.to_string())
            .await
            .map_err(sdn_err)?;
        nb.add_static_route(GATEWAY_ROUTER, &pool.subnet.to_string(), &link.to_string())
            .await
            .map_err(sdn_err)?;
        info!(network_id = %plan.id, "Linked {} to transit {} via {}", router, transit.id, link);
        Ok(())
    }

    /// Remove what a network owns. `others` are the remaining networks; a
    /// router they still reference is kept.
    pub async fn teardown_network(
        &self,
        plan: &NetworkPlan,
        transit: Option<&NetworkPlan>,
        others: &[NetworkPlan],
    ) -> Result<()> {
        let bridge = &plan.options.bridge;
        if self.bridge.bridge_exists(bridge).await.map_err(bridge_err)? {
            let ports = self
                .bridge
                .ports_with_external_id(bridge, "network_id", &plan.id)
                .await
                .map_err(bridge_err)?;
            for port in ports {
                self.bridge.delete_port(bridge, &port.name).await.map_err(bridge_err)?;
                if let Some(veth) = port.name.strip_suffix("-p") {
                    self.links.delete_veth_pair(veth).await.map_err(link_err)?;
                }
                debug!(network_id = %plan.id, "Removed leftover port {}", port.name);
            }
        }

        let nb = self.northbound(plan);
        if let Some(dhcp) = nb.find_dhcp_options(&network_ids(&plan.id)).await.map_err(sdn_err)? {
            nb.delete_dhcp_options(&dhcp.uuid).await.map_err(sdn_err)?;
        }

        if let Some(router) = plan.router() {
            nb.delete_router_port(&switch_router_port(&plan.switch))
                .await
                .map_err(sdn_err)?;
            if let (Some(_), Some(pool)) = (transit, &plan.pool) {
                nb.delete_static_route(GATEWAY_ROUTER, &pool.subnet.to_string())
                    .await
                    .map_err(sdn_err)?;
            }
            let shared = others.iter().any(|o| o.router().as_deref() == Some(router.as_str()));
            if shared {
                debug!("Router {} still in use, keeping it", router);
            } else {
                nb.delete_switch_port(&transit_switch_port(&router))
                    .await
                    .map_err(sdn_err)?;
                nb.delete_router_port(&transit_router_port(&router))
                    .await
                    .map_err(sdn_err)?;
                nb.delete_router(&router).await.map_err(sdn_err)?;
            }
        }

        if plan.is_transit() {
            nb.delete_router_port(&switch_router_port(&plan.switch))
                .await
                .map_err(sdn_err)?;
            nb.delete_router(GATEWAY_ROUTER).await.map_err(sdn_err)?;
        }

        let switch_shared = others
            .iter()
            .any(|o| o.switch == plan.switch && o.endpoints.northbound == plan.endpoints.northbound);
        if switch_shared {
            warn!(network_id = %plan.id, "Switch {} still referenced by another network, keeping it", plan.switch);
        } else {
            nb.delete_switch(&plan.switch).await.map_err(sdn_err)?;
        }
        info!(network_id = %plan.id, "Network topology removed");
        Ok(())
    }

    /// Live join state: the bridge port carries this endpoint's id.
    pub async fn is_joined(&self, endpoint: &EndpointRecord) -> Result<bool> {
        let port = veth_peer_name(&endpoint.endpoint_id);
        let info = self.bridge.get_port_info(&port).await.map_err(bridge_err)?;
        Ok(info
            .map(|i| i.external_ids.get("endpoint_id") == Some(&endpoint.endpoint_id))
            .unwrap_or(false))
    }

    /// Wire an endpoint into the data path. On failure, the local wiring
    /// created so far is removed again.
    pub async fn attach_endpoint(&self, plan: &NetworkPlan, endpoint: &EndpointRecord) -> Result<()> {
        let peer = veth_peer_name(&endpoint.endpoint_id);
        self.links
            .create_veth_pair(&endpoint.veth_name, &peer, &endpoint.mac_address, plan.options.mtu)
            .await
            .map_err(link_err)?;

        if let Err(e) = self.wire_endpoint(plan, endpoint, &peer).await {
            warn!(endpoint_id = %endpoint.endpoint_id, "Join failed, rolling back: {}", e);
            if let Err(cleanup) = self.detach_endpoint(plan, endpoint).await {
                warn!(endpoint_id = %endpoint.endpoint_id, "Rollback incomplete: {}", cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn wire_endpoint(&self, plan: &NetworkPlan, endpoint: &EndpointRecord, peer: &str) -> Result<()> {
        let opts = &plan.options;
        let lsp = endpoint
            .ovn_port
            .clone()
            .unwrap_or_else(|| logical_port_name(&endpoint.endpoint_id));

        let mut port_ids = plan.endpoint_ids(endpoint);
        port_ids.insert("iface-id".to_string(), lsp.clone());
        if !endpoint.container_id.is_empty() {
            port_ids.insert("container_id".to_string(), endpoint.container_id.clone());
        }
        self.bridge
            .add_port(
                &opts.bridge,
                peer,
                &PortConfig {
                    tag: opts.vlan,
                    external_ids: port_ids,
                },
            )
            .await
            .map_err(bridge_err)?;

        let ip = endpoint_ip(endpoint);
        // The NAT gateway on a transit network forwards foreign addresses
        let port_security = !(plan.is_transit() && ip.is_some() && ip == opts.external_gateway);
        let spec = PortKind::Tenant {
            mac: endpoint.mac_address.clone(),
            ip,
            port_security,
        }
        .into_spec(&lsp, plan.endpoint_ids(endpoint));

        let nb = self.northbound(plan);
        nb.ensure_switch_port(&plan.switch, &spec).await.map_err(sdn_err)?;
        if opts.dhcp == DhcpMode::Sdn {
            match nb.find_dhcp_options(&network_ids(&plan.id)).await.map_err(sdn_err)? {
                Some(dhcp) => nb.set_port_dhcp(&lsp, &dhcp.uuid).await.map_err(sdn_err)?,
                None => warn!(network_id = %plan.id, "No DHCP options found for network"),
            }
        }

        if let Some(dest) = opts.mirror_dest.as_deref() {
            if opts.mirrors_port(peer, &endpoint.veth_name) {
                self.bridge
                    .create_mirror(&opts.bridge, &mirror_name(&endpoint.endpoint_id), &[peer.to_string()], dest)
                    .await
                    .map_err(bridge_err)?;
            }
        }

        info!(
            network_id = %plan.id,
            endpoint_id = %endpoint.endpoint_id,
            "Endpoint attached as {} on {}",
            peer,
            opts.bridge
        );
        Ok(())
    }

    /// Remove mirror, bridge port and interface pair. The logical port stays.
    pub async fn detach_endpoint(&self, plan: &NetworkPlan, endpoint: &EndpointRecord) -> Result<()> {
        let bridge = &plan.options.bridge;
        let peer = veth_peer_name(&endpoint.endpoint_id);
        if plan.options.mirror_dest.is_some() {
            self.bridge
                .delete_mirror(bridge, &mirror_name(&endpoint.endpoint_id))
                .await
                .map_err(bridge_err)?;
        }
        self.bridge.delete_port(bridge, &peer).await.map_err(bridge_err)?;
        self.links
            .delete_veth_pair(&endpoint.veth_name)
            .await
            .map_err(link_err)?;
        debug!(endpoint_id = %endpoint.endpoint_id, "Endpoint detached");
        Ok(())
    }

    /// Detach, then remove the logical port.
    pub async fn remove_endpoint(&self, plan: &NetworkPlan, endpoint: &EndpointRecord) -> Result<()> {
        self.detach_endpoint(plan, endpoint).await?;
        if let Some(lsp) = &endpoint.ovn_port {
            self.northbound(plan)
                .delete_switch_port(lsp)
                .await
                .map_err(sdn_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::MemoryProvisioner;
    use ovsnet_network::{MemoryBridge, MemoryLinks, MemoryTopology};
    use serde_json::json;

    fn raw(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    struct Harness {
        bridge: Arc<MemoryBridge>,
        topology: Arc<MemoryTopology>,
        provisioner: Arc<MemoryProvisioner>,
        orchestrator: Orchestrator,
    }

    fn harness(provisioner: MemoryProvisioner) -> Harness {
        let bridge = Arc::new(MemoryBridge::new());
        let topology = Arc::new(MemoryTopology::new());
        let provisioner = Arc::new(provisioner);
        let orchestrator = Orchestrator::new(
            bridge.clone(),
            Arc::new(MemoryLinks::new()),
            Arc::new(topology.clone()),
            provisioner.clone(),
            OrchestratorSettings {
                ready_attempts: 3,
                ready_interval: Duration::from_millis(1),
                ..OrchestratorSettings::default()
            },
        );
        Harness {
            bridge,
            topology,
            provisioner,
            orchestrator,
        }
    }

    fn plan(pairs: &[(&str, &str)], pool: &str) -> NetworkPlan {
        let options = NetworkOptions::parse(&raw(pairs)).unwrap();
        NetworkPlan::new("net1", options, Some(json!({"Pool": pool})), true).unwrap()
    }

    #[test]
    fn test_router_port_spec_is_trusted() {
        let spec = PortKind::Router {
            router_port: "rp-ls-a".to_string(),
        }
        .into_spec("sp-lr-a-ls-a", BTreeMap::new());
        assert_eq!(spec.addresses, vec!["router"]);
        assert!(spec.port_security.is_empty());
        assert_eq!(spec.port_type, "router");
        assert_eq!(spec.options.get("router-port").map(String::as_str), Some("rp-ls-a"));
    }

    #[test]
    fn test_tenant_port_spec() {
        let spec = PortKind::Tenant {
            mac: "02:00:0a:00:00:02".to_string(),
            ip: Some(Ipv4Addr::new(10, 0, 0, 2)),
            port_security: true,
        }
        .into_spec("lsp-1", BTreeMap::new());
        assert_eq!(spec.addresses, vec!["02:00:0a:00:00:02 10.0.0.2"]);
        assert_eq!(spec.port_security, spec.addresses);
    }

    #[test]
    fn test_dhcp_server_options() {
        let pool = AddressPool::from_ipam_data(&json!({"Pool": "10.0.0.0/24", "Gateway": "10.0.0.1"}))
            .unwrap()
            .unwrap();
        let opts = dhcp_server_options(&pool, Some(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(opts["lease_time"], "3600");
        assert_eq!(opts["router"], "10.0.0.1");
        assert_eq!(opts["dns_server"], "8.8.8.8");
    }

    #[tokio::test]
    async fn test_unreachable_without_auto_create() {
        let h = harness(MemoryProvisioner::unreachable());
        let mut p = plan(&[(options::OVN_SWITCH, "ls-a")], "10.0.0.0/24");
        let err = h.orchestrator.ensure_control_plane(&mut p).await.unwrap_err();
        assert_eq!(err.kind(), "BackendUnavailableError");
        assert_eq!(h.provisioner.provision_count(), 0);
    }

    #[tokio::test]
    async fn test_auto_create_rewrites_endpoints() {
        let h = harness(MemoryProvisioner::on_demand());
        let mut p = plan(
            &[(options::OVN_SWITCH, "ls-a"), (options::OVN_AUTO_CREATE, "true")],
            "10.0.0.0/24",
        );
        h.orchestrator.ensure_control_plane(&mut p).await.unwrap();
        assert_eq!(p.endpoints.northbound.to_string(), "tcp:172.30.0.5:6641");
        assert_eq!(p.endpoints.southbound.to_string(), "tcp:172.30.0.5:6642");
        assert_eq!(
            p.to_record().options.get(options::OVN_NB_CONNECTION).map(String::as_str),
            Some("tcp:172.30.0.5:6641")
        );
    }

    #[tokio::test]
    async fn test_provisioning_that_never_answers_fails() {
        let h = harness(MemoryProvisioner::unreachable());
        let mut p = plan(
            &[(options::OVN_SWITCH, "ls-a"), (options::OVN_AUTO_CREATE, "true")],
            "10.0.0.0/24",
        );
        let err = h.orchestrator.ensure_control_plane(&mut p).await.unwrap_err();
        assert_eq!(err.kind(), "BackendUnavailableError");
        assert_eq!(h.provisioner.provision_count(), 1);
    }

    #[tokio::test]
    async fn test_apply_twice_converges() {
        let h = harness(MemoryProvisioner::reachable());
        let p = plan(
            &[(options::OVN_SWITCH, "ls-a"), (options::OVN_ROUTER, "lr-a"), (options::DHCP, "ovn")],
            "10.0.0.0/24",
        );
        h.orchestrator.apply_network(&p, None, &BTreeSet::new()).await.unwrap();
        let bridge_after_first = h.bridge.mutations().len();
        let nb_after_first = h.topology.mutations().len();

        h.orchestrator.apply_network(&p, None, &BTreeSet::new()).await.unwrap();
        assert_eq!(h.bridge.mutations().len(), bridge_after_first);
        assert_eq!(h.topology.mutations().len(), nb_after_first);
        assert!(h.topology.mutations().contains(&"nb.create_router lr-a".to_string()));
    }

    #[tokio::test]
    async fn test_teardown_keeps_switch_referenced_elsewhere() {
        let h = harness(MemoryProvisioner::reachable());
        let first = plan(&[(options::OVN_SWITCH, "ls-a")], "10.0.0.0/24");
        let mut second = plan(&[(options::OVN_SWITCH, "ls-a")], "10.1.0.0/24");
        second.id = "net2".to_string();
        h.orchestrator.apply_network(&first, None, &BTreeSet::new()).await.unwrap();
        h.orchestrator.apply_network(&second, None, &BTreeSet::new()).await.unwrap();

        h.orchestrator
            .teardown_network(&first, None, std::slice::from_ref(&second))
            .await
            .unwrap();
        let switches = h.topology.list_switches().await.unwrap();
        assert!(switches.iter().any(|s| s.name == "ls-a"));

        h.orchestrator.teardown_network(&second, None, &[]).await.unwrap();
        assert!(h.topology.list_switches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mirror_destination_must_exist() {
        let h = harness(MemoryProvisioner::reachable());
        let p = plan(
            &[
                (options::OVN_SWITCH, "ls-a"),
                (options::MIRROR_PORTS, "all"),
                (options::MIRROR_DEST, "tap0"),
            ],
            "10.0.0.0/24",
        );
        let err = h.orchestrator.check_live(&p).await.unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");

        h.bridge.seed_port("br-int", "tap0").await;
        h.orchestrator.check_live(&p).await.unwrap();
    }
}
