//! In-memory backends
//!
//! Implement the same adapter traits as the OVSDB and rtnetlink backends and
//! keep a log of every mutating call. Used by `ovsnet --backend memory` for
//! dry runs and by the lifecycle tests to assert on backend side effects.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::bridge::{BridgeAdapter, ChassisConfig, MirrorInfo, PortConfig, PortInfo};
use crate::link::LinkManager;
use crate::ovn::{
    DhcpOptions, LogicalTopology, NamedObject, RouterPortInfo, StaticRoute, SwitchPortSpec, TopologyConnector,
};
use crate::ovs_error::{OvsError, OvsResult};
use crate::ovsdb::DbEndpoint;

/// Shared switch for unavailability and the mutation log
#[derive(Default)]
struct Recorder {
    unavailable: AtomicBool,
    log: std::sync::Mutex<Vec<String>>,
}

impl Recorder {
    fn check(&self, what: &str) -> OvsResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OvsError::ConnectionClosed(format!("memory:{}", what)));
        }
        Ok(())
    }

    fn record(&self, entry: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(entry);
        }
    }

    fn entries(&self) -> Vec<String> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

// ============================================================================
// Bridge
// ============================================================================

#[derive(Debug, Clone, Default)]
struct MemoryPort {
    bridge: String,
    tag: Option<u16>,
    external_ids: BTreeMap<String, String>,
}

#[derive(Default)]
struct BridgeState {
    bridges: BTreeSet<String>,
    ports: BTreeMap<String, MemoryPort>,
    mirrors: BTreeMap<String, (String, MirrorInfo)>,
    chassis: BTreeMap<String, String>,
}

/// In-memory `Open_vSwitch`
#[derive(Default)]
pub struct MemoryBridge {
    state: Mutex<BridgeState>,
    recorder: Recorder,
}

impl MemoryBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the socket were unreachable.
    pub fn set_available(&self, available: bool) {
        self.recorder.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn mutations(&self) -> Vec<String> {
        self.recorder.entries()
    }

    /// Add a port directly, as an operator would.
    pub async fn seed_port(&self, bridge: &str, port: &str) {
        let mut state = self.state.lock().await;
        state.bridges.insert(bridge.to_string());
        state.ports.insert(
            port.to_string(),
            MemoryPort {
                bridge: bridge.to_string(),
                ..Default::default()
            },
        );
    }

    pub async fn chassis(&self) -> BTreeMap<String, String> {
        self.state.lock().await.chassis.clone()
    }
}

#[async_trait]
impl BridgeAdapter for MemoryBridge {
    async fn bridge_exists(&self, bridge: &str) -> OvsResult<bool> {
        self.recorder.check("bridge")?;
        Ok(self.state.lock().await.bridges.contains(bridge))
    }

    async fn ensure_bridge(&self, bridge: &str) -> OvsResult<()> {
        self.recorder.check("bridge")?;
        if self.state.lock().await.bridges.insert(bridge.to_string()) {
            self.recorder.record(format!("bridge.create {}", bridge));
        }
        Ok(())
    }

    async fn add_port(&self, bridge: &str, port: &str, config: &PortConfig) -> OvsResult<()> {
        self.recorder.check("bridge")?;
        let mut state = self.state.lock().await;
        if !state.bridges.contains(bridge) {
            return Err(OvsError::NotFound(format!("bridge {}", bridge)));
        }
        state.ports.insert(
            port.to_string(),
            MemoryPort {
                bridge: bridge.to_string(),
                tag: config.tag,
                external_ids: config.external_ids.clone(),
            },
        );
        self.recorder.record(format!("bridge.add_port {} {}", bridge, port));
        Ok(())
    }

    async fn delete_port(&self, bridge: &str, port: &str) -> OvsResult<()> {
        self.recorder.check("bridge")?;
        let mut state = self.state.lock().await;
        if state.ports.get(port).map(|p| p.bridge == bridge).unwrap_or(false) {
            state.ports.remove(port);
            self.recorder.record(format!("bridge.delete_port {} {}", bridge, port));
        }
        Ok(())
    }

    async fn set_port_vlan(&self, port: &str, tag: Option<u16>) -> OvsResult<()> {
        self.recorder.check("bridge")?;
        let mut state = self.state.lock().await;
        let entry = state
            .ports
            .get_mut(port)
            .ok_or_else(|| OvsError::NotFound(format!("port {}", port)))?;
        entry.tag = tag;
        self.recorder.record(format!("bridge.set_vlan {} {:?}", port, tag));
        Ok(())
    }

    async fn get_port_info(&self, port: &str) -> OvsResult<Option<PortInfo>> {
        self.recorder.check("bridge")?;
        Ok(self.state.lock().await.ports.get(port).map(|p| PortInfo {
            name: port.to_string(),
            tag: p.tag,
            external_ids: p.external_ids.clone(),
        }))
    }

    async fn list_ports(&self, bridge: &str) -> OvsResult<Vec<PortInfo>> {
        self.recorder.check("bridge")?;
        let state = self.state.lock().await;
        if !state.bridges.contains(bridge) {
            return Err(OvsError::NotFound(format!("bridge {}", bridge)));
        }
        Ok(state
            .ports
            .iter()
            .filter(|(_, p)| p.bridge == bridge)
            .map(|(name, p)| PortInfo {
                name: name.clone(),
                tag: p.tag,
                external_ids: p.external_ids.clone(),
            })
            .collect())
    }

    async fn create_mirror(&self, bridge: &str, name: &str, sources: &[String], output: &str) -> OvsResult<()> {
        self.recorder.check("bridge")?;
        let mut state = self.state.lock().await;
        if state.mirrors.contains_key(name) {
            return Ok(());
        }
        for port in sources.iter().map(String::as_str).chain(std::iter::once(output)) {
            if !state.ports.contains_key(port) {
                return Err(OvsError::NotFound(format!("port {}", port)));
            }
        }
        state.mirrors.insert(
            name.to_string(),
            (
                bridge.to_string(),
                MirrorInfo {
                    name: name.to_string(),
                    select_ports: sources.to_vec(),
                    output_port: Some(output.to_string()),
                },
            ),
        );
        self.recorder.record(format!("bridge.create_mirror {} {}", bridge, name));
        Ok(())
    }

    async fn delete_mirror(&self, bridge: &str, name: &str) -> OvsResult<()> {
        self.recorder.check("bridge")?;
        if self.state.lock().await.mirrors.remove(name).is_some() {
            self.recorder.record(format!("bridge.delete_mirror {} {}", bridge, name));
        }
        Ok(())
    }

    async fn list_mirrors(&self, bridge: &str) -> OvsResult<Vec<MirrorInfo>> {
        self.recorder.check("bridge")?;
        Ok(self
            .state
            .lock()
            .await
            .mirrors
            .values()
            .filter(|(b, _)| b == bridge)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn ensure_chassis_config(&self, config: &ChassisConfig) -> OvsResult<()> {
        self.recorder.check("bridge")?;
        let mut state = self.state.lock().await;
        if let Some(remote) = &config.ovn_remote {
            if !state.chassis.contains_key("ovn-remote") {
                state.chassis.insert("ovn-remote".to_string(), remote.clone());
                self.recorder.record(format!("bridge.chassis ovn-remote={}", remote));
            }
        }
        for (key, value) in [("ovn-encap-type", &config.encap_type), ("ovn-encap-ip", &config.encap_ip)] {
            if let Some(value) = value {
                if state.chassis.get(key) != Some(value) {
                    state.chassis.insert(key.to_string(), value.clone());
                    self.recorder.record(format!("bridge.chassis {}={}", key, value));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Logical topology
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryRouterPort {
    router: String,
    mac: String,
    networks: Vec<String>,
}

#[derive(Default)]
struct TopologyState {
    switches: BTreeMap<String, String>,
    switch_ports: BTreeMap<String, (String, SwitchPortSpec, Option<String>)>,
    routers: BTreeMap<String, String>,
    router_ports: BTreeMap<String, MemoryRouterPort>,
    routes: BTreeMap<String, Vec<StaticRoute>>,
    dhcp: BTreeMap<String, DhcpOptions>,
}

/// In-memory `OVN_Northbound`
#[derive(Default)]
pub struct MemoryTopology {
    state: Mutex<TopologyState>,
    recorder: Recorder,
    next_uuid: AtomicU64,
}

impl MemoryTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.recorder.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn mutations(&self) -> Vec<String> {
        self.recorder.entries()
    }

    /// DHCP option set attached to a logical port, if any.
    pub async fn port_dhcp(&self, port: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .switch_ports
            .get(port)
            .and_then(|(_, _, dhcp)| dhcp.clone())
    }

    /// Every DHCP option set, for assertions.
    pub async fn dhcp_options(&self) -> Vec<DhcpOptions> {
        self.state.lock().await.dhcp.values().cloned().collect()
    }

    fn allocate_uuid(&self) -> String {
        let n = self.next_uuid.fetch_add(1, Ordering::Relaxed) + 1;
        format!("00000000-0000-0000-0000-{:012x}", n)
    }
}

#[async_trait]
impl LogicalTopology for MemoryTopology {
    async fn ensure_switch(&self, name: &str, _external_ids: &BTreeMap<String, String>) -> OvsResult<String> {
        self.recorder.check("nb")?;
        let mut state = self.state.lock().await;
        if let Some(id) = state.switches.get(name) {
            return Ok(id.clone());
        }
        let id = self.allocate_uuid();
        state.switches.insert(name.to_string(), id.clone());
        self.recorder.record(format!("nb.create_switch {}", name));
        Ok(id)
    }

    async fn delete_switch(&self, name: &str) -> OvsResult<()> {
        self.recorder.check("nb")?;
        let mut state = self.state.lock().await;
        if state.switches.remove(name).is_some() {
            state.switch_ports.retain(|_, (switch, _, _)| switch != name);
            self.recorder.record(format!("nb.delete_switch {}", name));
        }
        Ok(())
    }

    async fn list_switches(&self) -> OvsResult<Vec<NamedObject>> {
        self.recorder.check("nb")?;
        Ok(named(&self.state.lock().await.switches))
    }

    async fn ensure_switch_port(&self, switch: &str, spec: &SwitchPortSpec) -> OvsResult<()> {
        self.recorder.check("nb")?;
        let mut state = self.state.lock().await;
        if !state.switches.contains_key(switch) {
            return Err(OvsError::NotFound(format!("logical switch {}", switch)));
        }
        let dhcp = state.switch_ports.get(&spec.name).and_then(|(_, _, d)| d.clone());
        let unchanged = state
            .switch_ports
            .get(&spec.name)
            .map(|(s, existing, _)| s == switch && existing == spec)
            .unwrap_or(false);
        if !unchanged {
            state
                .switch_ports
                .insert(spec.name.clone(), (switch.to_string(), spec.clone(), dhcp));
            self.recorder.record(format!("nb.ensure_switch_port {} {}", switch, spec.name));
        }
        Ok(())
    }

    async fn get_switch_port(&self, name: &str) -> OvsResult<Option<SwitchPortSpec>> {
        self.recorder.check("nb")?;
        Ok(self.state.lock().await.switch_ports.get(name).map(|(_, s, _)| s.clone()))
    }

    async fn delete_switch_port(&self, name: &str) -> OvsResult<()> {
        self.recorder.check("nb")?;
        if self.state.lock().await.switch_ports.remove(name).is_some() {
            self.recorder.record(format!("nb.delete_switch_port {}", name));
        }
        Ok(())
    }

    async fn list_switch_ports(&self, switch: &str) -> OvsResult<Vec<NamedObject>> {
        self.recorder.check("nb")?;
        let state = self.state.lock().await;
        if !state.switches.contains_key(switch) {
            return Err(OvsError::NotFound(format!("logical switch {}", switch)));
        }
        Ok(state
            .switch_ports
            .iter()
            .filter(|(_, (s, _, _))| s == switch)
            .map(|(name, _)| NamedObject {
                name: name.clone(),
                uuid: name.clone(),
            })
            .collect())
    }

    async fn ensure_router(&self, name: &str, _external_ids: &BTreeMap<String, String>) -> OvsResult<String> {
        self.recorder.check("nb")?;
        let mut state = self.state.lock().await;
        if let Some(id) = state.routers.get(name) {
            return Ok(id.clone());
        }
        let id = self.allocate_uuid();
        state.routers.insert(name.to_string(), id.clone());
        self.recorder.record(format!("nb.create_router {}", name));
        Ok(id)
    }

    async fn delete_router(&self, name: &str) -> OvsResult<()> {
        self.recorder.check("nb")?;
        let mut state = self.state.lock().await;
        if state.routers.remove(name).is_some() {
            state.router_ports.retain(|_, p| p.router != name);
            state.routes.remove(name);
            self.recorder.record(format!("nb.delete_router {}", name));
        }
        Ok(())
    }

    async fn list_routers(&self) -> OvsResult<Vec<NamedObject>> {
        self.recorder.check("nb")?;
        Ok(named(&self.state.lock().await.routers))
    }

    async fn ensure_router_port(&self, router: &str, name: &str, mac: &str, networks: &[String]) -> OvsResult<()> {
        self.recorder.check("nb")?;
        let mut state = self.state.lock().await;
        if !state.routers.contains_key(router) {
            return Err(OvsError::NotFound(format!("logical router {}", router)));
        }
        let wanted = MemoryRouterPort {
            router: router.to_string(),
            mac: mac.to_string(),
            networks: networks.to_vec(),
        };
        let unchanged = state
            .router_ports
            .get(name)
            .map(|p| p.router == wanted.router && p.mac == wanted.mac && p.networks == wanted.networks)
            .unwrap_or(false);
        if !unchanged {
            state.router_ports.insert(name.to_string(), wanted);
            self.recorder.record(format!("nb.ensure_router_port {} {}", router, name));
        }
        Ok(())
    }

    async fn delete_router_port(&self, name: &str) -> OvsResult<()> {
        self.recorder.check("nb")?;
        if self.state.lock().await.router_ports.remove(name).is_some() {
            self.recorder.record(format!("nb.delete_router_port {}", name));
        }
        Ok(())
    }

    async fn list_router_ports(&self, router: Option<&str>) -> OvsResult<Vec<RouterPortInfo>> {
        self.recorder.check("nb")?;
        let state = self.state.lock().await;
        if let Some(router) = router {
            if !state.routers.contains_key(router) {
                return Err(OvsError::NotFound(format!("logical router {}", router)));
            }
        }
        Ok(state
            .router_ports
            .iter()
            .filter(|(_, p)| router.map(|r| p.router == r).unwrap_or(true))
            .map(|(name, p)| RouterPortInfo {
                name: name.clone(),
                mac: p.mac.clone(),
                networks: p.networks.clone(),
            })
            .collect())
    }

    async fn add_static_route(&self, router: &str, prefix: &str, nexthop: &str) -> OvsResult<()> {
        self.recorder.check("nb")?;
        let mut state = self.state.lock().await;
        if !state.routers.contains_key(router) {
            return Err(OvsError::NotFound(format!("logical router {}", router)));
        }
        let routes = state.routes.entry(router.to_string()).or_default();
        if routes.iter().any(|r| r.prefix == prefix) {
            return Ok(());
        }
        routes.push(StaticRoute {
            prefix: prefix.to_string(),
            nexthop: nexthop.to_string(),
        });
        self.recorder.record(format!("nb.add_route {} {} {}", router, prefix, nexthop));
        Ok(())
    }

    async fn delete_static_route(&self, router: &str, prefix: &str) -> OvsResult<()> {
        self.recorder.check("nb")?;
        let mut state = self.state.lock().await;
        if let Some(routes) = state.routes.get_mut(router) {
            let before = routes.len();
            routes.retain(|r| r.prefix != prefix);
            if routes.len() != before {
                self.recorder.record(format!("nb.delete_route {} {}", router, prefix));
            }
        }
        Ok(())
    }

    async fn list_static_routes(&self, router: &str) -> OvsResult<Vec<StaticRoute>> {
        self.recorder.check("nb")?;
        let state = self.state.lock().await;
        if !state.routers.contains_key(router) {
            return Err(OvsError::NotFound(format!("logical router {}", router)));
        }
        Ok(state.routes.get(router).cloned().unwrap_or_default())
    }

    async fn ensure_dhcp_options(
        &self,
        cidr: &str,
        options: &BTreeMap<String, String>,
        external_ids: &BTreeMap<String, String>,
    ) -> OvsResult<String> {
        self.recorder.check("nb")?;
        let mut state = self.state.lock().await;
        let existing = state
            .dhcp
            .values_mut()
            .find(|d| external_ids.iter().all(|(k, v)| d.external_ids.get(k) == Some(v)));
        if let Some(existing) = existing {
            if existing.cidr != cidr || &existing.options != options {
                existing.cidr = cidr.to_string();
                existing.options = options.clone();
                self.recorder.record(format!("nb.update_dhcp {}", cidr));
            }
            return Ok(existing.uuid.clone());
        }
        let id = self.allocate_uuid();
        state.dhcp.insert(
            id.clone(),
            DhcpOptions {
                uuid: id.clone(),
                cidr: cidr.to_string(),
                options: options.clone(),
                external_ids: external_ids.clone(),
            },
        );
        self.recorder.record(format!("nb.create_dhcp {}", cidr));
        Ok(id)
    }

    async fn find_dhcp_options(&self, external_ids: &BTreeMap<String, String>) -> OvsResult<Option<DhcpOptions>> {
        self.recorder.check("nb")?;
        Ok(self
            .state
            .lock()
            .await
            .dhcp
            .values()
            .find(|d| external_ids.iter().all(|(k, v)| d.external_ids.get(k) == Some(v)))
            .cloned())
    }

    async fn delete_dhcp_options(&self, uuid: &str) -> OvsResult<()> {
        self.recorder.check("nb")?;
        let mut state = self.state.lock().await;
        if state.dhcp.remove(uuid).is_some() {
            for (_, _, dhcp) in state.switch_ports.values_mut() {
                if dhcp.as_deref() == Some(uuid) {
                    *dhcp = None;
                }
            }
            self.recorder.record(format!("nb.delete_dhcp {}", uuid));
        }
        Ok(())
    }

    async fn set_port_dhcp(&self, port: &str, dhcp_uuid: &str) -> OvsResult<()> {
        self.recorder.check("nb")?;
        let mut state = self.state.lock().await;
        let entry = state
            .switch_ports
            .get_mut(port)
            .ok_or_else(|| OvsError::NotFound(format!("logical port {}", port)))?;
        if entry.2.as_deref() != Some(dhcp_uuid) {
            entry.2 = Some(dhcp_uuid.to_string());
            self.recorder.record(format!("nb.set_port_dhcp {}", port));
        }
        Ok(())
    }
}

fn named(objects: &BTreeMap<String, String>) -> Vec<NamedObject> {
    objects
        .iter()
        .map(|(name, uuid)| NamedObject {
            name: name.clone(),
            uuid: uuid.clone(),
        })
        .collect()
}

/// Every northbound endpoint resolves to the same in-memory database.
impl TopologyConnector for Arc<MemoryTopology> {
    fn northbound(&self, _endpoint: &DbEndpoint) -> Arc<dyn LogicalTopology> {
        self.clone()
    }
}

// ============================================================================
// Links
// ============================================================================

/// In-memory host links
#[derive(Default)]
pub struct MemoryLinks {
    links: Mutex<BTreeMap<String, (String, String)>>,
    recorder: Recorder,
}

impl MemoryLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.recorder.entries()
    }

    /// MAC assigned to the sandbox end of a pair.
    pub async fn mac_of(&self, name: &str) -> Option<String> {
        self.links.lock().await.get(name).map(|(_, mac)| mac.clone())
    }
}

#[async_trait]
impl LinkManager for MemoryLinks {
    async fn create_veth_pair(&self, name: &str, peer: &str, mac: &str, _mtu: Option<u32>) -> OvsResult<()> {
        let mut links = self.links.lock().await;
        if links.contains_key(name) {
            return Ok(());
        }
        links.insert(name.to_string(), (peer.to_string(), mac.to_string()));
        self.recorder.record(format!("link.create {} {}", name, peer));
        Ok(())
    }

    async fn delete_veth_pair(&self, name: &str) -> OvsResult<()> {
        if self.links.lock().await.remove(name).is_some() {
            self.recorder.record(format!("link.delete {}", name));
        }
        Ok(())
    }

    async fn link_exists(&self, name: &str) -> OvsResult<bool> {
        let links = self.links.lock().await;
        Ok(links.contains_key(name) || links.values().any(|(peer, _)| peer == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_bridge_is_idempotent() {
        let bridge = MemoryBridge::new();
        bridge.ensure_bridge("br-int").await.unwrap();
        bridge.ensure_bridge("br-int").await.unwrap();
        bridge.delete_port("br-int", "absent").await.unwrap();
        assert_eq!(bridge.mutations(), vec!["bridge.create br-int"]);
    }

    #[tokio::test]
    async fn test_memory_route_added_once() {
        let nb = MemoryTopology::new();
        nb.ensure_router("lr-gateway", &BTreeMap::new()).await.unwrap();
        nb.add_static_route("lr-gateway", "10.0.0.0/24", "100.64.0.11").await.unwrap();
        nb.add_static_route("lr-gateway", "10.0.0.0/24", "100.64.0.11").await.unwrap();
        assert_eq!(nb.list_static_routes("lr-gateway").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_transient() {
        let nb = MemoryTopology::new();
        nb.set_available(false);
        let err = nb.list_switches().await.unwrap_err();
        assert!(err.is_transient());
    }
}
