//! Logical topology adapter over the OVN northbound database
//!
//! Stateless: every read goes to the live database, so objects created or
//! removed by an operator between calls are always observed. "Already
//! exists" on create and "not found" on delete are successes.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::ovs_error::{OvsError, OvsResult};
use crate::ovsdb::{
    named_uuid, ovs_map, ovs_set, parse_map, parse_string_set, parse_uuid_set, row_name, row_uuid, uuid,
    wait_for_rows, DbEndpoint, OvsdbClient, RpcSettings,
};

pub const NORTHBOUND_DATABASE: &str = "OVN_Northbound";

/// Re-reads allowed when another writer keeps changing a router's routes
const ROUTE_ATTEMPTS: u32 = 3;

/// A logical object as listed by the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedObject {
    pub name: String,
    pub uuid: String,
}

/// Desired state of a logical switch port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchPortSpec {
    pub name: String,
    /// `["<mac> <ip>"]`, or `["router"]` for router-type ports
    pub addresses: Vec<String>,
    /// Empty disables port security
    pub port_security: Vec<String>,
    /// `""` for VIF ports, `"router"` for router peers
    pub port_type: String,
    pub options: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterPortInfo {
    pub name: String,
    pub mac: String,
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    pub prefix: String,
    pub nexthop: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOptions {
    pub uuid: String,
    pub cidr: String,
    pub options: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

/// Operations the orchestrator needs from the SDN logical control plane
#[async_trait]
pub trait LogicalTopology: Send + Sync {
    /// Create the switch unless it exists; returns its uuid.
    async fn ensure_switch(&self, name: &str, external_ids: &BTreeMap<String, String>) -> OvsResult<String>;
    async fn delete_switch(&self, name: &str) -> OvsResult<()>;
    async fn list_switches(&self) -> OvsResult<Vec<NamedObject>>;

    /// Create the port on `switch`, or converge an existing port of that name.
    async fn ensure_switch_port(&self, switch: &str, spec: &SwitchPortSpec) -> OvsResult<()>;
    async fn get_switch_port(&self, name: &str) -> OvsResult<Option<SwitchPortSpec>>;
    async fn delete_switch_port(&self, name: &str) -> OvsResult<()>;
    async fn list_switch_ports(&self, switch: &str) -> OvsResult<Vec<NamedObject>>;

    async fn ensure_router(&self, name: &str, external_ids: &BTreeMap<String, String>) -> OvsResult<String>;
    async fn delete_router(&self, name: &str) -> OvsResult<()>;
    async fn list_routers(&self) -> OvsResult<Vec<NamedObject>>;

    async fn ensure_router_port(&self, router: &str, name: &str, mac: &str, networks: &[String]) -> OvsResult<()>;
    async fn delete_router_port(&self, name: &str) -> OvsResult<()>;
    /// Ports of `router`, or of every router when `None`.
    async fn list_router_ports(&self, router: Option<&str>) -> OvsResult<Vec<RouterPortInfo>>;

    /// Add a route; an existing route for the same prefix counts as success.
    async fn add_static_route(&self, router: &str, prefix: &str, nexthop: &str) -> OvsResult<()>;
    async fn delete_static_route(&self, router: &str, prefix: &str) -> OvsResult<()>;
    async fn list_static_routes(&self, router: &str) -> OvsResult<Vec<StaticRoute>>;

    /// Create or update the DHCP option set identified by `external_ids`; returns its uuid.
    async fn ensure_dhcp_options(
        &self,
        cidr: &str,
        options: &BTreeMap<String, String>,
        external_ids: &BTreeMap<String, String>,
    ) -> OvsResult<String>;
    async fn find_dhcp_options(&self, external_ids: &BTreeMap<String, String>) -> OvsResult<Option<DhcpOptions>>;
    async fn delete_dhcp_options(&self, uuid: &str) -> OvsResult<()>;
    async fn set_port_dhcp(&self, port: &str, dhcp_uuid: &str) -> OvsResult<()>;
}

/// Hands out a topology adapter for a network's northbound connection string
pub trait TopologyConnector: Send + Sync {
    fn northbound(&self, endpoint: &DbEndpoint) -> Arc<dyn LogicalTopology>;
}

/// `LogicalTopology` backed by OVSDB JSON-RPC on `OVN_Northbound`
pub struct OvnNorthbound {
    client: OvsdbClient,
}

impl OvnNorthbound {
    pub fn new(endpoint: DbEndpoint, settings: RpcSettings) -> Self {
        Self {
            client: OvsdbClient::new(endpoint, NORTHBOUND_DATABASE, settings),
        }
    }

    pub fn from_client(client: OvsdbClient) -> Self {
        Self { client }
    }

    async fn uuid_of(&self, table: &str, name: &str) -> OvsResult<Option<String>> {
        Ok(self
            .client
            .find_by_name(table, name, &["_uuid"])
            .await?
            .as_ref()
            .and_then(row_uuid))
    }

    async fn list_named(&self, table: &str) -> OvsResult<Vec<NamedObject>> {
        let rows = self.client.select(table, json!([]), &["_uuid", "name"]).await?;
        let mut objects: Vec<NamedObject> = rows
            .iter()
            .filter_map(|row| {
                Some(NamedObject {
                    name: row["name"].as_str()?.to_string(),
                    uuid: row_uuid(row)?,
                })
            })
            .collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn ensure_named(&self, table: &str, name: &str, external_ids: &BTreeMap<String, String>) -> OvsResult<String> {
        if let Some(existing) = self.uuid_of(table, name).await? {
            debug!("{} {} already exists", table, name);
            return Ok(existing);
        }
        // Names are not indexed in these tables; the wait keeps them unique.
        let results = self
            .client
            .transact(vec![
                wait_for_rows(table, json!([["name", "==", name]]), &["name"], vec![]),
                json!({
                    "op": "insert",
                    "table": table,
                    "row": {"name": name, "external_ids": ovs_map(external_ids)}
                }),
            ])
            .await;
        match results {
            Ok(results) => {
                info!("Created {} {}", table, name);
                inserted_uuid(&results, 1)
            }
            Err(e) if e.is_already_exists() || e.is_guard_failed() => {
                debug!("{} {} created concurrently", table, name);
                self.uuid_of(table, name)
                    .await?
                    .ok_or_else(|| OvsError::NotFound(format!("{} {}", table, name)))
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_named(&self, table: &str, name: &str) -> OvsResult<()> {
        let results = self
            .client
            .transact(vec![json!({"op": "delete", "table": table, "where": [["name", "==", name]]})])
            .await?;
        if results.first().and_then(|r| r["count"].as_u64()).unwrap_or(0) > 0 {
            info!("Deleted {} {}", table, name);
        } else {
            debug!("{} {} not present", table, name);
        }
        Ok(())
    }

    /// The router's `static_routes` datum as read, and the entry for `prefix`
    /// in it as (`_uuid`, nexthop).
    async fn find_route(&self, router: &str, prefix: &str) -> OvsResult<(Value, Option<(String, String)>)> {
        let Some(router_row) = self.client.find_by_name("Logical_Router", router, &["static_routes"]).await? else {
            return Err(OvsError::NotFound(format!("logical router {}", router)));
        };
        let routes = router_row["static_routes"].clone();
        let members = parse_uuid_set(&routes);
        if members.is_empty() {
            return Ok((routes, None));
        }
        let rows = self
            .client
            .select(
                "Logical_Router_Static_Route",
                json!([["ip_prefix", "==", prefix]]),
                &["_uuid", "nexthop"],
            )
            .await?;
        let found = rows.iter().find_map(|row| {
            let id = row_uuid(row)?;
            members
                .contains(&id)
                .then(|| (id, row["nexthop"].as_str().unwrap_or_default().to_string()))
        });
        Ok((routes, found))
    }
}

fn inserted_uuid(results: &[Value], index: usize) -> OvsResult<String> {
    results
        .get(index)
        .and_then(|r| r["uuid"].as_array())
        .and_then(|u| u.get(1))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| OvsError::Parse("insert result carries no uuid".to_string()))
}

fn switch_port_row(spec: &SwitchPortSpec) -> Value {
    json!({
        "name": spec.name,
        "addresses": ovs_set(spec.addresses.iter().map(|a| json!(a)).collect()),
        "port_security": ovs_set(spec.port_security.iter().map(|a| json!(a)).collect()),
        "type": spec.port_type,
        "options": ovs_map(&spec.options),
        "external_ids": ovs_map(&spec.external_ids)
    })
}

fn includes_condition(external_ids: &BTreeMap<String, String>) -> Value {
    json!([["external_ids", "includes", ovs_map(external_ids)]])
}

#[async_trait]
impl LogicalTopology for OvnNorthbound {
    async fn ensure_switch(&self, name: &str, external_ids: &BTreeMap<String, String>) -> OvsResult<String> {
        self.ensure_named("Logical_Switch", name, external_ids).await
    }

    async fn delete_switch(&self, name: &str) -> OvsResult<()> {
        self.delete_named("Logical_Switch", name).await
    }

    async fn list_switches(&self) -> OvsResult<Vec<NamedObject>> {
        self.list_named("Logical_Switch").await
    }

    async fn ensure_switch_port(&self, switch: &str, spec: &SwitchPortSpec) -> OvsResult<()> {
        let switch_uuid = self
            .uuid_of("Logical_Switch", switch)
            .await?
            .ok_or_else(|| OvsError::NotFound(format!("logical switch {}", switch)))?;

        let operations = match self.uuid_of("Logical_Switch_Port", &spec.name).await? {
            Some(port_uuid) => {
                debug!("Logical port {} exists, converging", spec.name);
                vec![
                    json!({
                        "op": "update",
                        "table": "Logical_Switch_Port",
                        "where": [["_uuid", "==", uuid(&port_uuid)]],
                        "row": switch_port_row(spec)
                    }),
                    json!({
                        "op": "mutate",
                        "table": "Logical_Switch",
                        "where": [["_uuid", "==", uuid(&switch_uuid)]],
                        "mutations": [["ports", "insert", ovs_set(vec![uuid(&port_uuid)])]]
                    }),
                ]
            }
            None => {
                let port_ref = row_name("lsp", &spec.name);
                vec![
                    json!({
                        "op": "insert",
                        "table": "Logical_Switch_Port",
                        "uuid-name": port_ref,
                        "row": switch_port_row(spec)
                    }),
                    json!({
                        "op": "mutate",
                        "table": "Logical_Switch",
                        "where": [["_uuid", "==", uuid(&switch_uuid)]],
                        "mutations": [["ports", "insert", ovs_set(vec![named_uuid(&port_ref)])]]
                    }),
                ]
            }
        };

        self.client.transact(operations).await?;
        info!("Logical port {} on {} ({:?})", spec.name, switch, spec.addresses);
        Ok(())
    }

    async fn get_switch_port(&self, name: &str) -> OvsResult<Option<SwitchPortSpec>> {
        let Some(row) = self
            .client
            .find_by_name(
                "Logical_Switch_Port",
                name,
                &["name", "addresses", "port_security", "type", "options", "external_ids"],
            )
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(SwitchPortSpec {
            name: name.to_string(),
            addresses: parse_string_set(&row["addresses"]),
            port_security: parse_string_set(&row["port_security"]),
            port_type: row["type"].as_str().unwrap_or_default().to_string(),
            options: parse_map(&row["options"]),
            external_ids: parse_map(&row["external_ids"]),
        }))
    }

    async fn delete_switch_port(&self, name: &str) -> OvsResult<()> {
        let Some(port_uuid) = self.uuid_of("Logical_Switch_Port", name).await? else {
            debug!("Logical port {} not present", name);
            return Ok(());
        };
        self.client
            .transact(vec![
                json!({
                    "op": "mutate",
                    "table": "Logical_Switch",
                    "where": [["ports", "includes", uuid(&port_uuid)]],
                    "mutations": [["ports", "delete", uuid(&port_uuid)]]
                }),
                json!({"op": "delete", "table": "Logical_Switch_Port", "where": [["_uuid", "==", uuid(&port_uuid)]]}),
            ])
            .await?;
        info!("Deleted logical port {}", name);
        Ok(())
    }

    async fn list_switch_ports(&self, switch: &str) -> OvsResult<Vec<NamedObject>> {
        let Some(row) = self.client.find_by_name("Logical_Switch", switch, &["ports"]).await? else {
            return Err(OvsError::NotFound(format!("logical switch {}", switch)));
        };
        let members = parse_uuid_set(&row["ports"]);
        Ok(self
            .list_named("Logical_Switch_Port")
            .await?
            .into_iter()
            .filter(|p| members.contains(&p.uuid))
            .collect())
    }

    async fn ensure_router(&self, name: &str, external_ids: &BTreeMap<String, String>) -> OvsResult<String> {
        self.ensure_named("Logical_Router", name, external_ids).await
    }

    async fn delete_router(&self, name: &str) -> OvsResult<()> {
        self.delete_named("Logical_Router", name).await
    }

    async fn list_routers(&self) -> OvsResult<Vec<NamedObject>> {
        self.list_named("Logical_Router").await
    }

    async fn ensure_router_port(&self, router: &str, name: &str, mac: &str, networks: &[String]) -> OvsResult<()> {
        let router_uuid = self
            .uuid_of("Logical_Router", router)
            .await?
            .ok_or_else(|| OvsError::NotFound(format!("logical router {}", router)))?;
        let row = json!({
            "name": name,
            "mac": mac,
            "networks": ovs_set(networks.iter().map(|n| json!(n)).collect())
        });

        let operations = match self.uuid_of("Logical_Router_Port", name).await? {
            Some(port_uuid) => vec![
                json!({
                    "op": "update",
                    "table": "Logical_Router_Port",
                    "where": [["_uuid", "==", uuid(&port_uuid)]],
                    "row": row
                }),
                json!({
                    "op": "mutate",
                    "table": "Logical_Router",
                    "where": [["_uuid", "==", uuid(&router_uuid)]],
                    "mutations": [["ports", "insert", ovs_set(vec![uuid(&port_uuid)])]]
                }),
            ],
            None => {
                let port_ref = row_name("lrp", name);
                vec![
                    json!({"op": "insert", "table": "Logical_Router_Port", "uuid-name": port_ref, "row": row}),
                    json!({
                        "op": "mutate",
                        "table": "Logical_Router",
                        "where": [["_uuid", "==", uuid(&router_uuid)]],
                        "mutations": [["ports", "insert", ovs_set(vec![named_uuid(&port_ref)])]]
                    }),
                ]
            }
        };

        self.client.transact(operations).await?;
        info!("Router port {} on {} ({} {:?})", name, router, mac, networks);
        Ok(())
    }

    async fn delete_router_port(&self, name: &str) -> OvsResult<()> {
        let Some(port_uuid) = self.uuid_of("Logical_Router_Port", name).await? else {
            return Ok(());
        };
        self.client
            .transact(vec![
                json!({
                    "op": "mutate",
                    "table": "Logical_Router",
                    "where": [["ports", "includes", uuid(&port_uuid)]],
                    "mutations": [["ports", "delete", uuid(&port_uuid)]]
                }),
                json!({"op": "delete", "table": "Logical_Router_Port", "where": [["_uuid", "==", uuid(&port_uuid)]]}),
            ])
            .await?;
        info!("Deleted router port {}", name);
        Ok(())
    }

    async fn list_router_ports(&self, router: Option<&str>) -> OvsResult<Vec<RouterPortInfo>> {
        let members = match router {
            Some(router) => {
                let row = self
                    .client
                    .find_by_name("Logical_Router", router, &["ports"])
                    .await?
                    .ok_or_else(|| OvsError::NotFound(format!("logical router {}", router)))?;
                Some(parse_uuid_set(&row["ports"]))
            }
            None => None,
        };

        let rows = self
            .client
            .select("Logical_Router_Port", json!([]), &["_uuid", "name", "mac", "networks"])
            .await?;
        let mut ports: Vec<RouterPortInfo> = rows
            .iter()
            .filter(|row| match (&members, row_uuid(row)) {
                (Some(members), Some(id)) => members.contains(&id),
                (None, _) => true,
                _ => false,
            })
            .filter_map(|row| {
                Some(RouterPortInfo {
                    name: row["name"].as_str()?.to_string(),
                    mac: row["mac"].as_str().unwrap_or_default().to_string(),
                    networks: parse_string_set(&row["networks"]),
                })
            })
            .collect();
        ports.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ports)
    }

    async fn add_static_route(&self, router: &str, prefix: &str, nexthop: &str) -> OvsResult<()> {
        for attempt in 1..=ROUTE_ATTEMPTS {
            let (routes, existing) = self.find_route(router, prefix).await?;
            if let Some((_, existing)) = existing {
                if existing == nexthop {
                    debug!("Route {} via {} on {} already exists", prefix, nexthop, router);
                } else {
                    info!(
                        "Route {} on {} already present via {}, keeping it (requested {})",
                        prefix, router, existing, nexthop
                    );
                }
                return Ok(());
            }

            // Insert only if the router's route set is still what we just read.
            let route_ref = row_name("route", prefix);
            let result = self
                .client
                .transact(vec![
                    wait_for_rows(
                        "Logical_Router",
                        json!([["name", "==", router]]),
                        &["static_routes"],
                        vec![json!({ "static_routes": routes })],
                    ),
                    json!({
                        "op": "insert",
                        "table": "Logical_Router_Static_Route",
                        "uuid-name": route_ref,
                        "row": {"ip_prefix": prefix, "nexthop": nexthop}
                    }),
                    json!({
                        "op": "mutate",
                        "table": "Logical_Router",
                        "where": [["name", "==", router]],
                        "mutations": [["static_routes", "insert", ovs_set(vec![named_uuid(&route_ref)])]]
                    }),
                ])
                .await;

            match result {
                Ok(_) => {
                    info!("Added route {} via {} on {}", prefix, nexthop, router);
                    return Ok(());
                }
                Err(e) if e.is_already_exists() => {
                    debug!("Route {} on {} is a duplicate prefix", prefix, router);
                    return Ok(());
                }
                Err(e) if e.is_guard_failed() => {
                    debug!("Routes on {} changed concurrently, re-reading (attempt {})", router, attempt);
                }
                Err(e) => return Err(e),
            }
        }
        Err(OvsError::Transaction {
            error: "timed out".to_string(),
            details: format!("routes on {} kept changing while adding {}", router, prefix),
        })
    }

    async fn delete_static_route(&self, router: &str, prefix: &str) -> OvsResult<()> {
        let route = match self.find_route(router, prefix).await {
            Ok((_, route)) => route,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let Some((route_uuid, _)) = route else {
            return Ok(());
        };
        self.client
            .transact(vec![
                json!({
                    "op": "mutate",
                    "table": "Logical_Router",
                    "where": [["name", "==", router]],
                    "mutations": [["static_routes", "delete", uuid(&route_uuid)]]
                }),
                json!({
                    "op": "delete",
                    "table": "Logical_Router_Static_Route",
                    "where": [["_uuid", "==", uuid(&route_uuid)]]
                }),
            ])
            .await?;
        info!("Deleted route {} on {}", prefix, router);
        Ok(())
    }

    async fn list_static_routes(&self, router: &str) -> OvsResult<Vec<StaticRoute>> {
        let row = self
            .client
            .find_by_name("Logical_Router", router, &["static_routes"])
            .await?
            .ok_or_else(|| OvsError::NotFound(format!("logical router {}", router)))?;
        let members = parse_uuid_set(&row["static_routes"]);
        let rows = self
            .client
            .select("Logical_Router_Static_Route", json!([]), &["_uuid", "ip_prefix", "nexthop"])
            .await?;
        Ok(rows
            .iter()
            .filter(|row| row_uuid(row).map(|id| members.contains(&id)).unwrap_or(false))
            .filter_map(|row| {
                Some(StaticRoute {
                    prefix: row["ip_prefix"].as_str()?.to_string(),
                    nexthop: row["nexthop"].as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn ensure_dhcp_options(
        &self,
        cidr: &str,
        options: &BTreeMap<String, String>,
        external_ids: &BTreeMap<String, String>,
    ) -> OvsResult<String> {
        if let Some(existing) = self.find_dhcp_options(external_ids).await? {
            if existing.cidr != cidr || &existing.options != options {
                self.client
                    .transact(vec![json!({
                        "op": "update",
                        "table": "DHCP_Options",
                        "where": [["_uuid", "==", uuid(&existing.uuid)]],
                        "row": {"cidr": cidr, "options": ovs_map(options)}
                    })])
                    .await?;
                info!("Updated DHCP options {} for {}", existing.uuid, cidr);
            }
            return Ok(existing.uuid);
        }

        let results = self
            .client
            .transact(vec![
                wait_for_rows("DHCP_Options", includes_condition(external_ids), &["external_ids"], vec![]),
                json!({
                    "op": "insert",
                    "table": "DHCP_Options",
                    "row": {"cidr": cidr, "options": ovs_map(options), "external_ids": ovs_map(external_ids)}
                }),
            ])
            .await;
        match results {
            Ok(results) => {
                let id = inserted_uuid(&results, 1)?;
                info!("Created DHCP options {} for {}", id, cidr);
                Ok(id)
            }
            Err(e) if e.is_guard_failed() => {
                debug!("DHCP options for {} created concurrently", cidr);
                self.find_dhcp_options(external_ids)
                    .await?
                    .map(|existing| existing.uuid)
                    .ok_or_else(|| OvsError::NotFound(format!("DHCP options for {}", cidr)))
            }
            Err(e) => Err(e),
        }
    }

    async fn find_dhcp_options(&self, external_ids: &BTreeMap<String, String>) -> OvsResult<Option<DhcpOptions>> {
        let rows = self
            .client
            .select(
                "DHCP_Options",
                includes_condition(external_ids),
                &["_uuid", "cidr", "options", "external_ids"],
            )
            .await?;
        Ok(rows.iter().find_map(|row| {
            Some(DhcpOptions {
                uuid: row_uuid(row)?,
                cidr: row["cidr"].as_str()?.to_string(),
                options: parse_map(&row["options"]),
                external_ids: parse_map(&row["external_ids"]),
            })
        }))
    }

    async fn delete_dhcp_options(&self, dhcp_uuid: &str) -> OvsResult<()> {
        // Ports still referencing the set must drop the reference first.
        self.client
            .transact(vec![
                json!({
                    "op": "update",
                    "table": "Logical_Switch_Port",
                    "where": [["dhcpv4_options", "==", uuid(dhcp_uuid)]],
                    "row": {"dhcpv4_options": ovs_set(vec![])}
                }),
                json!({"op": "delete", "table": "DHCP_Options", "where": [["_uuid", "==", uuid(dhcp_uuid)]]}),
            ])
            .await?;
        info!("Deleted DHCP options {}", dhcp_uuid);
        Ok(())
    }

    async fn set_port_dhcp(&self, port: &str, dhcp_uuid: &str) -> OvsResult<()> {
        let results = self
            .client
            .transact(vec![json!({
                "op": "update",
                "table": "Logical_Switch_Port",
                "where": [["name", "==", port]],
                "row": {"dhcpv4_options": uuid(dhcp_uuid)}
            })])
            .await?;
        if results.first().and_then(|r| r["count"].as_u64()) == Some(0) {
            return Err(OvsError::NotFound(format!("logical port {}", port)));
        }
        Ok(())
    }
}

/// Connects to whichever northbound endpoint a network declares
pub struct OvnConnector {
    settings: RpcSettings,
}

impl OvnConnector {
    pub fn new(settings: RpcSettings) -> Self {
        Self { settings }
    }
}

impl TopologyConnector for OvnConnector {
    fn northbound(&self, endpoint: &DbEndpoint) -> Arc<dyn LogicalTopology> {
        Arc::new(OvnNorthbound::new(endpoint.clone(), self.settings.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{table_responder, FakeOvsdb};

    fn router_with_route(table: &str, conditions: &Value) -> Vec<Value> {
        match table {
            "Logical_Router" => vec![json!({"_uuid": ["uuid", "r1"], "static_routes": ["uuid", "route-1"]})],
            "Logical_Router_Static_Route" if conditions[0][2] == "10.0.0.0/24" => {
                vec![json!({"_uuid": ["uuid", "route-1"], "nexthop": "100.64.0.11"})]
            }
            _ => vec![],
        }
    }

    #[tokio::test]
    async fn test_existing_route_is_not_added_again() {
        let server = FakeOvsdb::start(table_responder(router_with_route));
        let nb = OvnNorthbound::from_client(server.client(NORTHBOUND_DATABASE));

        nb.add_static_route("lr-gateway", "10.0.0.0/24", "100.64.0.11").await.unwrap();
        // Same prefix, different nexthop: still treated as present.
        nb.add_static_route("lr-gateway", "10.0.0.0/24", "100.64.0.12").await.unwrap();
        assert!(server.ops_named("insert").is_empty());
    }

    #[tokio::test]
    async fn test_new_route_is_inserted_once() {
        let server = FakeOvsdb::start(table_responder(router_with_route));
        let nb = OvnNorthbound::from_client(server.client(NORTHBOUND_DATABASE));

        nb.add_static_route("lr-gateway", "10.1.0.0/24", "100.64.0.12").await.unwrap();
        let inserts = server.ops_named("insert");
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0]["row"]["ip_prefix"], "10.1.0.0/24");
    }

    #[tokio::test]
    async fn test_duplicate_prefix_error_is_success() {
        let server = FakeOvsdb::start(|params: &Value| {
            let ops = params.as_array().cloned().unwrap_or_default();
            if ops.iter().skip(1).any(|op| op["op"] == "insert") {
                json!([{"error": "constraint violation", "details": "duplicate prefix"}])
            } else {
                json!([{"rows": [{"_uuid": ["uuid", "r1"], "static_routes": ["set", []]}]}])
            }
        });
        let nb = OvnNorthbound::from_client(server.client(NORTHBOUND_DATABASE));

        nb.add_static_route("lr-gateway", "0.0.0.0/0", "100.64.0.1").await.unwrap();
    }

    /// Answers like `table_responder`, except a transaction carrying a `wait`
    /// fails its guard; from then on `after` supplies the select rows.
    fn racing_responder(
        before: fn(&str, &Value) -> Vec<Value>,
        after: fn(&str, &Value) -> Vec<Value>,
    ) -> impl Fn(&Value) -> Value + Send + Sync + 'static {
        let raced = std::sync::atomic::AtomicBool::new(false);
        move |params: &Value| {
            let ops = params.as_array().cloned().unwrap_or_default();
            if ops.iter().skip(1).any(|op| op["op"] == "wait") {
                raced.store(true, std::sync::atomic::Ordering::SeqCst);
                return json!([{"error": "timed out", "details": "\"wait\" timed out"}]);
            }
            let rows = if raced.load(std::sync::atomic::Ordering::SeqCst) { after } else { before };
            table_responder(rows)(params)
        }
    }

    #[tokio::test]
    async fn test_switch_insert_is_guarded_by_wait() {
        let server = FakeOvsdb::start(table_responder(|_, _| vec![]));
        let nb = OvnNorthbound::from_client(server.client(NORTHBOUND_DATABASE));

        nb.ensure_switch("ls-a", &BTreeMap::new()).await.unwrap();
        let ops = server.operations();
        let insert = ops.iter().position(|o| o["op"] == "insert").unwrap();
        let wait = &ops[insert - 1];
        assert_eq!(wait["op"], "wait");
        assert_eq!(wait["table"], "Logical_Switch");
        assert_eq!(wait["where"], json!([["name", "==", "ls-a"]]));
        assert_eq!(wait["until"], "==");
        assert_eq!(wait["rows"], json!([]));
        assert_eq!(wait["timeout"], 0);
    }

    #[tokio::test]
    async fn test_switch_created_concurrently_is_reused() {
        let server = FakeOvsdb::start(racing_responder(
            |_, _| vec![],
            |table, _| match table {
                "Logical_Switch" => vec![json!({"_uuid": ["uuid", "s-other"]})],
                _ => vec![],
            },
        ));
        let nb = OvnNorthbound::from_client(server.client(NORTHBOUND_DATABASE));

        let id = nb.ensure_switch("ls-a", &BTreeMap::new()).await.unwrap();
        assert_eq!(id, "s-other");
        assert_eq!(server.ops_named("insert").len(), 1);
    }

    #[tokio::test]
    async fn test_route_added_concurrently_is_not_duplicated() {
        let server = FakeOvsdb::start(racing_responder(
            |table, _| match table {
                "Logical_Router" => vec![json!({"_uuid": ["uuid", "r1"], "static_routes": ["set", []]})],
                _ => vec![],
            },
            router_with_route,
        ));
        let nb = OvnNorthbound::from_client(server.client(NORTHBOUND_DATABASE));

        nb.add_static_route("lr-gateway", "10.0.0.0/24", "100.64.0.11").await.unwrap();
        // Only the rejected attempt carried an insert.
        assert_eq!(server.ops_named("insert").len(), 1);
        let wait = &server.ops_named("wait")[0];
        assert_eq!(wait["table"], "Logical_Router");
        assert_eq!(wait["columns"], json!(["static_routes"]));
        assert_eq!(wait["rows"], json!([{"static_routes": ["set", []]}]));
    }

    #[tokio::test]
    async fn test_dhcp_options_created_concurrently_are_reused() {
        let server = FakeOvsdb::start(racing_responder(
            |_, _| vec![],
            |table, _| match table {
                "DHCP_Options" => vec![json!({
                    "_uuid": ["uuid", "d-other"],
                    "cidr": "10.0.0.0/24",
                    "options": ["map", []],
                    "external_ids": ["map", [["ovsnet-network", "net1"]]]
                })],
                _ => vec![],
            },
        ));
        let nb = OvnNorthbound::from_client(server.client(NORTHBOUND_DATABASE));

        let ids = BTreeMap::from([("ovsnet-network".to_string(), "net1".to_string())]);
        let id = nb.ensure_dhcp_options("10.0.0.0/24", &BTreeMap::new(), &ids).await.unwrap();
        assert_eq!(id, "d-other");
    }

    #[tokio::test]
    async fn test_ensure_switch_port_requires_switch() {
        let server = FakeOvsdb::start(table_responder(|_, _| vec![]));
        let nb = OvnNorthbound::from_client(server.client(NORTHBOUND_DATABASE));

        let spec = SwitchPortSpec {
            name: "lsp-abc".into(),
            ..Default::default()
        };
        let err = nb.ensure_switch_port("ls-missing", &spec).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_ensure_switch_port_converges_existing_port() {
        let server = FakeOvsdb::start(table_responder(|table, _| match table {
            "Logical_Switch" => vec![json!({"_uuid": ["uuid", "s1"]})],
            "Logical_Switch_Port" => vec![json!({"_uuid": ["uuid", "p1"]})],
            _ => vec![],
        }));
        let nb = OvnNorthbound::from_client(server.client(NORTHBOUND_DATABASE));

        let spec = SwitchPortSpec {
            name: "lsp-abc".into(),
            addresses: vec!["02:00:0a:00:00:02 10.0.0.2".into()],
            port_security: vec!["02:00:0a:00:00:02 10.0.0.2".into()],
            ..Default::default()
        };
        nb.ensure_switch_port("ls-a", &spec).await.unwrap();
        assert!(server.ops_named("insert").is_empty());
        assert_eq!(server.ops_named("update").len(), 1);
    }

    #[tokio::test]
    async fn test_delete_absent_objects_succeed() {
        let server = FakeOvsdb::start(table_responder(|_, _| vec![]));
        let nb = OvnNorthbound::from_client(server.client(NORTHBOUND_DATABASE));

        nb.delete_switch_port("lsp-gone").await.unwrap();
        nb.delete_router_port("rp-gone").await.unwrap();
        nb.delete_static_route("lr-gone", "10.9.0.0/24").await.unwrap();
        assert!(server.ops_named("delete").is_empty());
    }
}
