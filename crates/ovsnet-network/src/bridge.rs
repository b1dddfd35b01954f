//! Bridge/Port adapter over the local `Open_vSwitch` database
//!
//! Every operation is an "ensure" or an idempotent delete: creating what
//! already exists converges the row to the requested state, deleting what is
//! absent succeeds. Deletes are scoped to exactly the named row.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::ovs_error::{OvsError, OvsResult};
use crate::ovsdb::{
    named_uuid, ovs_map, ovs_set, parse_map, parse_optional_int, parse_uuid_set, row_name, row_uuid, uuid,
    DbEndpoint, OvsdbClient, RpcSettings,
};

/// Database served on the local OVSDB socket
pub const SWITCH_DATABASE: &str = "Open_vSwitch";

/// Metadata applied when attaching a port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortConfig {
    /// Access VLAN tag
    pub tag: Option<u16>,
    /// Interface `external_ids` (endpoint id, network id, `iface-id`, ...)
    pub external_ids: BTreeMap<String, String>,
}

/// Live state of one bridge port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub tag: Option<u16>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorInfo {
    pub name: String,
    pub select_ports: Vec<String>,
    pub output_port: Option<String>,
}

/// Chassis-level settings read by ovn-controller from `Open_vSwitch.external_ids`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChassisConfig {
    /// `ovn-remote`; only written when the key is unset
    pub ovn_remote: Option<String>,
    /// `ovn-encap-type`
    pub encap_type: Option<String>,
    /// `ovn-encap-ip`
    pub encap_ip: Option<String>,
}

/// Operations the lifecycle needs from the local virtual switch
#[async_trait]
pub trait BridgeAdapter: Send + Sync {
    async fn bridge_exists(&self, bridge: &str) -> OvsResult<bool>;

    /// Create the bridge (fail_mode=secure) unless it exists.
    async fn ensure_bridge(&self, bridge: &str) -> OvsResult<()>;

    /// Attach `port`, or converge its tag and external ids if already attached.
    async fn add_port(&self, bridge: &str, port: &str, config: &PortConfig) -> OvsResult<()>;

    async fn delete_port(&self, bridge: &str, port: &str) -> OvsResult<()>;

    async fn set_port_vlan(&self, port: &str, tag: Option<u16>) -> OvsResult<()>;

    async fn get_port_info(&self, port: &str) -> OvsResult<Option<PortInfo>>;

    async fn list_ports(&self, bridge: &str) -> OvsResult<Vec<PortInfo>>;

    async fn create_mirror(&self, bridge: &str, name: &str, sources: &[String], output: &str) -> OvsResult<()>;

    async fn delete_mirror(&self, bridge: &str, name: &str) -> OvsResult<()>;

    async fn list_mirrors(&self, bridge: &str) -> OvsResult<Vec<MirrorInfo>>;

    async fn ensure_chassis_config(&self, config: &ChassisConfig) -> OvsResult<()>;

    /// Ports on `bridge` whose external id `key` equals `value`.
    async fn ports_with_external_id(&self, bridge: &str, key: &str, value: &str) -> OvsResult<Vec<PortInfo>> {
        Ok(self
            .list_ports(bridge)
            .await?
            .into_iter()
            .filter(|p| p.external_ids.get(key).map(String::as_str) == Some(value))
            .collect())
    }
}

/// `BridgeAdapter` backed by OVSDB JSON-RPC
pub struct OvsdbBridge {
    client: OvsdbClient,
}

impl OvsdbBridge {
    pub fn new(client: OvsdbClient) -> Self {
        Self { client }
    }

    /// Bridge adapter on a local unix socket.
    pub fn connect(socket: impl Into<std::path::PathBuf>, settings: RpcSettings) -> Self {
        Self::new(OvsdbClient::new(DbEndpoint::Unix(socket.into()), SWITCH_DATABASE, settings))
    }

    async fn bridge_uuid(&self, bridge: &str) -> OvsResult<Option<String>> {
        let row = self.client.find_by_name("Bridge", bridge, &["_uuid"]).await?;
        Ok(row.as_ref().and_then(row_uuid))
    }

    async fn require_bridge(&self, bridge: &str) -> OvsResult<String> {
        self.bridge_uuid(bridge)
            .await?
            .ok_or_else(|| OvsError::NotFound(format!("bridge {}", bridge)))
    }

    /// Join Port and Interface rows into `PortInfo`, keyed by port uuid.
    async fn port_table(&self) -> OvsResult<HashMap<String, PortInfo>> {
        let results = self
            .client
            .transact(vec![
                json!({"op": "select", "table": "Port", "where": [], "columns": ["_uuid", "name", "tag", "interfaces"]}),
                json!({"op": "select", "table": "Interface", "where": [], "columns": ["_uuid", "external_ids"]}),
            ])
            .await?;

        let ifaces: HashMap<String, BTreeMap<String, String>> = rows(&results, 1)
            .iter()
            .filter_map(|row| Some((row_uuid(row)?, parse_map(&row["external_ids"]))))
            .collect();

        Ok(rows(&results, 0)
            .iter()
            .filter_map(|row| {
                let port_uuid = row_uuid(row)?;
                let mut external_ids = BTreeMap::new();
                for iface in parse_uuid_set(&row["interfaces"]) {
                    if let Some(ids) = ifaces.get(&iface) {
                        external_ids.extend(ids.clone());
                    }
                }
                let info = PortInfo {
                    name: row["name"].as_str()?.to_string(),
                    tag: parse_optional_int(&row["tag"]).and_then(|t| u16::try_from(t).ok()),
                    external_ids,
                };
                Some((port_uuid, info))
            })
            .collect())
    }

    async fn bridge_column(&self, bridge: &str, column: &str) -> OvsResult<Vec<String>> {
        let row = self
            .client
            .find_by_name("Bridge", bridge, &[column])
            .await?
            .ok_or_else(|| OvsError::NotFound(format!("bridge {}", bridge)))?;
        Ok(parse_uuid_set(&row[column]))
    }
}

fn rows(results: &[Value], index: usize) -> Vec<Value> {
    results
        .get(index)
        .and_then(|r| r.get("rows"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn tag_datum(tag: Option<u16>) -> Value {
    match tag {
        Some(tag) => json!(tag),
        None => ovs_set(vec![]),
    }
}

#[async_trait]
impl BridgeAdapter for OvsdbBridge {
    async fn bridge_exists(&self, bridge: &str) -> OvsResult<bool> {
        Ok(self.bridge_uuid(bridge).await?.is_some())
    }

    async fn ensure_bridge(&self, bridge: &str) -> OvsResult<()> {
        if self.bridge_exists(bridge).await? {
            debug!("Bridge {} already exists", bridge);
            return Ok(());
        }

        let iface_ref = row_name("iface", bridge);
        let port_ref = row_name("port", bridge);
        let bridge_ref = row_name("bridge", bridge);
        let operations = vec![
            json!({
                "op": "insert",
                "table": "Interface",
                "uuid-name": iface_ref,
                "row": {"name": bridge, "type": "internal"}
            }),
            json!({
                "op": "insert",
                "table": "Port",
                "uuid-name": port_ref,
                "row": {"name": bridge, "interfaces": ovs_set(vec![named_uuid(&iface_ref)])}
            }),
            json!({
                "op": "insert",
                "table": "Bridge",
                "uuid-name": bridge_ref,
                "row": {
                    "name": bridge,
                    "fail_mode": "secure",
                    "ports": ovs_set(vec![named_uuid(&port_ref)])
                }
            }),
            json!({
                "op": "mutate",
                "table": "Open_vSwitch",
                "where": [],
                "mutations": [["bridges", "insert", ovs_set(vec![named_uuid(&bridge_ref)])]]
            }),
        ];

        match self.client.transact(operations).await {
            Ok(_) => {
                info!("Created bridge {} (fail_mode=secure)", bridge);
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!("Bridge {} created concurrently", bridge);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn add_port(&self, bridge: &str, port: &str, config: &PortConfig) -> OvsResult<()> {
        let bridge_uuid = self.require_bridge(bridge).await?;

        if let Some(existing) = self.client.find_by_name("Port", port, &["_uuid"]).await? {
            let port_uuid = row_uuid(&existing).unwrap_or_default();
            self.client
                .transact(vec![
                    json!({
                        "op": "update",
                        "table": "Port",
                        "where": [["_uuid", "==", uuid(&port_uuid)]],
                        "row": {"tag": tag_datum(config.tag)}
                    }),
                    json!({
                        "op": "update",
                        "table": "Interface",
                        "where": [["name", "==", port]],
                        "row": {"external_ids": ovs_map(&config.external_ids)}
                    }),
                ])
                .await?;
            debug!("Port {} already on a bridge, converged tag and external ids", port);
            return Ok(());
        }

        let iface_ref = row_name("iface", port);
        let port_ref = row_name("port", port);
        let mut port_row = json!({
            "name": port,
            "interfaces": ovs_set(vec![named_uuid(&iface_ref)])
        });
        if let Some(tag) = config.tag {
            port_row["tag"] = json!(tag);
        }

        let operations = vec![
            json!({
                "op": "insert",
                "table": "Interface",
                "uuid-name": iface_ref,
                "row": {"name": port, "external_ids": ovs_map(&config.external_ids)}
            }),
            json!({"op": "insert", "table": "Port", "uuid-name": port_ref, "row": port_row}),
            json!({
                "op": "mutate",
                "table": "Bridge",
                "where": [["_uuid", "==", uuid(&bridge_uuid)]],
                "mutations": [["ports", "insert", ovs_set(vec![named_uuid(&port_ref)])]]
            }),
        ];

        self.client.transact(operations).await?;
        info!("Port {} added to bridge {} (tag: {:?})", port, bridge, config.tag);
        Ok(())
    }

    async fn delete_port(&self, bridge: &str, port: &str) -> OvsResult<()> {
        let Some(port_uuid) = self
            .client
            .find_by_name("Port", port, &["_uuid"])
            .await?
            .as_ref()
            .and_then(row_uuid)
        else {
            debug!("Port {} not present, nothing to delete", port);
            return Ok(());
        };

        let operations = vec![
            json!({
                "op": "mutate",
                "table": "Bridge",
                "where": [["name", "==", bridge]],
                "mutations": [["ports", "delete", uuid(&port_uuid)]]
            }),
            json!({"op": "delete", "table": "Port", "where": [["_uuid", "==", uuid(&port_uuid)]]}),
            json!({"op": "delete", "table": "Interface", "where": [["name", "==", port]]}),
        ];

        match self.client.transact(operations).await {
            Ok(_) => {
                info!("Port {} removed from bridge {}", port, bridge);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_port_vlan(&self, port: &str, tag: Option<u16>) -> OvsResult<()> {
        let results = self
            .client
            .transact(vec![json!({
                "op": "update",
                "table": "Port",
                "where": [["name", "==", port]],
                "row": {"tag": tag_datum(tag)}
            })])
            .await?;
        if results.first().and_then(|r| r["count"].as_u64()) == Some(0) {
            return Err(OvsError::NotFound(format!("port {}", port)));
        }
        Ok(())
    }

    async fn get_port_info(&self, port: &str) -> OvsResult<Option<PortInfo>> {
        let results = self
            .client
            .transact(vec![
                json!({"op": "select", "table": "Port", "where": [["name", "==", port]], "columns": ["name", "tag"]}),
                json!({"op": "select", "table": "Interface", "where": [["name", "==", port]], "columns": ["external_ids"]}),
            ])
            .await?;

        let Some(port_row) = rows(&results, 0).into_iter().next() else {
            return Ok(None);
        };
        let external_ids = rows(&results, 1)
            .first()
            .map(|iface| parse_map(&iface["external_ids"]))
            .unwrap_or_default();

        Ok(Some(PortInfo {
            name: port.to_string(),
            tag: parse_optional_int(&port_row["tag"]).and_then(|t| u16::try_from(t).ok()),
            external_ids,
        }))
    }

    async fn list_ports(&self, bridge: &str) -> OvsResult<Vec<PortInfo>> {
        let members = self.bridge_column(bridge, "ports").await?;
        let mut table = self.port_table().await?;
        let mut ports: Vec<PortInfo> = members.iter().filter_map(|u| table.remove(u)).collect();
        ports.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ports)
    }

    async fn create_mirror(&self, bridge: &str, name: &str, sources: &[String], output: &str) -> OvsResult<()> {
        if self.client.find_by_name("Mirror", name, &["_uuid"]).await?.is_some() {
            debug!("Mirror {} already exists", name);
            return Ok(());
        }
        let bridge_uuid = self.require_bridge(bridge).await?;

        let by_name: HashMap<String, String> = self
            .port_table()
            .await?
            .into_iter()
            .map(|(port_uuid, info)| (info.name, port_uuid))
            .collect();
        let resolve = |port: &str| {
            by_name
                .get(port)
                .cloned()
                .ok_or_else(|| OvsError::NotFound(format!("port {}", port)))
        };

        let output_uuid = resolve(output)?;
        let selected = sources
            .iter()
            .map(|s| resolve(s).map(|u| uuid(&u)))
            .collect::<OvsResult<Vec<_>>>()?;

        let mirror_ref = row_name("mirror", name);
        let operations = vec![
            json!({
                "op": "insert",
                "table": "Mirror",
                "uuid-name": mirror_ref,
                "row": {
                    "name": name,
                    "select_src_port": ovs_set(selected.clone()),
                    "select_dst_port": ovs_set(selected),
                    "output_port": uuid(&output_uuid)
                }
            }),
            json!({
                "op": "mutate",
                "table": "Bridge",
                "where": [["_uuid", "==", uuid(&bridge_uuid)]],
                "mutations": [["mirrors", "insert", ovs_set(vec![named_uuid(&mirror_ref)])]]
            }),
        ];

        self.client.transact(operations).await?;
        info!("Mirror {} on {}: {:?} -> {}", name, bridge, sources, output);
        Ok(())
    }

    async fn delete_mirror(&self, bridge: &str, name: &str) -> OvsResult<()> {
        let Some(mirror_uuid) = self
            .client
            .find_by_name("Mirror", name, &["_uuid"])
            .await?
            .as_ref()
            .and_then(row_uuid)
        else {
            return Ok(());
        };

        self.client
            .transact(vec![
                json!({
                    "op": "mutate",
                    "table": "Bridge",
                    "where": [["name", "==", bridge]],
                    "mutations": [["mirrors", "delete", uuid(&mirror_uuid)]]
                }),
                json!({"op": "delete", "table": "Mirror", "where": [["_uuid", "==", uuid(&mirror_uuid)]]}),
            ])
            .await?;
        info!("Mirror {} removed from {}", name, bridge);
        Ok(())
    }

    async fn list_mirrors(&self, bridge: &str) -> OvsResult<Vec<MirrorInfo>> {
        let members = self.bridge_column(bridge, "mirrors").await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let port_names: HashMap<String, String> = self
            .port_table()
            .await?
            .into_iter()
            .map(|(port_uuid, info)| (port_uuid, info.name))
            .collect();
        let mirror_rows = self
            .client
            .select("Mirror", json!([]), &["_uuid", "name", "select_src_port", "output_port"])
            .await?;

        Ok(mirror_rows
            .iter()
            .filter(|row| row_uuid(row).map(|u| members.contains(&u)).unwrap_or(false))
            .filter_map(|row| {
                Some(MirrorInfo {
                    name: row["name"].as_str()?.to_string(),
                    select_ports: parse_uuid_set(&row["select_src_port"])
                        .iter()
                        .filter_map(|u| port_names.get(u).cloned())
                        .collect(),
                    output_port: parse_uuid_set(&row["output_port"])
                        .first()
                        .and_then(|u| port_names.get(u).cloned()),
                })
            })
            .collect())
    }

    async fn ensure_chassis_config(&self, config: &ChassisConfig) -> OvsResult<()> {
        let current = self
            .client
            .select("Open_vSwitch", json!([]), &["external_ids"])
            .await?
            .first()
            .map(|row| parse_map(&row["external_ids"]))
            .unwrap_or_default();

        let mut wanted = BTreeMap::new();
        if let Some(remote) = &config.ovn_remote {
            if !current.contains_key("ovn-remote") {
                wanted.insert("ovn-remote".to_string(), remote.clone());
            }
        }
        if let Some(encap) = &config.encap_type {
            wanted.insert("ovn-encap-type".to_string(), encap.clone());
        }
        if let Some(ip) = &config.encap_ip {
            wanted.insert("ovn-encap-ip".to_string(), ip.clone());
        }
        wanted.retain(|k, v| current.get(k) != Some(v));
        if wanted.is_empty() {
            return Ok(());
        }

        let keys: Vec<Value> = wanted.keys().map(|k| json!(k)).collect();
        self.client
            .transact(vec![json!({
                "op": "mutate",
                "table": "Open_vSwitch",
                "where": [],
                "mutations": [
                    ["external_ids", "delete", ovs_set(keys)],
                    ["external_ids", "insert", ovs_map(&wanted)]
                ]
            })])
            .await?;
        info!("Updated chassis config: {:?}", wanted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{table_responder, FakeOvsdb};

    #[tokio::test]
    async fn test_ensure_existing_bridge_is_read_only() {
        let server = FakeOvsdb::start(table_responder(|table, _| match table {
            "Bridge" => vec![json!({"_uuid": ["uuid", "b1"]})],
            _ => vec![],
        }));
        let bridge = OvsdbBridge::new(server.client(SWITCH_DATABASE));

        bridge.ensure_bridge("br-int").await.unwrap();
        assert!(server.ops_named("insert").is_empty());
    }

    #[tokio::test]
    async fn test_ensure_bridge_creates_secure_bridge() {
        let server = FakeOvsdb::start(table_responder(|_, _| vec![]));
        let bridge = OvsdbBridge::new(server.client(SWITCH_DATABASE));

        bridge.ensure_bridge("br-test").await.unwrap();
        let inserts = server.ops_named("insert");
        let bridge_row = inserts.iter().find(|op| op["table"] == "Bridge").unwrap();
        assert_eq!(bridge_row["row"]["fail_mode"], "secure");
        assert!(inserts.iter().any(|op| op["table"] == "Interface" && op["row"]["type"] == "internal"));
    }

    #[tokio::test]
    async fn test_delete_absent_port_succeeds() {
        let server = FakeOvsdb::start(table_responder(|_, _| vec![]));
        let bridge = OvsdbBridge::new(server.client(SWITCH_DATABASE));

        bridge.delete_port("br-int", "veth1234567-p").await.unwrap();
        assert!(server.ops_named("delete").is_empty());
    }

    #[tokio::test]
    async fn test_get_port_info_merges_interface_ids() {
        let server = FakeOvsdb::start(table_responder(|table, _| match table {
            "Port" => vec![json!({"name": "veth1-p", "tag": 100})],
            "Interface" => vec![json!({"external_ids": ["map", [["endpoint_id", "ep1"]]]})],
            _ => vec![],
        }));
        let bridge = OvsdbBridge::new(server.client(SWITCH_DATABASE));

        let info = bridge.get_port_info("veth1-p").await.unwrap().unwrap();
        assert_eq!(info.tag, Some(100));
        assert_eq!(info.external_ids.get("endpoint_id").map(String::as_str), Some("ep1"));
    }

    #[tokio::test]
    async fn test_chassis_config_keeps_existing_remote() {
        let server = FakeOvsdb::start(table_responder(|table, _| match table {
            "Open_vSwitch" => vec![json!({"external_ids": ["map", [["ovn-remote", "tcp:10.0.0.1:6642"]]]})],
            _ => vec![],
        }));
        let bridge = OvsdbBridge::new(server.client(SWITCH_DATABASE));

        let config = ChassisConfig {
            ovn_remote: Some("tcp:172.30.0.5:6642".into()),
            encap_type: Some("geneve".into()),
            encap_ip: None,
        };
        bridge.ensure_chassis_config(&config).await.unwrap();

        let mutates = server.ops_named("mutate");
        assert_eq!(mutates.len(), 1);
        let written = mutates[0]["mutations"][1][2].to_string();
        assert!(written.contains("ovn-encap-type"));
        assert!(!written.contains("ovn-remote"));
    }
}
