//! Persisted records

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One logical network managed by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub bridge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovn_switch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovn_router: Option<String>,
    /// Normalized option map
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Address pool data handed over by the runtime, kept verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam_data: Option<Value>,
}

/// One container attachment, owned by a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub network_id: String,
    pub endpoint_id: String,
    #[serde(default)]
    pub container_id: String,
    pub veth_name: String,
    /// Address with prefix, e.g. `10.0.0.2/24`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub mac_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovn_port: Option<String>,
    /// Sandbox the endpoint is joined to; cleared on leave
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_key: Option<String>,
}

impl EndpointRecord {
    pub fn key(&self) -> String {
        endpoint_key(&self.network_id, &self.endpoint_id)
    }
}

/// Composite key of an endpoint record
pub fn endpoint_key(network_id: &str, endpoint_id: &str) -> String {
    format!("{}:{}", network_id, endpoint_id)
}
