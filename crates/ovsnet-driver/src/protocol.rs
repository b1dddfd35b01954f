//! Runtime request/response contract
//!
//! Request and response bodies of the container runtime's network driver
//! hooks, and [`dispatch`], which routes a method name plus JSON body to the
//! controller. Transport is left to the caller.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use ovsnet_core::{Error, Result};

use crate::controller::{CreateEndpointRequest, CreateNetworkRequest, NetworkController};

pub const ACTIVATE: &str = "Plugin.Activate";
pub const GET_CAPABILITIES: &str = "NetworkDriver.GetCapabilities";
pub const CREATE_NETWORK: &str = "NetworkDriver.CreateNetwork";
pub const DELETE_NETWORK: &str = "NetworkDriver.DeleteNetwork";
pub const CREATE_ENDPOINT: &str = "NetworkDriver.CreateEndpoint";
pub const DELETE_ENDPOINT: &str = "NetworkDriver.DeleteEndpoint";
pub const ENDPOINT_OPER_INFO: &str = "NetworkDriver.EndpointOperInfo";
pub const JOIN: &str = "NetworkDriver.Join";
pub const LEAVE: &str = "NetworkDriver.Leave";

/// Hooks the runtime may call that need no work from this driver
pub const NO_OP_METHODS: &[&str] = &[
    "NetworkDriver.AllocateNetwork",
    "NetworkDriver.FreeNetwork",
    "NetworkDriver.DiscoverNew",
    "NetworkDriver.DiscoverDelete",
    "NetworkDriver.ProgramExternalConnectivity",
    "NetworkDriver.RevokeExternalConnectivity",
];

/// Driver-specific options as nested by the runtime
pub const GENERIC_OPTIONS_KEY: &str = "com.docker.network.generic";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateNetworkBody {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(default)]
    pub options: Option<BTreeMap<String, Value>>,
    #[serde(rename = "IPv4Data", default)]
    pub ipv4_data: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkBody {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointInterface {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(rename = "AddressIPv6", default, skip_serializing_if = "String::is_empty")]
    pub address_ipv6: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac_address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateEndpointBody {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(default)]
    pub interface: Option<EndpointInterface>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateEndpointResponse {
    pub interface: EndpointInterface,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointBody {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinBody {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(default)]
    pub sandbox_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceName {
    pub src_name: String,
    pub dst_prefix: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinResponse {
    pub interface_name: InterfaceName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    pub disable_gateway_service: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesResponse {
    pub scope: String,
    pub connectivity_scope: String,
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Flatten runtime options into the driver's option map. Generic options are
/// lifted to the top level; other runtime-internal keys are dropped.
pub fn flatten_options(options: &BTreeMap<String, Value>) -> BTreeMap<String, String> {
    let mut flat = BTreeMap::new();
    for (key, value) in options {
        if key == GENERIC_OPTIONS_KEY {
            if let Value::Object(generic) = value {
                for (k, v) in generic {
                    flat.insert(k.clone(), stringify(v));
                }
            }
        } else if !key.starts_with("com.docker.network.") {
            flat.insert(key.clone(), stringify(value));
        }
    }
    flat
}

fn parse_body<T: DeserializeOwned>(method: &str, body: Value) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|e| Error::configuration(format!("malformed {} request: {}", method, e)))
}

fn to_value<T: Serialize>(response: T) -> Result<Value> {
    Ok(serde_json::to_value(response)?)
}

/// Error body understood by the runtime
pub fn error_response(err: &Error) -> Value {
    json!({ "Err": format!("{}: {}", err.kind(), err) })
}

/// Route one driver call to the controller. Failures come back as `{"Err": ...}`.
pub async fn dispatch(controller: &NetworkController, method: &str, body: Value) -> Value {
    debug!("Dispatching {}", method);
    match handle(controller, method, body).await {
        Ok(response) => response,
        Err(e) => {
            warn!("{} failed: {}", method, e);
            error_response(&e)
        }
    }
}

async fn handle(controller: &NetworkController, method: &str, body: Value) -> Result<Value> {
    match method {
        ACTIVATE => Ok(json!({ "Implements": ["NetworkDriver"] })),
        GET_CAPABILITIES => {
            let caps = controller.capabilities();
            to_value(CapabilitiesResponse {
                scope: caps.scope.as_str().to_string(),
                connectivity_scope: caps.connectivity_scope.as_str().to_string(),
            })
        }
        CREATE_NETWORK => {
            let req: CreateNetworkBody = parse_body(method, body)?;
            let ipv4_data = req.ipv4_data.filter(|d| !d.is_empty()).map(Value::Array);
            controller
                .create_network(CreateNetworkRequest {
                    network_id: req.network_id,
                    options: flatten_options(&req.options.unwrap_or_default()),
                    ipv4_data,
                })
                .await?;
            Ok(json!({}))
        }
        DELETE_NETWORK => {
            let req: NetworkBody = parse_body(method, body)?;
            controller.delete_network(&req.network_id).await?;
            Ok(json!({}))
        }
        CREATE_ENDPOINT => {
            let req: CreateEndpointBody = parse_body(method, body)?;
            let requested = req.interface.unwrap_or_default();
            let allocation = controller
                .create_endpoint(CreateEndpointRequest {
                    network_id: req.network_id,
                    endpoint_id: req.endpoint_id,
                    address: Some(requested.address.clone()).filter(|a| !a.is_empty()),
                    mac_address: Some(requested.mac_address.clone()).filter(|m| !m.is_empty()),
                    container_id: None,
                })
                .await?;
            // Only report what the runtime did not supply itself
            to_value(CreateEndpointResponse {
                interface: EndpointInterface {
                    address: if requested.address.is_empty() {
                        allocation.address.unwrap_or_default()
                    } else {
                        String::new()
                    },
                    address_ipv6: String::new(),
                    mac_address: if requested.mac_address.is_empty() {
                        allocation.mac_address
                    } else {
                        String::new()
                    },
                },
            })
        }
        DELETE_ENDPOINT => {
            let req: EndpointBody = parse_body(method, body)?;
            controller.delete_endpoint(&req.network_id, &req.endpoint_id).await?;
            Ok(json!({}))
        }
        ENDPOINT_OPER_INFO => {
            let req: EndpointBody = parse_body(method, body)?;
            let info = controller.endpoint_info(&req.network_id, &req.endpoint_id).await?;
            Ok(json!({ "Value": info }))
        }
        JOIN => {
            let req: JoinBody = parse_body(method, body)?;
            let info = controller
                .join(&req.network_id, &req.endpoint_id, &req.sandbox_key)
                .await?;
            to_value(JoinResponse {
                interface_name: InterfaceName {
                    src_name: info.src_name,
                    dst_prefix: info.dst_prefix,
                },
                gateway: info.gateway,
                disable_gateway_service: info.disable_gateway_service,
            })
        }
        LEAVE => {
            let req: EndpointBody = parse_body(method, body)?;
            controller.leave(&req.network_id, &req.endpoint_id).await?;
            Ok(json!({}))
        }
        m if NO_OP_METHODS.contains(&m) => Ok(json!({})),
        other => Err(Error::not_found(format!("method {}", other))),
    }
}
