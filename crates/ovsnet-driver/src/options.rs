//! Typed network options
//!
//! The raw option map from the runtime is turned into [`NetworkOptions`]
//! once, at the lifecycle boundary. Parsing only checks types; [`validate`]
//! applies the creation rules in a fixed order. Records loaded from the store
//! are parsed but never re-validated.
//!
//! [`validate`]: NetworkOptions::validate

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ovsnet_core::config::parse_bool;
use ovsnet_core::{Error, Result};
use ovsnet_network::DbEndpoint;

pub const BRIDGE: &str = "bridge";
pub const TENANT_ID: &str = "tenant_id";
pub const VLAN: &str = "vlan";
pub const MTU: &str = "mtu";
pub const IPAM: &str = "ipam";
pub const DHCP: &str = "dhcp";
pub const DNS_SERVER: &str = "dns_server";
pub const MIRROR_PORTS: &str = "mirror.ports";
pub const MIRROR_DEST: &str = "mirror.dest";
pub const OVN_SWITCH: &str = "ovn.switch";
pub const OVN_ROUTER: &str = "ovn.router";
pub const OVN_ROLE: &str = "ovn.role";
pub const OVN_NB_CONNECTION: &str = "ovn.nb_connection";
pub const OVN_SB_CONNECTION: &str = "ovn.sb_connection";
pub const OVN_AUTO_CREATE: &str = "ovn.auto_create";
pub const OVN_TRANSIT_NETWORK: &str = "ovn.transit_network";
pub const OVN_EXTERNAL_GATEWAY: &str = "ovn.external_gateway";
pub const OVN_ENCAP: &str = "ovn.encap";
pub const OVN_ENCAP_IP: &str = "ovn.encap_ip";
pub const OVN_MANAGEMENT_NETWORK: &str = "ovn.transit_overlay_network";

pub const KNOWN_KEYS: &[&str] = &[
    BRIDGE,
    TENANT_ID,
    VLAN,
    MTU,
    IPAM,
    DHCP,
    DNS_SERVER,
    MIRROR_PORTS,
    MIRROR_DEST,
    OVN_SWITCH,
    OVN_ROUTER,
    OVN_ROLE,
    OVN_NB_CONNECTION,
    OVN_SB_CONNECTION,
    OVN_AUTO_CREATE,
    OVN_TRANSIT_NETWORK,
    OVN_EXTERNAL_GATEWAY,
    OVN_ENCAP,
    OVN_ENCAP_IP,
    OVN_MANAGEMENT_NETWORK,
];

/// Keys the runtime adds on its own; accepted and dropped.
const RUNTIME_KEY_PREFIX: &str = "com.docker.network.";

pub const DEFAULT_BRIDGE: &str = "br-int";
pub const DEFAULT_NB_CONNECTION: &str = "tcp:127.0.0.1:6641";
pub const DEFAULT_SB_CONNECTION: &str = "tcp:127.0.0.1:6642";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Tenant,
    Transit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DhcpMode {
    #[default]
    Disabled,
    /// DHCP answered by the SDN control plane from the network's option set
    Sdn,
    /// Some other DHCP server on the segment
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpamMode {
    #[default]
    Internal,
    External,
}

/// Encapsulation types the chassis accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encap {
    Geneve,
    Vxlan,
    Stt,
}

impl Encap {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encap::Geneve => "geneve",
            Encap::Vxlan => "vxlan",
            Encap::Stt => "stt",
        }
    }
}

impl FromStr for Encap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "geneve" => Ok(Encap::Geneve),
            "vxlan" => Ok(Encap::Vxlan),
            "stt" => Ok(Encap::Stt),
            other => Err(Error::configuration(format!(
                "{}: unsupported encapsulation '{}' (geneve|vxlan|stt)",
                OVN_ENCAP, other
            ))),
        }
    }
}

/// Northbound and southbound connection strings of the SDN control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdnEndpoints {
    pub northbound: DbEndpoint,
    pub southbound: DbEndpoint,
}

/// Strongly typed form of the network-create option map
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetworkOptions {
    pub bridge: String,
    pub tenant_id: Option<String>,
    pub vlan: Option<u16>,
    pub mtu: Option<u32>,
    pub ipam: IpamMode,
    pub dhcp: DhcpMode,
    pub dns_server: Option<Ipv4Addr>,
    pub mirror_ports: Vec<String>,
    pub mirror_dest: Option<String>,
    pub switch: Option<String>,
    pub router: Option<String>,
    pub role: Role,
    pub nb_connection: Option<DbEndpoint>,
    pub sb_connection: Option<DbEndpoint>,
    pub auto_create: bool,
    pub transit_network: Option<String>,
    pub external_gateway: Option<Ipv4Addr>,
    pub encap: Option<Encap>,
    pub encap_ip: Option<Ipv4Addr>,
    pub management_network: Option<String>,
}

fn non_empty(raw: &BTreeMap<String, String>, key: &str) -> Option<String> {
    raw.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_ipv4(key: &str, value: &str) -> Result<Ipv4Addr> {
    // Accept "a.b.c.d" and "a.b.c.d/len"
    let addr = value.split('/').next().unwrap_or(value);
    addr.parse()
        .map_err(|_| Error::configuration(format!("{}: '{}' is not an IPv4 address", key, value)))
}

fn parse_endpoint(key: &str, value: &str) -> Result<DbEndpoint> {
    DbEndpoint::parse(value).map_err(|_| {
        Error::configuration(format!(
            "{}: '{}' is not a connection string (tcp:<host>:<port> or unix:<path>)",
            key, value
        ))
    })
}

impl NetworkOptions {
    /// Type-check the raw map. Unknown keys are rejected.
    pub fn parse(raw: &BTreeMap<String, String>) -> Result<Self> {
        if let Some(unknown) = raw
            .keys()
            .find(|k| !KNOWN_KEYS.contains(&k.as_str()) && !k.starts_with(RUNTIME_KEY_PREFIX))
        {
            return Err(Error::configuration(format!("unknown option '{}'", unknown)));
        }

        let vlan = match non_empty(raw, VLAN) {
            Some(v) => Some(v.parse::<u16>().map_err(|_| {
                Error::configuration(format!("{}: '{}' is not a VLAN tag (1-4094)", VLAN, v))
            })?),
            None => None,
        };

        let mtu = match non_empty(raw, MTU) {
            Some(v) => {
                let mtu = v
                    .parse::<u32>()
                    .map_err(|_| Error::configuration(format!("{}: '{}' is not an integer", MTU, v)))?;
                if !(68..=65535).contains(&mtu) {
                    return Err(Error::configuration(format!("{}: {} outside 68-65535", MTU, mtu)));
                }
                Some(mtu)
            }
            None => None,
        };

        let ipam = match non_empty(raw, IPAM).as_deref() {
            None | Some("internal") | Some("default") => IpamMode::Internal,
            Some("external") => IpamMode::External,
            Some(other) => {
                return Err(Error::configuration(format!(
                    "{}: unknown mode '{}' (internal|external)",
                    IPAM, other
                )))
            }
        };

        let dhcp = match non_empty(raw, DHCP).map(|v| v.to_lowercase()).as_deref() {
            None | Some("false") | Some("none") | Some("off") => DhcpMode::Disabled,
            Some("ovn") | Some("sdn") => DhcpMode::Sdn,
            Some("true") | Some("external") => DhcpMode::External,
            Some(other) => {
                return Err(Error::configuration(format!(
                    "{}: unknown mode '{}' (ovn|external|false)",
                    DHCP, other
                )))
            }
        };

        let role = match non_empty(raw, OVN_ROLE).map(|v| v.to_lowercase()).as_deref() {
            None | Some("tenant") => Role::Tenant,
            Some("transit") => Role::Transit,
            Some(other) => {
                return Err(Error::configuration(format!(
                    "{}: unknown role '{}' (tenant|transit)",
                    OVN_ROLE, other
                )))
            }
        };

        let mirror_ports = non_empty(raw, MIRROR_PORTS)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bridge: non_empty(raw, BRIDGE).unwrap_or_else(|| DEFAULT_BRIDGE.to_string()),
            tenant_id: non_empty(raw, TENANT_ID),
            vlan,
            mtu,
            ipam,
            dhcp,
            dns_server: non_empty(raw, DNS_SERVER)
                .map(|v| parse_ipv4(DNS_SERVER, &v))
                .transpose()?,
            mirror_ports,
            mirror_dest: non_empty(raw, MIRROR_DEST),
            switch: non_empty(raw, OVN_SWITCH),
            router: non_empty(raw, OVN_ROUTER),
            role,
            nb_connection: non_empty(raw, OVN_NB_CONNECTION)
                .map(|v| parse_endpoint(OVN_NB_CONNECTION, &v))
                .transpose()?,
            sb_connection: non_empty(raw, OVN_SB_CONNECTION)
                .map(|v| parse_endpoint(OVN_SB_CONNECTION, &v))
                .transpose()?,
            auto_create: non_empty(raw, OVN_AUTO_CREATE)
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            transit_network: non_empty(raw, OVN_TRANSIT_NETWORK),
            external_gateway: non_empty(raw, OVN_EXTERNAL_GATEWAY)
                .map(|v| parse_ipv4(OVN_EXTERNAL_GATEWAY, &v))
                .transpose()?,
            encap: non_empty(raw, OVN_ENCAP).map(|v| v.parse()).transpose()?,
            encap_ip: non_empty(raw, OVN_ENCAP_IP)
                .map(|v| parse_ipv4(OVN_ENCAP_IP, &v))
                .transpose()?,
            management_network: non_empty(raw, OVN_MANAGEMENT_NETWORK),
        })
    }

    /// Creation-time rules, in order:
    /// 1. transit networks need an external gateway
    /// 2. tenant networks need a switch; both connection strings or neither
    /// 3. VLAN tag in 1..=4094
    /// 4. mirror sources need a distinct destination
    pub fn validate(&self, allow_default_endpoints: bool) -> Result<()> {
        match self.role {
            Role::Transit => {
                if self.external_gateway.is_none() {
                    return Err(Error::configuration(format!(
                        "{} is required for a transit network",
                        OVN_EXTERNAL_GATEWAY
                    )));
                }
                if self.transit_network.is_some() {
                    return Err(Error::configuration(format!(
                        "{} cannot be set on a transit network",
                        OVN_TRANSIT_NETWORK
                    )));
                }
            }
            Role::Tenant => {
                if self.switch.is_none() {
                    return Err(Error::configuration(format!(
                        "{} is required for a tenant network",
                        OVN_SWITCH
                    )));
                }
            }
        }

        match (&self.nb_connection, &self.sb_connection) {
            (Some(_), Some(_)) => {}
            (None, None) if allow_default_endpoints => {}
            (None, None) => {
                return Err(Error::configuration(format!(
                    "{} and {} are required",
                    OVN_NB_CONNECTION, OVN_SB_CONNECTION
                )))
            }
            (Some(_), None) => {
                return Err(Error::configuration(format!(
                    "{} is set but {} is missing",
                    OVN_NB_CONNECTION, OVN_SB_CONNECTION
                )))
            }
            (None, Some(_)) => {
                return Err(Error::configuration(format!(
                    "{} is set but {} is missing",
                    OVN_SB_CONNECTION, OVN_NB_CONNECTION
                )))
            }
        }

        if let Some(vlan) = self.vlan {
            if !(1..=4094).contains(&vlan) {
                return Err(Error::configuration(format!("{}: {} outside 1-4094", VLAN, vlan)));
            }
        }

        if !self.mirror_ports.is_empty() {
            let dest = self.mirror_dest.as_deref().ok_or_else(|| {
                Error::configuration(format!("{} requires {}", MIRROR_PORTS, MIRROR_DEST))
            })?;
            if self.mirror_ports.iter().any(|p| p == dest) {
                return Err(Error::configuration(format!(
                    "{} '{}' is also a mirrored port",
                    MIRROR_DEST, dest
                )));
            }
        }

        if self.dns_server.is_some() && self.dhcp != DhcpMode::Sdn {
            return Err(Error::configuration(format!("{} requires {}=ovn", DNS_SERVER, DHCP)));
        }

        Ok(())
    }

    pub fn is_transit(&self) -> bool {
        self.role == Role::Transit
    }

    /// Connection strings, falling back to the local defaults only when allowed.
    pub fn sdn_endpoints(&self, allow_default_endpoints: bool) -> Result<SdnEndpoints> {
        let fallback = |value: &Option<DbEndpoint>, key: &str, default: &str| match value {
            Some(ep) => Ok(ep.clone()),
            None if allow_default_endpoints => parse_endpoint(key, default),
            None => Err(Error::configuration(format!("{} is required", key))),
        };
        Ok(SdnEndpoints {
            northbound: fallback(&self.nb_connection, OVN_NB_CONNECTION, DEFAULT_NB_CONNECTION)?,
            southbound: fallback(&self.sb_connection, OVN_SB_CONNECTION, DEFAULT_SB_CONNECTION)?,
        })
    }

    /// Whether the runtime should leave gateway handling to the network.
    pub fn disables_gateway_service(&self) -> bool {
        self.ipam == IpamMode::External || self.dhcp == DhcpMode::External
    }

    /// Does the mirror selection cover this bridge port?
    pub fn mirrors_port(&self, port: &str, veth: &str) -> bool {
        self.mirror_dest.is_some() && self.mirror_ports.iter().any(|p| p == "all" || p == port || p == veth)
    }

    /// Normalized option map, as persisted.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                map.insert(key.to_string(), value);
            }
        };

        put(BRIDGE, Some(self.bridge.clone()));
        put(TENANT_ID, self.tenant_id.clone());
        put(VLAN, self.vlan.map(|v| v.to_string()));
        put(MTU, self.mtu.map(|v| v.to_string()));
        put(
            IPAM,
            (self.ipam == IpamMode::External).then(|| "external".to_string()),
        );
        put(
            DHCP,
            match self.dhcp {
                DhcpMode::Disabled => None,
                DhcpMode::Sdn => Some("ovn".to_string()),
                DhcpMode::External => Some("external".to_string()),
            },
        );
        put(DNS_SERVER, self.dns_server.map(|v| v.to_string()));
        put(
            MIRROR_PORTS,
            (!self.mirror_ports.is_empty()).then(|| self.mirror_ports.join(",")),
        );
        put(MIRROR_DEST, self.mirror_dest.clone());
        put(OVN_SWITCH, self.switch.clone());
        put(OVN_ROUTER, self.router.clone());
        put(
            OVN_ROLE,
            (self.role == Role::Transit).then(|| "transit".to_string()),
        );
        put(OVN_NB_CONNECTION, self.nb_connection.as_ref().map(|e| e.to_string()));
        put(OVN_SB_CONNECTION, self.sb_connection.as_ref().map(|e| e.to_string()));
        put(OVN_AUTO_CREATE, self.auto_create.then(|| "true".to_string()));
        put(OVN_TRANSIT_NETWORK, self.transit_network.clone());
        put(OVN_EXTERNAL_GATEWAY, self.external_gateway.map(|v| v.to_string()));
        put(OVN_ENCAP, self.encap.map(|e| e.as_str().to_string()));
        put(OVN_ENCAP_IP, self.encap_ip.map(|v| v.to_string()));
        put(OVN_MANAGEMENT_NETWORK, self.management_network.clone());
        map
    }
}
