//! Address pool of a network
//!
//! Built from the pool data the runtime hands over at network creation and
//! kept verbatim in the network record. Allocation never hands out the
//! network or broadcast address, the gateway, or any auxiliary reservation.

use ipnet::Ipv4Net;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use ovsnet_core::{Error, Result};

/// Subnet, gateway and reserved addresses of one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub aux_addresses: BTreeMap<String, Ipv4Addr>,
}

fn strip_prefix(value: &str) -> &str {
    value.split('/').next().unwrap_or(value)
}

fn parse_addr(field: &str, value: &str) -> Result<Ipv4Addr> {
    strip_prefix(value.trim())
        .parse()
        .map_err(|_| Error::configuration(format!("IPv4 data: {} '{}' is not an IPv4 address", field, value)))
}

/// Parse a requested address, with or without a prefix length.
pub fn parse_requested(value: &str) -> Result<Ipv4Addr> {
    parse_addr("address", value)
}

impl AddressPool {
    /// Pool from the runtime's IPv4 data (`Pool`, `Gateway`, `AuxAddresses`).
    /// Accepts a single object or the list the runtime sends; `null` and `[]` mean no pool.
    pub fn from_ipam_data(data: &Value) -> Result<Option<Self>> {
        let entry = match data {
            Value::Null => return Ok(None),
            Value::Array(items) => match items.first() {
                Some(first) => first,
                None => return Ok(None),
            },
            Value::Object(_) => data,
            other => {
                return Err(Error::configuration(format!(
                    "IPv4 data must be an object, got {}",
                    other
                )))
            }
        };

        let pool = entry
            .get("Pool")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::configuration("IPv4 data has no Pool"))?;
        let subnet: Ipv4Net = pool
            .parse()
            .map_err(|_| Error::configuration(format!("IPv4 data: Pool '{}' is not a CIDR", pool)))?;
        let subnet = subnet.trunc();

        let gateway = match entry.get("Gateway").and_then(Value::as_str) {
            Some(gw) if !gw.trim().is_empty() => parse_addr("Gateway", gw)?,
            _ => subnet
                .hosts()
                .next()
                .ok_or_else(|| Error::configuration(format!("IPv4 data: Pool {} has no host addresses", subnet)))?,
        };
        if !subnet.contains(&gateway) {
            return Err(Error::configuration(format!(
                "IPv4 data: Gateway {} is outside {}",
                gateway, subnet
            )));
        }

        let mut aux_addresses = BTreeMap::new();
        if let Some(aux) = entry.get("AuxAddresses").and_then(Value::as_object) {
            for (name, value) in aux {
                let value = value
                    .as_str()
                    .ok_or_else(|| Error::configuration(format!("IPv4 data: AuxAddresses.{} is not a string", name)))?;
                aux_addresses.insert(name.clone(), parse_addr("AuxAddresses", value)?);
            }
        }

        Ok(Some(Self {
            subnet,
            gateway,
            aux_addresses,
        }))
    }

    pub fn prefix_len(&self) -> u8 {
        self.subnet.prefix_len()
    }

    /// `addr/len` with this pool's prefix length.
    pub fn with_prefix(&self, addr: Ipv4Addr) -> String {
        format!("{}/{}", addr, self.prefix_len())
    }

    /// Gateway in CIDR form, as configured on router ports.
    pub fn gateway_cidr(&self) -> String {
        self.with_prefix(self.gateway)
    }

    fn is_reserved(&self, addr: Ipv4Addr) -> bool {
        let edges = self.prefix_len() < 31 && (addr == self.subnet.network() || addr == self.subnet.broadcast());
        edges || addr == self.gateway || self.aux_addresses.values().any(|a| *a == addr)
    }

    /// Check a caller-requested address against the pool and the addresses in use.
    pub fn check_requested(&self, network_id: &str, addr: Ipv4Addr, used: &BTreeSet<Ipv4Addr>) -> Result<()> {
        if !self.subnet.contains(&addr) {
            return Err(Error::configuration(format!(
                "requested address {} is outside {}",
                addr, self.subnet
            )));
        }
        if addr == self.gateway {
            return Err(Error::conflict(network_id, addr, "gateway address"));
        }
        if self.is_reserved(addr) {
            return Err(Error::conflict(network_id, addr, "reserved address"));
        }
        if used.contains(&addr) {
            return Err(Error::conflict(network_id, addr, "already allocated"));
        }
        Ok(())
    }

    /// Lowest free host address.
    pub fn allocate(&self, network_id: &str, used: &BTreeSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        self.first_free(0, used)
            .ok_or_else(|| Error::AddressExhausted(network_id.to_string()))
    }

    /// Lowest free host address at least `offset` past the network address.
    pub fn first_free(&self, offset: u32, used: &BTreeSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        let floor = u32::from(self.subnet.network()).saturating_add(offset);
        self.subnet
            .hosts()
            .filter(|a| u32::from(*a) >= floor)
            .find(|a| !self.is_reserved(*a) && !used.contains(a))
    }
}
