//! Deterministic names for the objects ovsnet creates
//!
//! Every name is a pure function of runtime-assigned ids, so a retried
//! request or a restarted process always addresses the same objects.

use std::net::Ipv4Addr;

/// Fixed name of the deployment-wide gateway router owned by the transit network.
pub const GATEWAY_ROUTER: &str = "lr-gateway";

/// Prefix of `id`, at most `len` characters.
pub fn short_id(id: &str, len: usize) -> &str {
    match id.char_indices().nth(len) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Container-side end of the interface pair. Fits the 15-byte IFNAMSIZ limit.
pub fn veth_name(endpoint_id: &str) -> String {
    format!("veth{}", short_id(endpoint_id, 7))
}

/// Bridge-side end of the interface pair.
pub fn veth_peer_name(endpoint_id: &str) -> String {
    format!("veth{}-p", short_id(endpoint_id, 7))
}

/// Logical switch port bound to an endpoint (also the `iface-id` on the bridge).
pub fn logical_port_name(endpoint_id: &str) -> String {
    format!("lsp-{}", short_id(endpoint_id, 12))
}

pub fn mirror_name(endpoint_id: &str) -> String {
    format!("mirror-{}", short_id(endpoint_id, 7))
}

/// Logical switch for a transit network that did not name one.
pub fn transit_switch_name(network_id: &str) -> String {
    format!("ls-transit-{}", short_id(network_id, 12))
}

/// Router for a tenant network that links to transit without naming a router.
pub fn tenant_router_name(switch: &str) -> String {
    format!("lr-{}", switch)
}

/// Router port attaching a router to a tenant switch.
pub fn switch_router_port(switch: &str) -> String {
    format!("rp-{}", switch)
}

/// Router-type switch port on `switch` peering with `router`.
pub fn router_switch_port(router: &str, switch: &str) -> String {
    format!("sp-{}-{}", router, switch)
}

/// Tenant router port on the transit switch.
pub fn transit_router_port(router: &str) -> String {
    format!("rp-{}-transit", router)
}

/// Router-type switch port on the transit switch peering with a tenant router.
pub fn transit_switch_port(router: &str) -> String {
    format!("sp-transit-{}", router)
}

/// Locally administered unicast MAC derived from an endpoint address.
pub fn endpoint_mac(ip: Ipv4Addr) -> String {
    mac_with_prefix(0x00, ip)
}

/// MAC for logical router ports; distinct prefix from endpoint MACs.
pub fn router_mac(ip: Ipv4Addr) -> String {
    mac_with_prefix(0x01, ip)
}

fn mac_with_prefix(second: u8, ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", second, a, b, c, d)
}

/// MAC for endpoints on networks without an address (external IPAM).
pub fn endpoint_mac_from_id(endpoint_id: &str) -> String {
    // FNV-1a keeps the derivation stable across releases and platforms
    let mut hash: u32 = 0x811c_9dc5;
    for byte in endpoint_id.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    mac_with_prefix(0x02, Ipv4Addr::from(hash))
}
