//! ovsnet-network: adapters for the two external control planes
//!
//! - `ovsdb`: OVSDB JSON-RPC client (unix or tcp), timeouts and bounded retry
//! - `bridge`: Bridge/Port adapter on the local `Open_vSwitch` database
//! - `ovn`: logical topology adapter on `OVN_Northbound`
//! - `link`: veth pairs over rtnetlink
//! - `memory`: in-memory implementations of all three adapter traits

pub mod bridge;
pub mod link;
pub mod memory;
pub mod ovn;
pub mod ovs_error;
pub mod ovsdb;

#[cfg(test)]
mod test_support;

pub use bridge::{BridgeAdapter, ChassisConfig, MirrorInfo, OvsdbBridge, PortConfig, PortInfo};
pub use link::{LinkManager, NetlinkLinks};
pub use memory::{MemoryBridge, MemoryLinks, MemoryTopology};
pub use ovn::{
    DhcpOptions, LogicalTopology, NamedObject, OvnConnector, OvnNorthbound, RouterPortInfo, StaticRoute,
    SwitchPortSpec, TopologyConnector,
};
pub use ovs_error::{OvsError, OvsResult};
pub use ovsdb::{DbEndpoint, OvsdbClient, RpcSettings};
