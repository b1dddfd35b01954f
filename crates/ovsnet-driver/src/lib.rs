//! ovsnet-driver: network lifecycle for OVS/OVN container networks
//!
//! - `options`: typed network options and creation-time validation
//! - `ipam`: address pools and allocation
//! - `provision`: SDN control-plane probing and auto-provisioning
//! - `orchestrator`: bridge and logical topology construction and teardown
//! - `controller`: lifecycle operations, locking, reconciliation
//! - `protocol`: runtime request/response bodies and method dispatch

pub mod controller;
pub mod ipam;
pub mod options;
pub mod orchestrator;
pub mod protocol;
pub mod provision;

pub use controller::{
    Capabilities, ControllerSettings, CreateEndpointRequest, CreateNetworkRequest, EndpointAllocation, JoinInfo,
    NetworkController, ReconcileReport, Scope,
};
pub use ipam::AddressPool;
pub use options::{DhcpMode, IpamMode, NetworkOptions, Role, SdnEndpoints};
pub use orchestrator::{NetworkPlan, Orchestrator, OrchestratorSettings, PortKind};
pub use protocol::dispatch;
pub use provision::{ControlPlaneProvisioner, DockerCliProvisioner, MemoryProvisioner, ProvisionerSettings};
