mod common;

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use common::{endpoint, tenant_network, TestEnv};
use ovsnet_network::{BridgeAdapter, LinkManager, LogicalTopology};
use ovsnet_store::StateStore;

const EP: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[tokio::test]
async fn test_basic_lifecycle() {
    let env = TestEnv::new();
    let c = &env.controller;

    c.create_network(tenant_network("net1", "ls-a", "10.0.0.0/24", "10.0.0.1/24"))
        .await
        .unwrap();
    assert!(env.bridge.bridge_exists("br-int").await.unwrap());
    assert!(env.topology.list_switches().await.unwrap().iter().any(|s| s.name == "ls-a"));

    let alloc = c.create_endpoint(endpoint("net1", EP)).await.unwrap();
    let address = alloc.address.clone().unwrap();
    let ip: Ipv4Addr = address.split('/').next().unwrap().parse().unwrap();
    let subnet: Ipv4Net = "10.0.0.0/24".parse().unwrap();
    assert!(subnet.contains(&ip));
    assert_ne!(ip, Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(alloc.gateway.as_deref(), Some("10.0.0.1"));

    let join = c.join("net1", EP, "/var/run/docker/netns/abc").await.unwrap();
    assert_eq!(join.src_name, "vethe3b0c44");
    assert_eq!(join.dst_prefix, "eth");
    assert_eq!(join.gateway.as_deref(), Some("10.0.0.1"));
    assert!(!join.disable_gateway_service);

    // Reachable on the bridge, bound to the logical port
    let port = env.bridge.get_port_info("vethe3b0c44-p").await.unwrap().unwrap();
    assert_eq!(port.external_ids.get("endpoint_id").map(String::as_str), Some(EP));
    assert_eq!(port.external_ids.get("iface-id").map(String::as_str), Some("lsp-e3b0c44298fc"));
    let lsp = env.topology.get_switch_port("lsp-e3b0c44298fc").await.unwrap().unwrap();
    assert_eq!(lsp.addresses, vec![format!("{} {}", alloc.mac_address, ip)]);
    assert_eq!(env.links.mac_of("vethe3b0c44").await, Some(alloc.mac_address.clone()));

    let info = c.endpoint_info("net1", EP).await.unwrap();
    assert_eq!(info.get("ovs_port").map(String::as_str), Some("vethe3b0c44-p"));
    assert_eq!(info.get("ipv4_address"), Some(&address));

    c.leave("net1", EP).await.unwrap();
    assert!(env.bridge.get_port_info("vethe3b0c44-p").await.unwrap().is_none());
    assert!(!env.links.link_exists("vethe3b0c44").await.unwrap());
    // Leave keeps both the record and the logical port
    assert!(env.store.get_endpoint("net1", EP).await.unwrap().is_some());
    assert!(env.topology.get_switch_port("lsp-e3b0c44298fc").await.unwrap().is_some());

    c.delete_endpoint("net1", EP).await.unwrap();
    assert!(env.store.get_endpoint("net1", EP).await.unwrap().is_none());
    assert!(env.topology.get_switch_port("lsp-e3b0c44298fc").await.unwrap().is_none());

    c.delete_network("net1").await.unwrap();
    assert!(env.store.get_network("net1").await.unwrap().is_none());
    assert!(!env.topology.list_switches().await.unwrap().iter().any(|s| s.name == "ls-a"));
    // The bridge is shared and stays
    assert!(env.bridge.bridge_exists("br-int").await.unwrap());
}

#[tokio::test]
async fn test_every_step_repeats_as_no_op() {
    let env = TestEnv::new();
    let c = &env.controller;
    let request = tenant_network("net1", "ls-a", "10.0.0.0/24", "10.0.0.1/24");

    c.create_network(request.clone()).await.unwrap();
    let record = env.store.get_network("net1").await.unwrap();
    let before = env.mutations();
    c.create_network(request).await.unwrap();
    assert_eq!(env.mutations(), before);
    assert_eq!(env.store.get_network("net1").await.unwrap(), record);

    let first = c.create_endpoint(endpoint("net1", EP)).await.unwrap();
    let second = c.create_endpoint(endpoint("net1", EP)).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(env.store.list_network_endpoints("net1").await.unwrap().len(), 1);

    c.join("net1", EP, "sb").await.unwrap();
    let before = env.mutations();
    let again = c.join("net1", EP, "sb").await.unwrap();
    assert_eq!(env.mutations(), before);
    assert_eq!(again.src_name, "vethe3b0c44");

    c.leave("net1", EP).await.unwrap();
    let before = env.mutations();
    c.leave("net1", EP).await.unwrap();
    assert_eq!(env.mutations(), before);

    c.delete_endpoint("net1", EP).await.unwrap();
    c.delete_endpoint("net1", EP).await.unwrap();
    c.delete_network("net1").await.unwrap();
    c.delete_network("net1").await.unwrap();
}

#[tokio::test]
async fn test_unknown_objects() {
    let env = TestEnv::new();
    let c = &env.controller;

    c.delete_network("nope").await.unwrap();
    c.delete_endpoint("nope", EP).await.unwrap();
    c.leave("nope", EP).await.unwrap();
    assert!(env.mutations().is_empty());

    let err = c.create_endpoint(endpoint("nope", EP)).await.unwrap_err();
    assert_eq!(err.kind(), "NotFoundError");
    let err = c.join("nope", EP, "sb").await.unwrap_err();
    assert_eq!(err.kind(), "NotFoundError");
}

#[tokio::test]
async fn test_delete_network_with_endpoints_is_refused() {
    let env = TestEnv::new();
    let c = &env.controller;
    c.create_network(tenant_network("net1", "ls-a", "10.0.0.0/24", "10.0.0.1/24"))
        .await
        .unwrap();
    c.create_endpoint(endpoint("net1", EP)).await.unwrap();

    let err = c.delete_network("net1").await.unwrap_err();
    assert_eq!(err.kind(), "PreconditionError");
    assert!(env.store.get_network("net1").await.unwrap().is_some());
    assert!(env.topology.list_switches().await.unwrap().iter().any(|s| s.name == "ls-a"));
}

#[tokio::test]
async fn test_recreate_with_different_configuration_is_refused() {
    let env = TestEnv::new();
    let c = &env.controller;
    c.create_network(tenant_network("net1", "ls-a", "10.0.0.0/24", "10.0.0.1/24"))
        .await
        .unwrap();

    let err = c
        .create_network(tenant_network("net1", "ls-b", "10.0.0.0/24", "10.0.0.1/24"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "PreconditionError");
}

#[tokio::test]
async fn test_join_rolls_back_when_bridge_fails() {
    let env = TestEnv::new();
    let c = &env.controller;
    c.create_network(tenant_network("net1", "ls-a", "10.0.0.0/24", "10.0.0.1/24"))
        .await
        .unwrap();
    c.create_endpoint(endpoint("net1", EP)).await.unwrap();

    env.topology.set_available(false);
    let err = c.join("net1", EP, "sb").await.unwrap_err();
    assert_eq!(err.kind(), "BackendUnavailableError");
    assert!(env.bridge.get_port_info("vethe3b0c44-p").await.unwrap().is_none());
    assert!(!env.links.link_exists("vethe3b0c44").await.unwrap());

    // A retry after recovery succeeds
    env.topology.set_available(true);
    c.join("net1", EP, "sb").await.unwrap();
    assert!(env.bridge.get_port_info("vethe3b0c44-p").await.unwrap().is_some());
}

#[tokio::test]
async fn test_vlan_and_mirror_applied_at_join() {
    let env = TestEnv::new();
    let c = &env.controller;
    env.bridge.seed_port("br-int", "tap0").await;

    let mut request = tenant_network("net1", "ls-a", "10.0.0.0/24", "10.0.0.1/24");
    request.options.insert("vlan".into(), "100".into());
    request.options.insert("mirror.ports".into(), "all".into());
    request.options.insert("mirror.dest".into(), "tap0".into());
    c.create_network(request).await.unwrap();
    c.create_endpoint(endpoint("net1", EP)).await.unwrap();
    c.join("net1", EP, "sb").await.unwrap();

    let port = env.bridge.get_port_info("vethe3b0c44-p").await.unwrap().unwrap();
    assert_eq!(port.tag, Some(100));
    let mirrors = env.bridge.list_mirrors("br-int").await.unwrap();
    assert_eq!(mirrors.len(), 1);
    assert_eq!(mirrors[0].name, "mirror-e3b0c44");
    assert_eq!(mirrors[0].output_port.as_deref(), Some("tap0"));

    c.leave("net1", EP).await.unwrap();
    assert!(env.bridge.list_mirrors("br-int").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sdn_dhcp_attached_to_port() {
    let env = TestEnv::new();
    let c = &env.controller;
    let mut request = tenant_network("net1", "ls-a", "10.0.0.0/24", "10.0.0.1/24");
    request.options.insert("dhcp".into(), "ovn".into());
    c.create_network(request).await.unwrap();
    c.create_endpoint(endpoint("net1", EP)).await.unwrap();
    c.join("net1", EP, "sb").await.unwrap();

    let dhcp = env.topology.dhcp_options().await;
    assert_eq!(dhcp.len(), 1);
    assert_eq!(dhcp[0].cidr, "10.0.0.0/24");
    assert_eq!(env.topology.port_dhcp("lsp-e3b0c44298fc").await, Some(dhcp[0].uuid.clone()));

    c.delete_endpoint("net1", EP).await.unwrap();
    c.delete_network("net1").await.unwrap();
    assert!(env.topology.dhcp_options().await.is_empty());
}

#[tokio::test]
async fn test_sandbox_key_recorded_while_joined() {
    let env = TestEnv::new();
    let c = &env.controller;
    c.create_network(tenant_network("net1", "ls-a", "10.0.0.0/24", "10.0.0.1/24"))
        .await
        .unwrap();
    c.create_endpoint(endpoint("net1", EP)).await.unwrap();
    assert_eq!(env.store.get_endpoint("net1", EP).await.unwrap().unwrap().sandbox_key, None);

    c.join("net1", EP, "/var/run/docker/netns/abc").await.unwrap();
    let stored = env.store.get_endpoint("net1", EP).await.unwrap().unwrap();
    assert_eq!(stored.sandbox_key.as_deref(), Some("/var/run/docker/netns/abc"));
    let info = c.endpoint_info("net1", EP).await.unwrap();
    assert_eq!(info.get("sandbox_key").map(String::as_str), Some("/var/run/docker/netns/abc"));

    c.leave("net1", EP).await.unwrap();
    let stored = env.store.get_endpoint("net1", EP).await.unwrap().unwrap();
    assert_eq!(stored.sandbox_key, None);
}
