mod common;

use common::{endpoint, tenant_network, transit_network, TestEnv};
use ovsnet_driver::CreateNetworkRequest;
use ovsnet_network::{LogicalTopology, StaticRoute};

fn linked_tenant(id: &str, switch: &str, subnet: &str, gateway: &str) -> CreateNetworkRequest {
    let mut request = tenant_network(id, switch, subnet, gateway);
    request.options.insert("ovn.transit_network".into(), "transit".into());
    request
}

fn route(prefix: &str, nexthop: &str) -> StaticRoute {
    StaticRoute {
        prefix: prefix.to_string(),
        nexthop: nexthop.to_string(),
    }
}

#[tokio::test]
async fn test_tenant_links_to_gateway_router() {
    let env = TestEnv::new();
    let c = &env.controller;
    c.create_network(transit_network("transit")).await.unwrap();
    c.create_network(linked_tenant("net1", "ls-a", "10.1.0.0/24", "10.1.0.1/24"))
        .await
        .unwrap();

    let gateway_routes = env.topology.list_static_routes("lr-gateway").await.unwrap();
    assert!(gateway_routes.contains(&route("0.0.0.0/0", "100.64.0.254")));
    assert!(gateway_routes.contains(&route("10.1.0.0/24", "100.64.0.10")));

    let tenant_routes = env.topology.list_static_routes("lr-ls-a").await.unwrap();
    assert_eq!(tenant_routes, vec![route("0.0.0.0/0", "100.64.0.1")]);

    let ports = env.topology.list_router_ports(Some("lr-ls-a")).await.unwrap();
    let link = ports.iter().find(|p| p.name == "rp-lr-ls-a-transit").unwrap();
    assert_eq!(link.networks, vec!["100.64.0.10/24"]);
    assert_eq!(link.mac, "02:01:64:40:00:0a");
    let attach = ports.iter().find(|p| p.name == "rp-ls-a").unwrap();
    assert_eq!(attach.networks, vec!["10.1.0.1/24"]);

    let peer = env.topology.get_switch_port("sp-transit-lr-ls-a").await.unwrap().unwrap();
    assert_eq!(peer.addresses, vec!["router"]);
    assert!(peer.port_security.is_empty());
    assert_eq!(peer.options.get("router-port").map(String::as_str), Some("rp-lr-ls-a-transit"));
}

#[tokio::test]
async fn test_routes_are_added_once() {
    let env = TestEnv::new();
    let c = &env.controller;
    c.create_network(transit_network("transit")).await.unwrap();
    let tenant = linked_tenant("net1", "ls-a", "10.1.0.0/24", "10.1.0.1/24");
    c.create_network(tenant.clone()).await.unwrap();
    c.create_network(tenant).await.unwrap();
    c.reconcile().await.unwrap();

    let adds = env
        .topology
        .mutations()
        .into_iter()
        .filter(|m| m.starts_with("nb.add_route"))
        .count();
    assert_eq!(adds, 3);
    assert_eq!(env.topology.list_static_routes("lr-gateway").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_second_tenant_gets_next_link_address() {
    let env = TestEnv::new();
    let c = &env.controller;
    c.create_network(transit_network("transit")).await.unwrap();
    // An endpoint on the transit network holds .10
    c.create_endpoint(ovsnet_driver::CreateEndpointRequest {
        address: Some("100.64.0.10".into()),
        ..endpoint("transit", "gw-ep")
    })
    .await
    .unwrap();
    c.create_network(linked_tenant("net1", "ls-a", "10.1.0.0/24", "10.1.0.1/24"))
        .await
        .unwrap();
    c.create_network(linked_tenant("net2", "ls-b", "10.2.0.0/24", "10.2.0.1/24"))
        .await
        .unwrap();

    let routes = env.topology.list_static_routes("lr-gateway").await.unwrap();
    assert!(routes.contains(&route("10.1.0.0/24", "100.64.0.11")));
    assert!(routes.contains(&route("10.2.0.0/24", "100.64.0.12")));
}

#[tokio::test]
async fn test_only_one_transit_network() {
    let env = TestEnv::new();
    let c = &env.controller;
    c.create_network(transit_network("transit")).await.unwrap();
    let err = c.create_network(transit_network("transit2")).await.unwrap_err();
    assert_eq!(err.kind(), "PreconditionError");
}

#[tokio::test]
async fn test_missing_transit_peer() {
    let env = TestEnv::new();
    let err = env
        .controller
        .create_network(linked_tenant("net1", "ls-a", "10.1.0.0/24", "10.1.0.1/24"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "PreconditionError");
    assert!(env.mutations().is_empty());
}

#[tokio::test]
async fn test_transit_teardown_order() {
    let env = TestEnv::new();
    let c = &env.controller;
    c.create_network(transit_network("transit")).await.unwrap();
    c.create_network(linked_tenant("net1", "ls-a", "10.1.0.0/24", "10.1.0.1/24"))
        .await
        .unwrap();

    let err = c.delete_network("transit").await.unwrap_err();
    assert_eq!(err.kind(), "PreconditionError");

    c.delete_network("net1").await.unwrap();
    let routers = env.topology.list_routers().await.unwrap();
    assert!(!routers.iter().any(|r| r.name == "lr-ls-a"));
    assert_eq!(
        env.topology.list_static_routes("lr-gateway").await.unwrap(),
        vec![route("0.0.0.0/0", "100.64.0.254")]
    );
    assert!(env.topology.get_switch_port("sp-transit-lr-ls-a").await.unwrap().is_none());

    c.delete_network("transit").await.unwrap();
    assert!(env.topology.list_routers().await.unwrap().is_empty());
    assert!(env.topology.list_switches().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_shared_router_survives_first_delete() {
    let env = TestEnv::new();
    let c = &env.controller;
    for (id, switch, subnet, gw) in [
        ("net1", "ls-a", "10.1.0.0/24", "10.1.0.1/24"),
        ("net2", "ls-b", "10.2.0.0/24", "10.2.0.1/24"),
    ] {
        let mut request = tenant_network(id, switch, subnet, gw);
        request.options.insert("ovn.router".into(), "lr-vpc".into());
        c.create_network(request).await.unwrap();
    }

    c.delete_network("net1").await.unwrap();
    let ports = env.topology.list_router_ports(Some("lr-vpc")).await.unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].name, "rp-ls-b");

    c.delete_network("net2").await.unwrap();
    assert!(env.topology.list_routers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_switch_cannot_be_claimed_twice() {
    let env = TestEnv::new();
    let c = &env.controller;
    c.create_network(tenant_network("net1", "ls-a", "10.0.0.0/24", "10.0.0.1/24"))
        .await
        .unwrap();
    c.create_endpoint(endpoint("net1", "ep1aaaaaaaaa")).await.unwrap();
    c.join("net1", "ep1aaaaaaaaa", "sb").await.unwrap();
    let before = env.mutations().len();

    let err = c
        .create_network(tenant_network("net2", "ls-a", "10.1.0.0/24", "10.1.0.1/24"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "PreconditionError");
    assert_eq!(env.mutations().len(), before);

    // Deleting the rejected id touches nothing that belongs to net1
    c.delete_network("net2").await.unwrap();
    assert!(env.topology.list_switches().await.unwrap().iter().any(|s| s.name == "ls-a"));
    assert!(env.topology.get_switch_port("lsp-ep1aaaaaaaaa").await.unwrap().is_some());
}

#[tokio::test]
async fn test_nat_gateway_port_has_no_port_security() {
    let env = TestEnv::new();
    let c = &env.controller;
    c.create_network(transit_network("transit")).await.unwrap();

    c.create_endpoint(ovsnet_driver::CreateEndpointRequest {
        address: Some("100.64.0.254/24".into()),
        ..endpoint("transit", "natgw0000000")
    })
    .await
    .unwrap();
    c.create_endpoint(endpoint("transit", "plain0000000")).await.unwrap();
    c.join("transit", "natgw0000000", "sb").await.unwrap();
    c.join("transit", "plain0000000", "sb").await.unwrap();

    let nat = env.topology.get_switch_port("lsp-natgw0000000").await.unwrap().unwrap();
    assert!(nat.port_security.is_empty());
    let plain = env.topology.get_switch_port("lsp-plain0000000").await.unwrap().unwrap();
    assert_eq!(plain.port_security, plain.addresses);
}
