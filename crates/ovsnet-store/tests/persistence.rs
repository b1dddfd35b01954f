use ovsnet_store::{
    CollectionStatus, EndpointRecord, FileStore, NetworkRecord, RecoveryPolicy, StateStore, ENDPOINTS_FILE,
    NETWORKS_FILE,
};
use serde_json::json;
use std::collections::BTreeMap;

fn sample_network() -> NetworkRecord {
    let mut options = BTreeMap::new();
    options.insert("bridge".to_string(), "br-int".to_string());
    options.insert("ovn.switch".to_string(), "ls-tenant-a".to_string());
    options.insert("mirror.ports".to_string(), "veth1,veth2".to_string());
    NetworkRecord {
        id: "3f2a9c".into(),
        name: "tenant-a".into(),
        bridge: "br-int".into(),
        vlan: Some(100),
        tenant_id: Some("tenant-a".into()),
        ovn_switch: Some("ls-tenant-a".into()),
        ovn_router: None,
        options,
        ipam_data: Some(json!([{
            "AddressSpace": "",
            "Pool": "10.0.0.0/24",
            "Gateway": "10.0.0.1/24",
            "AuxAddresses": {"reserved": "10.0.0.250"}
        }])),
    }
}

fn sample_endpoint() -> EndpointRecord {
    EndpointRecord {
        network_id: "3f2a9c".into(),
        endpoint_id: "e3b0c44298fc1c14".into(),
        container_id: "c0ffee".into(),
        veth_name: "vethe3b0c44".into(),
        ip_address: Some("10.0.0.2/24".into()),
        mac_address: "02:00:0a:00:00:02".into(),
        gateway: Some("10.0.0.1".into()),
        ovn_port: Some("lsp-e3b0c44298fc".into()),
        sandbox_key: None,
    }
}

#[tokio::test]
async fn records_survive_restart_field_for_field() {
    let dir = tempfile::tempdir().unwrap();
    let network = sample_network();
    let endpoint = sample_endpoint();
    {
        let store = FileStore::open(dir.path(), RecoveryPolicy::Strict).unwrap();
        store.save_network(&network).await.unwrap();
        store.save_endpoint(&endpoint).await.unwrap();
    }

    let store = FileStore::open(dir.path(), RecoveryPolicy::Strict).unwrap();
    assert_eq!(store.get_network(&network.id).await.unwrap(), Some(network));
    assert_eq!(
        store.get_endpoint(&endpoint.network_id, &endpoint.endpoint_id).await.unwrap(),
        Some(endpoint)
    );
    assert_eq!(store.recovery_report().networks, CollectionStatus::Loaded(1));
}

#[tokio::test]
async fn reads_return_copies() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path(), RecoveryPolicy::Lenient).unwrap();
    store.save_network(&sample_network()).await.unwrap();

    let mut copy = store.get_network("3f2a9c").await.unwrap().unwrap();
    copy.options.insert("vlan".into(), "200".into());
    assert_eq!(store.get_network("3f2a9c").await.unwrap(), Some(sample_network()));
}

#[tokio::test]
async fn lenient_recovery_isolates_corrupt_collection() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FileStore::open(dir.path(), RecoveryPolicy::Strict).unwrap();
        store.save_endpoint(&sample_endpoint()).await.unwrap();
    }
    std::fs::write(dir.path().join(NETWORKS_FILE), b"{\"3f2a9c\": {\"id\": ").unwrap();

    let store = FileStore::open(dir.path(), RecoveryPolicy::Lenient).unwrap();
    assert!(store.list_networks().await.unwrap().is_empty());
    assert_eq!(store.list_endpoints().await.unwrap(), vec![sample_endpoint()]);
    assert!(store.recovery_report().degraded());

    // The corrupt file is kept for inspection.
    let preserved = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().starts_with("networks.json.corrupt-"));
    assert!(preserved);

    // Writes keep working.
    store.save_network(&sample_network()).await.unwrap();
    assert!(dir.path().join(NETWORKS_FILE).exists());
}

#[tokio::test]
async fn concurrent_saves_leave_a_complete_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = std::sync::Arc::new(FileStore::open(dir.path(), RecoveryPolicy::Strict).unwrap());

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut ep = sample_endpoint();
            ep.endpoint_id = format!("ep{:02}", i);
            store.save_endpoint(&ep).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let raw = std::fs::read(dir.path().join(ENDPOINTS_FILE)).unwrap();
    let on_disk: BTreeMap<String, EndpointRecord> = serde_json::from_slice(&raw).unwrap();
    assert_eq!(on_disk.len(), 16);
    assert!(on_disk.contains_key("3f2a9c:ep07"));
}
