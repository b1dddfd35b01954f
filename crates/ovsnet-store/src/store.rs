//! File-backed state store
//!
//! Two collections, `networks.json` and `endpoints.json`, each a complete
//! snapshot rewritten (temp file + rename) on every mutation. One lock covers
//! both collections; reads hand out clones.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StoreError};
use crate::records::{endpoint_key, EndpointRecord, NetworkRecord};

pub const NETWORKS_FILE: &str = "networks.json";
pub const ENDPOINTS_FILE: &str = "endpoints.json";

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_network(&self, network: &NetworkRecord) -> Result<()>;
    async fn get_network(&self, id: &str) -> Result<Option<NetworkRecord>>;
    /// Returns whether a record was removed.
    async fn delete_network(&self, id: &str) -> Result<bool>;
    async fn list_networks(&self) -> Result<Vec<NetworkRecord>>;

    async fn save_endpoint(&self, endpoint: &EndpointRecord) -> Result<()>;
    async fn get_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<Option<EndpointRecord>>;
    async fn delete_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<bool>;
    async fn list_endpoints(&self) -> Result<Vec<EndpointRecord>>;

    async fn list_network_endpoints(&self, network_id: &str) -> Result<Vec<EndpointRecord>> {
        Ok(self
            .list_endpoints()
            .await?
            .into_iter()
            .filter(|e| e.network_id == network_id)
            .collect())
    }
}

/// What to do with a collection that fails to decode at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Refuse to start
    Strict,
    /// Move the file aside as `<file>.corrupt-<timestamp>` and start that collection empty
    #[default]
    Lenient,
    /// Skip reading persisted state entirely
    Ignore,
}

impl FromStr for RecoveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(RecoveryPolicy::Strict),
            "lenient" => Ok(RecoveryPolicy::Lenient),
            "ignore" => Ok(RecoveryPolicy::Ignore),
            other => Err(format!("unknown recovery policy '{}' (strict|lenient|ignore)", other)),
        }
    }
}

impl fmt::Display for RecoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecoveryPolicy::Strict => "strict",
            RecoveryPolicy::Lenient => "lenient",
            RecoveryPolicy::Ignore => "ignore",
        })
    }
}

/// Outcome of loading one collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionStatus {
    Missing,
    Loaded(usize),
    Quarantined { moved_to: PathBuf, reason: String },
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub networks: CollectionStatus,
    pub endpoints: CollectionStatus,
}

impl RecoveryReport {
    pub fn degraded(&self) -> bool {
        matches!(self.networks, CollectionStatus::Quarantined { .. })
            || matches!(self.endpoints, CollectionStatus::Quarantined { .. })
    }
}

#[derive(Default)]
struct Collections {
    networks: BTreeMap<String, NetworkRecord>,
    endpoints: BTreeMap<String, EndpointRecord>,
}

/// `StateStore` persisted as two JSON snapshot files in one directory
pub struct FileStore {
    dir: PathBuf,
    inner: RwLock<Collections>,
    report: RecoveryReport,
}

impl FileStore {
    /// Open (creating `dir` if needed) and recover both collections.
    pub fn open(dir: impl Into<PathBuf>, policy: RecoveryPolicy) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let (networks, network_status) = recover::<NetworkRecord>(&dir.join(NETWORKS_FILE), policy)?;
        let (endpoints, endpoint_status) = recover::<EndpointRecord>(&dir.join(ENDPOINTS_FILE), policy)?;

        let collections = Collections {
            networks: networks.into_iter().map(|n| (n.id.clone(), n)).collect(),
            endpoints: endpoints.into_iter().map(|e| (e.key(), e)).collect(),
        };
        info!(
            "State store at {} ({} policy): {} networks, {} endpoints",
            dir.display(),
            policy,
            collections.networks.len(),
            collections.endpoints.len()
        );

        Ok(Self {
            dir,
            inner: RwLock::new(collections),
            report: RecoveryReport {
                networks: network_status,
                endpoints: endpoint_status,
            },
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }
}

/// Load one collection according to `policy`.
fn recover<T: DeserializeOwned>(path: &Path, policy: RecoveryPolicy) -> Result<(Vec<T>, CollectionStatus)> {
    if policy == RecoveryPolicy::Ignore {
        if path.exists() {
            warn!("Ignoring persisted state in {}", path.display());
        }
        return Ok((Vec::new(), CollectionStatus::Ignored));
    }

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} does not exist, starting empty", path.display());
            return Ok((Vec::new(), CollectionStatus::Missing));
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };

    match serde_json::from_slice::<BTreeMap<String, T>>(&bytes) {
        Ok(map) => {
            let count = map.len();
            Ok((map.into_values().collect(), CollectionStatus::Loaded(count)))
        }
        Err(e) if policy == RecoveryPolicy::Strict => Err(StoreError::Corruption {
            file: path.to_path_buf(),
            message: e.to_string(),
        }),
        Err(e) => {
            let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
            let moved_to = PathBuf::from(format!("{}.corrupt-{}", path.display(), stamp));
            std::fs::rename(path, &moved_to).map_err(|err| StoreError::io(path, err))?;
            error!(
                "Corrupt state file {} ({}); preserved as {} and starting empty",
                path.display(),
                e,
                moved_to.display()
            );
            Ok((
                Vec::new(),
                CollectionStatus::Quarantined {
                    moved_to,
                    reason: e.to_string(),
                },
            ))
        }
    }
}

/// Full overwrite through a temp file so readers never see a partial snapshot.
/// The file and its directory are synced before this returns.
async fn write_snapshot<T: Serialize>(path: PathBuf, map: &BTreeMap<String, T>) -> Result<()> {
    let data = serde_json::to_vec_pretty(map)?;
    let target = path.clone();
    tokio::task::spawn_blocking(move || persist(&target, &data))
        .await
        .map_err(|e| StoreError::io(&path, std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

fn persist(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;

    let tmp = path.with_extension("json.tmp");
    let mut file = std::fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
    file.write_all(data).map_err(|e| StoreError::io(&tmp, e))?;
    file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    drop(file);

    std::fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    if let Some(dir) = path.parent() {
        std::fs::File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| StoreError::io(dir, e))?;
    }
    Ok(())
}

#[async_trait]
impl StateStore for FileStore {
    async fn save_network(&self, network: &NetworkRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let previous = inner.networks.insert(network.id.clone(), network.clone());
        if let Err(e) = write_snapshot(self.path(NETWORKS_FILE), &inner.networks).await {
            match previous {
                Some(prev) => inner.networks.insert(network.id.clone(), prev),
                None => inner.networks.remove(&network.id),
            };
            return Err(e);
        }
        debug!("Saved network {}", network.id);
        Ok(())
    }

    async fn get_network(&self, id: &str) -> Result<Option<NetworkRecord>> {
        Ok(self.inner.read().await.networks.get(id).cloned())
    }

    async fn delete_network(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(previous) = inner.networks.remove(id) else {
            return Ok(false);
        };
        if let Err(e) = write_snapshot(self.path(NETWORKS_FILE), &inner.networks).await {
            inner.networks.insert(id.to_string(), previous);
            return Err(e);
        }
        debug!("Deleted network {}", id);
        Ok(true)
    }

    async fn list_networks(&self) -> Result<Vec<NetworkRecord>> {
        Ok(self.inner.read().await.networks.values().cloned().collect())
    }

    async fn save_endpoint(&self, endpoint: &EndpointRecord) -> Result<()> {
        let key = endpoint.key();
        let mut inner = self.inner.write().await;
        let previous = inner.endpoints.insert(key.clone(), endpoint.clone());
        if let Err(e) = write_snapshot(self.path(ENDPOINTS_FILE), &inner.endpoints).await {
            match previous {
                Some(prev) => inner.endpoints.insert(key, prev),
                None => inner.endpoints.remove(&key),
            };
            return Err(e);
        }
        debug!("Saved endpoint {}", key);
        Ok(())
    }

    async fn get_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<Option<EndpointRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .endpoints
            .get(&endpoint_key(network_id, endpoint_id))
            .cloned())
    }

    async fn delete_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<bool> {
        let key = endpoint_key(network_id, endpoint_id);
        let mut inner = self.inner.write().await;
        let Some(previous) = inner.endpoints.remove(&key) else {
            return Ok(false);
        };
        if let Err(e) = write_snapshot(self.path(ENDPOINTS_FILE), &inner.endpoints).await {
            inner.endpoints.insert(key, previous);
            return Err(e);
        }
        debug!("Deleted endpoint {}", key);
        Ok(true)
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointRecord>> {
        Ok(self.inner.read().await.endpoints.values().cloned().collect())
    }

    async fn list_network_endpoints(&self, network_id: &str) -> Result<Vec<EndpointRecord>> {
        // Keys sort by network id first, so a range scan is enough.
        let prefix = format!("{}:", network_id);
        Ok(self
            .inner
            .read()
            .await
            .endpoints
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, e)| e.clone())
            .collect())
    }
}
