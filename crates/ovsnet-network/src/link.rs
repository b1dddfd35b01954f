//! Host link management over rtnetlink: the veth pair behind each endpoint

use async_trait::async_trait;
use futures::TryStreamExt;
use rtnetlink::{new_connection, Handle};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use crate::ovs_error::{OvsError, OvsResult};

/// Creates and removes the interface pair connecting a sandbox to the bridge
#[async_trait]
pub trait LinkManager: Send + Sync {
    /// Create `name` <-> `peer`, set the MAC on `name` and the MTU on both, bring `peer` up.
    /// An existing pair is left as is.
    async fn create_veth_pair(&self, name: &str, peer: &str, mac: &str, mtu: Option<u32>) -> OvsResult<()>;

    /// Delete the pair by its `name` end; absent links are not an error.
    async fn delete_veth_pair(&self, name: &str) -> OvsResult<()>;

    async fn link_exists(&self, name: &str) -> OvsResult<bool>;
}

pub const DEFAULT_NETLINK_TIMEOUT: Duration = Duration::from_secs(5);

/// `LinkManager` using a fresh rtnetlink connection per call
#[derive(Debug, Clone)]
pub struct NetlinkLinks {
    /// Bound on each whole operation, connection included
    timeout: Duration,
}

impl Default for NetlinkLinks {
    fn default() -> Self {
        Self::new()
    }
}

impl NetlinkLinks {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_NETLINK_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn bounded<T>(&self, what: String, op: impl Future<Output = OvsResult<T>>) -> OvsResult<T> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| OvsError::Timeout(self.timeout.as_millis() as u64, what))?
    }

    fn connect() -> OvsResult<Handle> {
        let (connection, handle, _) =
            new_connection().map_err(|e| OvsError::Netlink("connection".to_string(), e.to_string()))?;
        tokio::spawn(connection);
        Ok(handle)
    }

    async fn index_of(handle: &Handle, name: &str) -> OvsResult<Option<u32>> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(Some(link.header.index)),
            Ok(None) => Ok(None),
            Err(e) if errno(&e) == Some(libc::ENODEV) => Ok(None),
            Err(e) => Err(netlink_error(name, e)),
        }
    }
}

fn errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.code.map(|c| -c.get()),
        _ => None,
    }
}

fn netlink_error(name: &str, err: rtnetlink::Error) -> OvsError {
    match errno(&err) {
        Some(code) if code == libc::EPERM => OvsError::PermissionDenied,
        Some(code) if code == libc::EEXIST => OvsError::AlreadyExists(format!("link {}", name)),
        Some(code) if code == libc::ENODEV => OvsError::NotFound(format!("link {}", name)),
        _ => OvsError::Netlink(name.to_string(), err.to_string()),
    }
}

fn parse_mac(mac: &str) -> OvsResult<Vec<u8>> {
    let bytes = mac
        .split(':')
        .map(|part| u8::from_str_radix(part, 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| OvsError::Parse(format!("invalid MAC address {}", mac)))?;
    if bytes.len() != 6 {
        return Err(OvsError::Parse(format!("invalid MAC address {}", mac)));
    }
    Ok(bytes)
}

impl NetlinkLinks {
    async fn create_pair(name: &str, peer: &str, mac: &str, mtu: Option<u32>) -> OvsResult<()> {
        let handle = Self::connect()?;
        let address = parse_mac(mac)?;

        if Self::index_of(&handle, name).await?.is_some() {
            debug!("veth {} already exists", name);
        } else {
            match handle
                .link()
                .add()
                .veth(name.to_string(), peer.to_string())
                .execute()
                .await
            {
                Ok(()) => info!("Created veth pair {} <-> {}", name, peer),
                Err(e) if errno(&e) == Some(libc::EEXIST) => debug!("veth {} created concurrently", name),
                Err(e) => return Err(netlink_error(name, e)),
            }
        }

        let index = Self::index_of(&handle, name)
            .await?
            .ok_or_else(|| OvsError::NotFound(format!("link {}", name)))?;
        let peer_index = Self::index_of(&handle, peer)
            .await?
            .ok_or_else(|| OvsError::NotFound(format!("link {}", peer)))?;

        handle
            .link()
            .set(index)
            .address(address)
            .execute()
            .await
            .map_err(|e| netlink_error(name, e))?;

        if let Some(mtu) = mtu {
            for (link, idx) in [(name, index), (peer, peer_index)] {
                handle
                    .link()
                    .set(idx)
                    .mtu(mtu)
                    .execute()
                    .await
                    .map_err(|e| netlink_error(link, e))?;
            }
        }

        handle
            .link()
            .set(peer_index)
            .up()
            .execute()
            .await
            .map_err(|e| netlink_error(peer, e))?;
        Ok(())
    }

    async fn delete_pair(name: &str) -> OvsResult<()> {
        let handle = Self::connect()?;
        let Some(index) = Self::index_of(&handle, name).await? else {
            debug!("veth {} not present", name);
            return Ok(());
        };
        match handle.link().del(index).execute().await {
            Ok(()) => {
                info!("Deleted veth {}", name);
                Ok(())
            }
            Err(e) if errno(&e) == Some(libc::ENODEV) => Ok(()),
            Err(e) => Err(netlink_error(name, e)),
        }
    }

    async fn exists(name: &str) -> OvsResult<bool> {
        let handle = Self::connect()?;
        Ok(Self::index_of(&handle, name).await?.is_some())
    }
}

#[async_trait]
impl LinkManager for NetlinkLinks {
    async fn create_veth_pair(&self, name: &str, peer: &str, mac: &str, mtu: Option<u32>) -> OvsResult<()> {
        self.bounded(format!("veth {} create", name), Self::create_pair(name, peer, mac, mtu))
            .await
    }

    async fn delete_veth_pair(&self, name: &str) -> OvsResult<()> {
        self.bounded(format!("veth {} delete", name), Self::delete_pair(name)).await
    }

    async fn link_exists(&self, name: &str) -> OvsResult<bool> {
        self.bounded(format!("link {} lookup", name), Self::exists(name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(parse_mac("02:00:0a:00:00:02").unwrap(), vec![2, 0, 10, 0, 0, 2]);
        assert!(parse_mac("02:00:0a").is_err());
        assert!(parse_mac("zz:00:0a:00:00:02").is_err());
    }

    #[tokio::test]
    async fn test_stalled_request_times_out() {
        let links = NetlinkLinks::with_timeout(Duration::from_millis(20));
        let err = links
            .bounded("link lo lookup".to_string(), futures::future::pending::<OvsResult<bool>>())
            .await
            .unwrap_err();
        assert!(matches!(err, OvsError::Timeout(20, _)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_completed_request_passes_through() {
        let links = NetlinkLinks::new();
        let value = links.bounded("noop".to_string(), async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    // Loopback always exists; reading links needs no privileges.
    #[tokio::test(flavor = "current_thread")]
    async fn test_loopback_exists() {
        let links = NetlinkLinks::new();
        assert!(links.link_exists("lo").await.unwrap());
        assert!(!links.link_exists("ovsnet-absent0").await.unwrap());
    }
}
