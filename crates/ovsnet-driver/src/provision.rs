//! SDN control-plane auto-provisioning
//!
//! When a network asks for `ovn.auto_create` and its declared endpoints do not
//! answer, the control plane is started as a container attached to a
//! dedicated management network. The container always gets the fifth
//! address of that network's subnet.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use ovsnet_core::{Backend, Error, Result};

use crate::options::SdnEndpoints;

/// Host offset of the control-plane address inside the management subnet
pub const CONTROL_PLANE_HOST: u32 = 5;

pub const DEFAULT_CANDIDATE_SUBNETS: &[&str] =
    &["172.30.0.0/24", "172.31.0.0/24", "192.168.200.0/24", "192.168.201.0/24"];

/// Probes and starts the SDN control plane
#[async_trait]
pub trait ControlPlaneProvisioner: Send + Sync {
    /// Both connection strings answer within the probe timeout.
    async fn reachable(&self, endpoints: &SdnEndpoints) -> bool;

    /// Ensure the management network and the control-plane process exist and
    /// run; returns the control-plane address.
    async fn provision(&self, management_network: &str) -> Result<Ipv4Addr>;
}

/// Address of the control plane inside a management subnet.
pub fn control_plane_address(subnet: &Ipv4Net) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()).saturating_add(CONTROL_PLANE_HOST))
}

#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    pub runtime_bin: String,
    pub image: String,
    pub container_name: String,
    pub candidate_subnets: Vec<Ipv4Net>,
    pub probe_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            runtime_bin: "docker".to_string(),
            image: "ovn-central:latest".to_string(),
            container_name: "ovn-central".to_string(),
            candidate_subnets: DEFAULT_CANDIDATE_SUBNETS
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            probe_timeout: Duration::from_millis(2000),
            command_timeout: Duration::from_secs(30),
        }
    }
}

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// The runtime refused `run` because the container name is taken.
fn name_conflict(stderr: &str) -> bool {
    stderr.contains("Conflict") || stderr.contains("is already in use")
}

/// Provisioner driving the container runtime's command-line client
pub struct DockerCliProvisioner {
    settings: ProvisionerSettings,
    /// Serializes provision() across every network in this process
    lock: tokio::sync::Mutex<()>,
}

impl DockerCliProvisioner {
    pub fn new(settings: ProvisionerSettings) -> Self {
        Self {
            settings,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        debug!("{} {}", self.settings.runtime_bin, args.join(" "));
        let child = Command::new(&self.settings.runtime_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::unavailable(
                    Backend::Runtime,
                    format!("failed to spawn {}: {}", self.settings.runtime_bin, e),
                )
            })?;

        let output = tokio::time::timeout(self.settings.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::unavailable(
                    Backend::Runtime,
                    format!(
                        "{} {} timed out after {}s",
                        self.settings.runtime_bin,
                        args.first().copied().unwrap_or_default(),
                        self.settings.command_timeout.as_secs()
                    ),
                )
            })?
            .map_err(|e| Error::backend(Backend::Runtime, format!("failed to wait for command: {}", e)))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Subnet of an existing management network, if there is one.
    async fn existing_subnet(&self, network: &str) -> Result<Option<Ipv4Net>> {
        let out = self
            .run(&[
                "network",
                "inspect",
                network,
                "--format",
                "{{range .IPAM.Config}}{{.Subnet}} {{end}}",
            ])
            .await?;
        if !out.success {
            return Ok(None);
        }
        Ok(out
            .stdout
            .split_whitespace()
            .find_map(|s| s.parse::<Ipv4Net>().ok())
            .map(|n| n.trunc()))
    }

    async fn ensure_management_network(&self, network: &str) -> Result<Ipv4Net> {
        if let Some(subnet) = self.existing_subnet(network).await? {
            info!("Using existing management network {} ({})", network, subnet);
            return Ok(subnet);
        }

        for subnet in &self.settings.candidate_subnets {
            let gateway = subnet
                .hosts()
                .next()
                .map(|g| g.to_string())
                .unwrap_or_default();
            let subnet_arg = subnet.to_string();
            let out = self
                .run(&[
                    "network",
                    "create",
                    "--driver",
                    "bridge",
                    "--subnet",
                    &subnet_arg,
                    "--gateway",
                    &gateway,
                    network,
                ])
                .await?;
            if out.success {
                info!("Created management network {} ({})", network, subnet);
                return Ok(*subnet);
            }
            if out.stderr.contains("Pool overlaps") || out.stderr.contains("overlaps with") {
                debug!("Subnet {} in use, trying next candidate", subnet);
                continue;
            }
            if out.stderr.contains("already exists") {
                // Created concurrently by someone else.
                if let Some(subnet) = self.existing_subnet(network).await? {
                    return Ok(subnet);
                }
            }
            return Err(Error::backend(
                Backend::Runtime,
                format!("failed to create management network {}: {}", network, out.stderr),
            ));
        }

        Err(Error::unavailable(
            Backend::Runtime,
            format!("no free subnet for management network {}", network),
        ))
    }

    /// Running state of the named container; `None` when it does not exist.
    async fn container_running(&self, name: &str) -> Result<Option<bool>> {
        let state = self
            .run(&["inspect", "--format", "{{.State.Running}}", name])
            .await?;
        Ok(state.success.then(|| state.stdout == "true"))
    }

    /// Address the container holds on `network`, if attached.
    async fn attached_address(&self, name: &str, network: &str) -> Result<Option<Ipv4Addr>> {
        let format = format!(
            "{{{{with index .NetworkSettings.Networks \"{}\"}}}}{{{{.IPAddress}}}}{{{{end}}}}",
            network
        );
        let out = self.run(&["inspect", "--format", &format, name]).await?;
        if !out.success {
            return Ok(None);
        }
        Ok(out.stdout.trim().parse().ok())
    }

    /// Bring an existing container up and make sure it sits on the
    /// management network at `address`.
    async fn adopt_container(&self, network: &str, address: Ipv4Addr, running: bool) -> Result<()> {
        let name = self.settings.container_name.as_str();
        match self.attached_address(name, network).await? {
            Some(current) if current == address => {
                debug!("Control plane container {} attached to {} at {}", name, network, address);
            }
            current => {
                if let Some(current) = current {
                    warn!(
                        "Control plane container {} holds {} on {}, moving it to {}",
                        name, current, network, address
                    );
                    let out = self.run(&["network", "disconnect", network, name]).await?;
                    if !out.success {
                        return Err(Error::backend(
                            Backend::Runtime,
                            format!("failed to detach {} from {}: {}", name, network, out.stderr),
                        ));
                    }
                } else {
                    info!("Attaching control plane container {} to {} at {}", name, network, address);
                }
                let ip = address.to_string();
                let out = self.run(&["network", "connect", "--ip", &ip, network, name]).await?;
                if !out.success {
                    return Err(Error::backend(
                        Backend::Runtime,
                        format!("failed to attach {} to {}: {}", name, network, out.stderr),
                    ));
                }
            }
        }

        if running {
            debug!("Control plane container {} already running", name);
            return Ok(());
        }
        info!("Starting control plane container {}", name);
        let out = self.run(&["start", name]).await?;
        if !out.success {
            return Err(Error::backend(
                Backend::Runtime,
                format!("failed to start {}: {}", name, out.stderr),
            ));
        }
        Ok(())
    }

    async fn ensure_container(&self, network: &str, address: Ipv4Addr) -> Result<()> {
        let name = self.settings.container_name.as_str();
        if let Some(running) = self.container_running(name).await? {
            return self.adopt_container(network, address, running).await;
        }

        let image = self.run(&["image", "inspect", &self.settings.image]).await?;
        if !image.success {
            return Err(Error::unavailable(
                Backend::Runtime,
                format!("image {} not found; build it first", self.settings.image),
            ));
        }

        let ip = address.to_string();
        info!("Launching control plane container {} at {}", name, ip);
        let out = self
            .run(&[
                "run",
                "-d",
                "--name",
                name,
                "--hostname",
                name,
                "--restart",
                "unless-stopped",
                "--privileged",
                "-p",
                "6641:6641",
                "-p",
                "6642:6642",
                "-v",
                "ovn-nb-db:/var/lib/ovn",
                "-v",
                "ovn-logs:/var/log/ovn",
                "--cap-add",
                "NET_ADMIN",
                "--cap-add",
                "SYS_MODULE",
                "--cap-add",
                "SYS_NICE",
                "--network",
                network,
                "--ip",
                &ip,
                &self.settings.image,
            ])
            .await?;
        if out.success {
            return Ok(());
        }
        if name_conflict(&out.stderr) {
            // Another client created it between our inspect and run.
            info!("Control plane container {} created concurrently, adopting it", name);
            let running = self.container_running(name).await?.unwrap_or(false);
            return self.adopt_container(network, address, running).await;
        }
        Err(Error::backend(
            Backend::Runtime,
            format!("failed to launch {}: {}", name, out.stderr),
        ))
    }
}

#[async_trait]
impl ControlPlaneProvisioner for DockerCliProvisioner {
    async fn reachable(&self, endpoints: &SdnEndpoints) -> bool {
        let timeout = self.settings.probe_timeout;
        let (nb, sb) = futures::join!(
            endpoints.northbound.probe(timeout),
            endpoints.southbound.probe(timeout)
        );
        nb && sb
    }

    async fn provision(&self, management_network: &str) -> Result<Ipv4Addr> {
        let _guard = self.lock.lock().await;
        let subnet = self.ensure_management_network(management_network).await?;
        let address = control_plane_address(&subnet);
        self.ensure_container(management_network, address).await?;
        Ok(address)
    }
}

/// Scripted provisioner for dry runs and tests
pub struct MemoryProvisioner {
    reachable: AtomicBool,
    start_on_provision: bool,
    address: Ipv4Addr,
    provisions: AtomicUsize,
    probed: Mutex<Vec<String>>,
}

impl MemoryProvisioner {
    /// Control plane already answering.
    pub fn reachable() -> Self {
        Self::with_state(true, true)
    }

    /// Unreachable until provisioned, then reachable at `172.30.0.5`.
    pub fn on_demand() -> Self {
        Self::with_state(false, true)
    }

    /// Unreachable, and provisioning never brings it up.
    pub fn unreachable() -> Self {
        Self::with_state(false, false)
    }

    fn with_state(reachable: bool, start_on_provision: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            start_on_provision,
            address: Ipv4Addr::new(172, 30, 0, 5),
            provisions: AtomicUsize::new(0),
            probed: Mutex::new(Vec::new()),
        }
    }

    pub fn provision_count(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    /// Northbound endpoints probed so far.
    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ControlPlaneProvisioner for MemoryProvisioner {
    async fn reachable(&self, endpoints: &SdnEndpoints) -> bool {
        if let Ok(mut probed) = self.probed.lock() {
            probed.push(endpoints.northbound.to_string());
        }
        self.reachable.load(Ordering::SeqCst)
    }

    async fn provision(&self, management_network: &str) -> Result<Ipv4Addr> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        if self.start_on_provision {
            self.reachable.store(true, Ordering::SeqCst);
        } else {
            warn!("Control plane on {} did not start", management_network);
        }
        Ok(self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_plane_is_fifth_host() {
        let subnet: Ipv4Net = "172.31.0.0/24".parse().unwrap();
        assert_eq!(control_plane_address(&subnet), Ipv4Addr::new(172, 31, 0, 5));
    }

    #[test]
    fn test_default_candidates_in_order() {
        let settings = ProvisionerSettings::default();
        let subnets: Vec<String> = settings.candidate_subnets.iter().map(|s| s.to_string()).collect();
        assert_eq!(subnets, DEFAULT_CANDIDATE_SUBNETS);
    }

    #[tokio::test]
    async fn test_missing_runtime_binary_is_unavailable() {
        let provisioner = DockerCliProvisioner::new(ProvisionerSettings {
            runtime_bin: "/nonexistent/ovsnet-runtime".to_string(),
            ..ProvisionerSettings::default()
        });
        let err = provisioner.provision("transit-overlay").await.unwrap_err();
        assert_eq!(err.kind(), "BackendUnavailableError");
    }

    #[test]
    fn test_name_conflict_detection() {
        assert!(name_conflict(
            "docker: Error response from daemon: Conflict. The container name \"/ovn-central\" is already in use by container \"3f2a\"."
        ));
        assert!(!name_conflict("Unable to find image 'ovn-central:latest' locally"));
    }

    /// Shell stand-in for the runtime CLI. Every call is appended to `calls`;
    /// `run` creates the container, and `networks` is what inspect reports as
    /// its management address.
    struct FakeRuntime {
        dir: tempfile::TempDir,
    }

    impl FakeRuntime {
        fn new(run_reply: &str, networks: &str, existing: bool) -> Self {
            use std::os::unix::fs::PermissionsExt;

            let dir = tempfile::tempdir().unwrap();
            let state = dir.path().display().to_string();
            let script = format!(
                r#"#!/bin/sh
echo "$*" >> "{state}/calls"
case "$*" in
  "network inspect"*) echo "172.30.0.0/24 " ;;
  "inspect --format {{{{.State.Running}}}}"*) [ -f "{state}/created" ] || exit 1; echo true ;;
  "inspect --format"*) cat "{state}/networks" 2>/dev/null ;;
  "image inspect"*) ;;
  "network disconnect"*) rm -f "{state}/networks" ;;
  "network connect"*) echo 172.30.0.5 > "{state}/networks" ;;
  run*) sleep 0.2; touch "{state}/created"; {run_reply} ;;
  *) exit 1 ;;
esac
"#
            );
            let bin = dir.path().join("runtime");
            std::fs::write(&bin, script).unwrap();
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
            if !networks.is_empty() {
                std::fs::write(dir.path().join("networks"), networks).unwrap();
            }
            if existing {
                std::fs::write(dir.path().join("created"), "").unwrap();
            }
            Self { dir }
        }

        fn provisioner(&self) -> DockerCliProvisioner {
            DockerCliProvisioner::new(ProvisionerSettings {
                runtime_bin: self.dir.path().join("runtime").display().to_string(),
                ..ProvisionerSettings::default()
            })
        }

        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.dir.path().join("calls"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    #[tokio::test]
    async fn test_concurrent_provisions_launch_one_container() {
        let runtime = FakeRuntime::new("echo 3f2a", "172.30.0.5", false);
        let provisioner = runtime.provisioner();

        let (a, b) = futures::join!(provisioner.provision("mgmt"), provisioner.provision("mgmt"));
        assert_eq!(a.unwrap(), Ipv4Addr::new(172, 30, 0, 5));
        assert_eq!(b.unwrap(), Ipv4Addr::new(172, 30, 0, 5));
        assert_eq!(runtime.count("run "), 1);
    }

    #[tokio::test]
    async fn test_name_in_use_adopts_existing_container() {
        let runtime = FakeRuntime::new(
            "echo 'Error response from daemon: Conflict. The container name \"/ovn-central\" is already in use' >&2; exit 125",
            "172.30.0.5",
            false,
        );
        let provisioner = runtime.provisioner();

        let address = provisioner.provision("mgmt").await.unwrap();
        assert_eq!(address, Ipv4Addr::new(172, 30, 0, 5));
        assert_eq!(runtime.count("network connect"), 0);
    }

    #[tokio::test]
    async fn test_existing_container_is_attached_to_management_network() {
        let runtime = FakeRuntime::new("echo 3f2a", "", true);
        let provisioner = runtime.provisioner();

        provisioner.provision("mgmt").await.unwrap();
        assert_eq!(runtime.count("run "), 0);
        assert!(runtime
            .calls()
            .contains(&"network connect --ip 172.30.0.5 mgmt ovn-central".to_string()));
    }

    #[tokio::test]
    async fn test_existing_container_at_wrong_address_is_moved() {
        let runtime = FakeRuntime::new("echo 3f2a", "172.30.0.9", true);
        let provisioner = runtime.provisioner();

        provisioner.provision("mgmt").await.unwrap();
        let calls = runtime.calls();
        let disconnect = calls.iter().position(|c| c == "network disconnect mgmt ovn-central").unwrap();
        let connect = calls
            .iter()
            .position(|c| c == "network connect --ip 172.30.0.5 mgmt ovn-central")
            .unwrap();
        assert!(disconnect < connect);
    }

    #[tokio::test]
    async fn test_memory_provisioner_on_demand() {
        let provisioner = MemoryProvisioner::on_demand();
        let endpoints = SdnEndpoints {
            northbound: ovsnet_network::DbEndpoint::parse("tcp:10.0.0.5:6641").unwrap(),
            southbound: ovsnet_network::DbEndpoint::parse("tcp:10.0.0.5:6642").unwrap(),
        };
        assert!(!provisioner.reachable(&endpoints).await);
        assert_eq!(provisioner.provision("mgmt").await.unwrap(), Ipv4Addr::new(172, 30, 0, 5));
        assert!(provisioner.reachable(&endpoints).await);
        assert_eq!(provisioner.provision_count(), 1);
    }
}
