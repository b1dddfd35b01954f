//! Service configuration
//!
//! Layered: TOML file, then `OVSNET_*` environment variables, then CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::info;

use ovsnet_core::config::parse_bool;
use ovsnet_driver::{ControllerSettings, OrchestratorSettings, ProvisionerSettings, Scope};
use ovsnet_network::RpcSettings;
use ovsnet_store::RecoveryPolicy;

pub const CONFIG_PATHS: &[&str] = &["/etc/ovsnet/ovsnet.toml", "ovsnet.toml"];
pub const OVSDB_SOCKET_PATHS: &[&str] = &["/var/run/openvswitch/db.sock", "/run/openvswitch/db.sock"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub recovery_policy: RecoveryPolicy,
    pub scope: Scope,
    pub ovsdb_socket: PathBuf,
    /// Let networks without connection strings fall back to the local defaults
    pub allow_default_sdn_endpoints: bool,
    pub backend: BackendConfig,
    pub provisioner: ProvisionerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data"),
            recovery_policy: RecoveryPolicy::Lenient,
            scope: Scope::Local,
            ovsdb_socket: default_ovsdb_socket(),
            allow_default_sdn_endpoints: false,
            backend: BackendConfig::default(),
            provisioner: ProvisionerConfig::default(),
        }
    }
}

fn default_ovsdb_socket() -> PathBuf {
    OVSDB_SOCKET_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from(OVSDB_SOCKET_PATHS[0]))
}

/// Which adapter implementations the controller is wired to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// OVSDB, OVN northbound, rtnetlink and the container runtime
    #[default]
    System,
    /// In-process fakes; nothing on the host is touched
    Memory,
}

impl std::str::FromStr for BackendMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "system" => Ok(BackendMode::System),
            "memory" => Ok(BackendMode::Memory),
            other => anyhow::bail!("unknown backend '{}' (system|memory)", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub mode: BackendMode,
    pub timeout_secs: u64,
    pub retries: u32,
    pub backoff_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::System,
            timeout_secs: 5,
            retries: 3,
            backoff_ms: 500,
        }
    }
}

impl BackendConfig {
    pub fn rpc_settings(&self) -> RpcSettings {
        RpcSettings {
            timeout: Duration::from_secs(self.timeout_secs),
            retries: self.retries,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub runtime_bin: String,
    pub image: String,
    pub container_name: String,
    pub default_network: String,
    pub candidate_subnets: Vec<Ipv4Net>,
    pub probe_timeout_ms: u64,
    pub ready_attempts: u32,
    pub ready_interval_ms: u64,
    pub command_timeout_secs: u64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        let provisioner = ProvisionerSettings::default();
        let orchestrator = OrchestratorSettings::default();
        Self {
            runtime_bin: provisioner.runtime_bin,
            image: provisioner.image,
            container_name: provisioner.container_name,
            default_network: orchestrator.default_management_network,
            candidate_subnets: provisioner.candidate_subnets,
            probe_timeout_ms: provisioner.probe_timeout.as_millis() as u64,
            ready_attempts: orchestrator.ready_attempts,
            ready_interval_ms: orchestrator.ready_interval.as_millis() as u64,
            command_timeout_secs: provisioner.command_timeout.as_secs(),
        }
    }
}

impl ProvisionerConfig {
    pub fn provisioner_settings(&self) -> ProvisionerSettings {
        ProvisionerSettings {
            runtime_bin: self.runtime_bin.clone(),
            image: self.image.clone(),
            container_name: self.container_name.clone(),
            candidate_subnets: self.candidate_subnets.clone(),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            default_management_network: self.default_network.clone(),
            ready_attempts: self.ready_attempts,
            ready_interval: Duration::from_millis(self.ready_interval_ms),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("Failed to parse config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load the explicit file, else the first default path found, else defaults
    pub fn load_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        for path in CONFIG_PATHS {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }
        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Apply `OVSNET_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(ovsnet_core::config::get_config_opt)
    }

    /// Apply overrides from any variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("OVSNET_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(policy) = lookup("OVSNET_RECOVERY_POLICY") {
            self.recovery_policy = policy.parse::<RecoveryPolicy>().map_err(anyhow::Error::msg)?;
        }
        if let Some(socket) = lookup("OVSNET_OVSDB_SOCKET") {
            self.ovsdb_socket = PathBuf::from(socket);
        }
        if let Some(scope) = lookup("OVSNET_SCOPE") {
            self.scope = scope.parse::<Scope>().context("OVSNET_SCOPE")?;
        }
        if let Some(allow) = lookup("OVSNET_ALLOW_DEFAULT_SDN") {
            self.allow_default_sdn_endpoints = parse_bool(&allow);
        }
        if let Some(mode) = lookup("OVSNET_BACKEND") {
            self.backend.mode = mode.parse::<BackendMode>()?;
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            scope: self.scope,
            allow_default_sdn_endpoints: self.allow_default_sdn_endpoints,
        }
    }
}
