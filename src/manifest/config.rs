//! On-disk shape of `hearth.yaml`
//!
//! The service block follows the compose file format closely enough that an
//! existing compose file for the stack mostly loads as is. Keys hearth does
//! not act on are rejected instead of silently ignored.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Top-level manifest document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestFile {
    /// Accepted for compose compatibility and otherwise unused
    pub version: Option<String>,
    /// Used as the project name unless `HEARTH_PROJECT` is set
    pub name: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub networks: BTreeMap<String, Option<NetworkConfig>>,
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<VolumeConfig>>,
    pub tunnel: Option<TunnelSection>,
    pub supervisor: Option<SupervisorSection>,
}

/// One entry under `services:`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Pre-built image reference; hearth never builds images
    pub image: Option<String>,
    pub command: Option<CommandConfig>,
    pub environment: Option<EnvironmentConfig>,
    /// `host:container[/proto]` strings or long-form entries
    pub ports: Option<Vec<PortConfig>>,
    /// `name:/path[:ro]` for named volumes, or a host path for bind mounts
    pub volumes: Option<Vec<VolumeMount>>,
    pub networks: Option<NetworksConfig>,
    pub depends_on: Option<DependsOnConfig>,
    pub healthcheck: Option<HealthcheckConfig>,
    /// `host:ip` pairs added to the container's hosts file
    pub extra_hosts: Option<Vec<String>>,
    /// Handed to the container engine untouched
    pub restart: Option<String>,
}

/// `command:` as one shell string or an argv list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    Shell(String),
    Exec(Vec<String>),
}

/// `environment:` as `KEY=value` lines or a mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    Array(Vec<String>),
    Map(HashMap<String, Option<EnvValue>>),
}

/// YAML scalars allowed as environment values
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    String(String),
    Number(serde_yaml::Number),
    Bool(bool),
}

impl std::fmt::Display for EnvValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvValue::String(value) => f.write_str(value),
            EnvValue::Number(value) => write!(f, "{}", value),
            EnvValue::Bool(value) => write!(f, "{}", value),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    Short(String),
    Long(PortConfigLong),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortConfigLong {
    /// Port inside the container
    pub target: u16,
    /// Host port; same as `target` when omitted
    pub published: Option<u16>,
    pub host_ip: Option<String>,
    /// `tcp` or `udp`
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    Short(String),
    Long(VolumeMountLong),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeMountLong {
    /// `volume` or `bind`; inferred from `source` when omitted
    #[serde(rename = "type")]
    pub mount_type: Option<String>,
    pub source: String,
    pub target: String,
    pub read_only: Option<bool>,
}

/// `networks:` on a service, as a list or a mapping with per-network options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    Array(Vec<String>),
    Map(BTreeMap<String, Option<ServiceNetworkConfig>>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceNetworkConfig {
    pub aliases: Option<Vec<String>>,
}

/// `depends_on:` as a list or a compose-style condition mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    Array(Vec<String>),
    Map(BTreeMap<String, DependsOnCondition>),
}

impl DependsOnConfig {
    pub fn names(&self) -> Vec<String> {
        match self {
            DependsOnConfig::Array(names) => names.clone(),
            DependsOnConfig::Map(conditions) => conditions.keys().cloned().collect(),
        }
    }
}

/// Accepted but not interpreted: a dependency always has to be Healthy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnCondition {
    pub condition: Option<String>,
}

/// Readiness probe of a service, or defaults under `supervisor:`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthcheckConfig {
    /// Command run inside the container
    pub test: Option<HealthcheckTest>,
    /// URL fetched from the host
    pub http: Option<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub retries: Option<u32>,
    pub start_period: Option<String>,
    pub disable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    Command(String),
    Array(Vec<String>),
}

/// Entry under top-level `networks:`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub driver: Option<String>,
    pub name: Option<String>,
}

/// Entry under top-level `volumes:`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub name: Option<String>,
}

/// `tunnel:` block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelSection {
    /// Falls back to `TUNNEL_TOKEN` when unset
    pub token: Option<String>,
    /// Tunnel client executable
    pub binary: Option<String>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// A public hostname and where its traffic goes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub hostname: String,
    pub service: Option<String>,
    /// Container port; the service's first published port when omitted
    pub port: Option<u16>,
    /// Full origin URL, instead of service and port
    pub target: Option<String>,
}

/// `supervisor:` block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSection {
    pub tunnel_backoff: Option<BackoffSection>,
    /// Timings applied to every healthcheck that leaves them out
    pub healthcheck: Option<HealthcheckConfig>,
    /// Grace period before a stopping container is killed
    pub stop_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffSection {
    pub initial: Option<String>,
    pub multiplier: Option<f64>,
    pub max: Option<String>,
}
