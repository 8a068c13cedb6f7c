//! Container engine seam
//!
//! The sequencer only talks to containers through [`ContainerRuntime`].
//! [`DockerCli`] drives the local `docker` binary; tests use an in-memory
//! runtime.

pub mod docker;
#[cfg(test)]
pub mod mock;

pub use docker::DockerCli;

use crate::error::Result;
use crate::manifest::{PortBinding, ServiceDescriptor};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Label carrying the project name
pub const LABEL_PROJECT: &str = "hearth.project";
/// Label carrying the service name
pub const LABEL_SERVICE: &str = "hearth.service";
/// Label carrying the run identifier
pub const LABEL_RUN: &str = "hearth.run";

/// A bind of a host path into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything the runtime needs to launch one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name, `<project>-<service>`
    pub name: String,
    pub service: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<Mount>,
    /// Runtime network names
    pub networks: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub extra_hosts: Vec<String>,
    pub restart: Option<String>,
}

impl ContainerSpec {
    /// Spec for a descriptor; mounts are resolved by the caller
    pub fn for_service(project: &str, run_id: &str, descriptor: &ServiceDescriptor) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_PROJECT.to_string(), project.to_string());
        labels.insert(LABEL_SERVICE.to_string(), descriptor.name.clone());
        labels.insert(LABEL_RUN.to_string(), run_id.to_string());

        Self {
            name: container_name(project, &descriptor.name),
            service: descriptor.name.clone(),
            image: descriptor.image.clone(),
            command: descriptor.command.clone(),
            env: descriptor.environment.clone(),
            ports: descriptor.ports.clone(),
            mounts: Vec::new(),
            networks: descriptor
                .networks
                .iter()
                .map(|n| network_name(project, n))
                .collect(),
            labels,
            extra_hosts: descriptor.extra_hosts.clone(),
            restart: descriptor.restart.clone(),
        }
    }
}

/// Container name for a service
pub fn container_name(project: &str, service: &str) -> String {
    format!("{}-{}", project, service)
}

/// Runtime network name for a manifest network
pub fn network_name(project: &str, network: &str) -> String {
    format!("{}_{}", project, network)
}

/// What the runtime reports about a service's container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited(Option<i32>),
    Missing,
}

/// Which stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line of container output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
}

/// Log streaming options
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub follow: bool,
    pub tail: Option<usize>,
}

/// Container engine operations used by the supervisor
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a network if it does not exist; returns whether it was created
    async fn ensure_network(&self, name: &str) -> Result<bool>;

    /// Create and start a container, replacing a stopped one with the same name
    async fn start(&self, spec: &ContainerSpec) -> Result<()>;

    /// Stop and remove a service container; missing containers are fine
    async fn stop(&self, service: &str, timeout: Duration) -> Result<()>;

    /// Current container state
    async fn inspect(&self, service: &str) -> Result<ContainerState>;

    /// Run a command inside the container and return its exit code
    async fn exec(&self, service: &str, argv: &[String]) -> Result<i32>;

    /// Whether a host port can be bound
    async fn port_available(&self, port: &PortBinding) -> bool;

    /// Stream container output until it ends or the receiver is dropped
    async fn logs(&self, service: &str, options: LogOptions) -> Result<mpsc::Receiver<LogLine>>;
}
