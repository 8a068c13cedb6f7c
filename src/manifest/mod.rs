//! Stack manifest: file format, typed descriptors and the service registry

pub mod config;
pub mod descriptor;
pub mod parser;
pub mod registry;

pub use config::{ManifestFile, RouteConfig, ServiceConfig, SupervisorSection, TunnelSection};
pub use descriptor::{
    is_secret_key, parse_duration, HealthCheck, HealthDefaults, PortBinding, Probe, Protocol,
    ServiceDescriptor, VolumeBinding, VolumeSource, DEFAULT_NETWORK,
};
pub use parser::{ManifestParser, ParsedManifest, DEFAULT_MANIFEST_FILES};
pub use registry::{ServiceRegistry, VolumeSpec};
