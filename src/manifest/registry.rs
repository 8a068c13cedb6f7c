//! Validated set of service descriptors

use super::config::ManifestFile;
use super::descriptor::{HealthDefaults, ServiceDescriptor, DEFAULT_NETWORK};
use crate::error::{HearthError, Result};
use crate::sequencer::DependencyGraph;
use std::collections::{BTreeMap, BTreeSet};

/// A named volume and the services that mount it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    /// First service in start order that mounts the volume
    pub owner: String,
    pub users: BTreeSet<String>,
}

/// Every service in the stack, keyed by name
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceDescriptor>,
    graph: DependencyGraph,
    start_order: Vec<String>,
    volumes: BTreeMap<String, VolumeSpec>,
    networks: BTreeSet<String>,
}

impl ServiceRegistry {
    /// Validate descriptors and build the registry.
    ///
    /// Fails on unknown dependencies, duplicate host ports and cycles.
    pub fn new(descriptors: Vec<ServiceDescriptor>) -> Result<Self> {
        let mut services = BTreeMap::new();
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            if services.insert(name.clone(), descriptor).is_some() {
                return Err(HearthError::InvalidConfig(format!(
                    "service '{}' is defined twice",
                    name
                )));
            }
        }

        for service in services.values() {
            for dep in &service.depends_on {
                if !services.contains_key(dep) {
                    return Err(HearthError::InvalidConfig(format!(
                        "service '{}' depends on unknown service '{}'",
                        service.name, dep
                    )));
                }
            }
        }

        let mut published: BTreeMap<(u16, String), &str> = BTreeMap::new();
        for service in services.values() {
            for port in &service.ports {
                let key = (port.host, port.protocol.to_string());
                if let Some(other) = published.insert(key, &service.name) {
                    return Err(HearthError::InvalidConfig(format!(
                        "host port {} is published by both '{}' and '{}'",
                        port.host, other, service.name
                    )));
                }
            }
        }

        let graph = DependencyGraph::from_descriptors(services.values());
        let start_order = graph.topological_order()?;

        let mut volumes: BTreeMap<String, VolumeSpec> = BTreeMap::new();
        for name in &start_order {
            let service = &services[name];
            for volume in service.volumes.iter().filter_map(|v| v.volume_name()) {
                volumes
                    .entry(volume.to_string())
                    .or_insert_with(|| VolumeSpec {
                        name: volume.to_string(),
                        owner: name.clone(),
                        users: BTreeSet::new(),
                    })
                    .users
                    .insert(name.clone());
            }
        }

        let networks = services
            .values()
            .flat_map(|s| s.networks.iter().cloned())
            .collect();

        Ok(Self {
            services,
            graph,
            start_order,
            volumes,
            networks,
        })
    }

    /// Build from a parsed manifest
    pub fn from_manifest(manifest: &ManifestFile, defaults: &HealthDefaults) -> Result<Self> {
        let descriptors = manifest
            .services
            .iter()
            .map(|(name, config)| ServiceDescriptor::from_config(name, config, defaults))
            .collect::<Result<Vec<_>>>()?;
        let mut registry = Self::new(descriptors)?;

        // declared but unused volumes are still managed, owned by nobody
        for name in manifest.volumes.keys() {
            registry
                .volumes
                .entry(name.clone())
                .or_insert_with(|| VolumeSpec {
                    name: name.clone(),
                    owner: String::new(),
                    users: BTreeSet::new(),
                });
        }
        if manifest.services.is_empty() {
            registry.networks.insert(DEFAULT_NETWORK.to_string());
        }

        Ok(registry)
    }

    /// Registry that skips validation, for exercising callers with broken graphs
    #[cfg(test)]
    pub(crate) fn unchecked(descriptors: Vec<ServiceDescriptor>) -> Self {
        let services: BTreeMap<String, ServiceDescriptor> = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Self {
            graph: DependencyGraph::from_descriptors(services.values()),
            services,
            start_order: Vec::new(),
            volumes: BTreeMap::new(),
            networks: BTreeSet::new(),
        }
    }

    /// Look up a service
    pub fn get(&self, name: &str) -> Result<&ServiceDescriptor> {
        self.services
            .get(name)
            .ok_or_else(|| HearthError::ServiceNotFound(name.to_string()))
    }

    /// Whether a service exists
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Service names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// All descriptors, sorted by name
    pub fn descriptors(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    /// Number of services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the stack has no services
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Dependency graph
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Start order computed at construction
    pub fn start_order(&self) -> &[String] {
        &self.start_order
    }

    /// Named volumes
    pub fn volumes(&self) -> impl Iterator<Item = &VolumeSpec> {
        self.volumes.values()
    }

    /// Look up a named volume
    pub fn volume(&self, name: &str) -> Option<&VolumeSpec> {
        self.volumes.get(name)
    }

    /// Networks referenced by any service
    pub fn networks(&self) -> impl Iterator<Item = &str> {
        self.networks.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Variables;
    use crate::manifest::{ManifestParser, PortBinding, VolumeBinding};

    #[test]
    fn test_registry_from_manifest() {
        let yaml = r#"
services:
  postgres:
    image: postgres:16
    volumes:
      - db_storage:/var/lib/postgresql/data
  n8n:
    image: n8nio/n8n
    depends_on: [postgres]
    volumes:
      - n8n_storage:/home/node/.n8n
volumes:
  db_storage:
  n8n_storage:
  spare:
"#;
        let parsed = ManifestParser::parse_str(yaml, &Variables::default()).unwrap();
        let registry =
            ServiceRegistry::from_manifest(&parsed.manifest, &HealthDefaults::default()).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.start_order(), ["postgres", "n8n"]);
        assert_eq!(registry.volume("db_storage").unwrap().owner, "postgres");
        assert_eq!(registry.volume("spare").unwrap().owner, "");
        assert_eq!(registry.networks().collect::<Vec<_>>(), vec![DEFAULT_NETWORK]);
        assert!(matches!(
            registry.get("redis"),
            Err(HearthError::ServiceNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = ServiceRegistry::new(vec![ServiceDescriptor::new("app", "app").depends_on("db")])
            .unwrap_err();
        assert!(err.to_string().contains("unknown service 'db'"));
    }

    #[test]
    fn test_duplicate_host_port_rejected() {
        let port = PortBinding::parse("8080:80").unwrap();
        let err = ServiceRegistry::new(vec![
            ServiceDescriptor::new("a", "nginx").port(port.clone()),
            ServiceDescriptor::new("b", "nginx").port(port),
        ])
        .unwrap_err();
        assert!(matches!(err, HearthError::InvalidConfig(_)));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = ServiceRegistry::new(vec![
            ServiceDescriptor::new("a", "x").depends_on("b"),
            ServiceDescriptor::new("b", "x").depends_on("a"),
        ])
        .unwrap_err();
        assert!(matches!(err, HearthError::CyclicDependency { .. }));
    }

    #[test]
    fn test_shared_volume_owned_by_first_in_start_order() {
        let data = VolumeBinding::parse("shared:/data").unwrap();
        let registry = ServiceRegistry::new(vec![
            ServiceDescriptor::new("reader", "x")
                .depends_on("writer")
                .volume(data.clone()),
            ServiceDescriptor::new("writer", "x").volume(data),
        ])
        .unwrap();
        let spec = registry.volume("shared").unwrap();
        assert_eq!(spec.owner, "writer");
        assert_eq!(spec.users.len(), 2);
    }
}
