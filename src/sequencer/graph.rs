//! Service dependency graph

use crate::error::{HearthError, Result};
use crate::manifest::ServiceDescriptor;
use std::collections::{BTreeMap, BTreeSet};

/// Directed graph of `service -> dependency` edges
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph over a set of descriptors
    pub fn from_descriptors<'a, I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = &'a ServiceDescriptor>,
    {
        let mut graph = Self::new();
        for descriptor in descriptors {
            graph.add_service(&descriptor.name);
            for dep in &descriptor.depends_on {
                graph.add_edge(&descriptor.name, dep);
            }
        }
        graph
    }

    /// Add a node
    pub fn add_service(&mut self, service: &str) {
        self.dependencies.entry(service.to_string()).or_default();
        self.dependents.entry(service.to_string()).or_default();
    }

    /// `service` depends on `dependency`
    pub fn add_edge(&mut self, service: &str, dependency: &str) {
        self.add_service(service);
        self.add_service(dependency);
        self.dependencies
            .entry(service.to_string())
            .or_default()
            .insert(dependency.to_string());
        self.dependents
            .entry(dependency.to_string())
            .or_default()
            .insert(service.to_string());
    }

    /// Whether the graph knows a service
    pub fn contains(&self, service: &str) -> bool {
        self.dependencies.contains_key(service)
    }

    /// All services, sorted by name
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    /// Direct dependencies of a service
    pub fn dependencies(&self, service: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(service)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Direct dependents of a service
    pub fn dependents(&self, service: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(service)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Every service that directly or indirectly depends on `service`
    pub fn transitive_dependents(&self, service: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependents(service).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.to_string()) {
                stack.extend(self.dependents(next));
            }
        }
        seen
    }

    /// Start order: every service after all of its dependencies.
    ///
    /// Ties are broken by name so the order is stable across runs.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut order = Vec::with_capacity(self.dependencies.len());
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();

        for service in self.dependencies.keys() {
            self.visit(service, &mut visited, &mut path, &mut order)?;
        }

        Ok(order)
    }

    /// Depth-first post-order walk; `path` is the current chain, used to report cycles
    fn visit(
        &self,
        service: &str,
        visited: &mut BTreeSet<String>,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if visited.contains(service) {
            return Ok(());
        }

        if let Some(pos) = path.iter().position(|s| s == service) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(service.to_string());
            return Err(HearthError::CyclicDependency { cycle });
        }

        path.push(service.to_string());
        for dep in self.dependencies(service) {
            self.visit(dep, visited, path, order)?;
        }
        path.pop();

        visited.insert(service.to_string());
        order.push(service.to_string());

        Ok(())
    }
}
