//! Stack manifest parser

use super::config::ManifestFile;
use crate::config::{Interpolator, Variables};
use crate::error::{HearthError, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Default manifest file names
pub const DEFAULT_MANIFEST_FILES: &[&str] = &["hearth.yaml", "hearth.yml", "stack.yaml", "stack.yml"];

/// A parsed manifest plus the variables it needed but could not resolve
#[derive(Debug, Clone)]
pub struct ParsedManifest {
    pub manifest: ManifestFile,
    pub missing: BTreeSet<String>,
}

/// Manifest file parser
pub struct ManifestParser;

impl ManifestParser {
    /// Find manifest file in directory
    pub fn find_manifest_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_MANIFEST_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse manifest file from path
    pub fn parse_file(path: &Path, vars: &Variables) -> Result<ParsedManifest> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HearthError::ManifestParse(format!("failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_str(&content, vars)
    }

    /// Parse manifest from string, interpolating `${VAR}` references
    pub fn parse_str(content: &str, vars: &Variables) -> Result<ParsedManifest> {
        let mut document: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|e| HearthError::ManifestParse(format!("failed to parse YAML: {}", e)))?;

        let mut interpolator = Interpolator::new(vars);
        interpolator.interpolate_value(&mut document);
        let missing = interpolator.into_missing();

        let manifest: ManifestFile = serde_yaml::from_value(document)
            .map_err(|e| HearthError::ManifestParse(e.to_string()))?;

        Ok(ParsedManifest { manifest, missing })
    }

    /// Non-fatal findings worth showing to the operator
    pub fn warnings(manifest: &ManifestFile) -> Vec<String> {
        let mut warnings = Vec::new();

        for (name, service) in &manifest.services {
            if let Some(networks) = &service.networks {
                let nets = match networks {
                    super::config::NetworksConfig::Array(arr) => arr.clone(),
                    super::config::NetworksConfig::Map(map) => map.keys().cloned().collect(),
                };
                for net in nets {
                    if net != super::descriptor::DEFAULT_NETWORK && !manifest.networks.contains_key(&net) {
                        warnings.push(format!(
                            "Service '{}' references undefined network '{}' (will be created)",
                            name, net
                        ));
                    }
                }
            }

            if let Some(volumes) = &service.volumes {
                for vol in volumes {
                    let source = match vol {
                        super::config::VolumeMount::Short(spec) => spec.split(':').next().map(str::to_string),
                        super::config::VolumeMount::Long(long) => Some(long.source.clone()),
                    };
                    if let Some(source) = source {
                        let named = !(source.starts_with('.') || source.starts_with('/') || source.starts_with('~'));
                        if named && !manifest.volumes.contains_key(&source) {
                            warnings.push(format!(
                                "Service '{}' references undeclared volume '{}' (will be created)",
                                name, source
                            ));
                        }
                    }
                }
            }

            if service.healthcheck.is_none() {
                let depended_on = manifest.services.values().any(|other| {
                    other
                        .depends_on
                        .as_ref()
                        .map(|d| d.names().iter().any(|n| n == name))
                        .unwrap_or(false)
                });
                if depended_on {
                    warnings.push(format!(
                        "Service '{}' has dependents but no healthcheck; it counts as healthy once running",
                        name
                    ));
                }
            }
        }

        warnings
    }
}
