//! A loaded project: settings, validated services and tunnel configuration

use crate::config::settings::VariableSource;
use crate::config::{SettingsLoader, StackSettings};
use crate::error::{HearthError, Result};
use crate::manifest::{parse_duration, HealthDefaults, ManifestParser, ServiceRegistry};
use crate::tunnel::{BackoffPolicy, TunnelConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const PROJECT_KEY: &str = "HEARTH_PROJECT";
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything resolved before any service is touched
#[derive(Debug, Clone)]
pub struct Project {
    pub dir: PathBuf,
    pub manifest_path: PathBuf,
    pub name: String,
    pub settings: StackSettings,
    pub registry: Arc<ServiceRegistry>,
    /// Present when the manifest declares routes
    pub tunnel: Option<TunnelConfig>,
    pub stop_timeout: Duration,
    pub warnings: Vec<String>,
}

impl Project {
    /// Resolve variables, parse the manifest and validate everything.
    ///
    /// Any error here happens before state is touched.
    pub fn load(dir: &Path, manifest: Option<&Path>, loader: SettingsLoader) -> Result<Self> {
        let mut vars = loader.load()?;

        let manifest_path = match manifest {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => dir.join(path),
            None => ManifestParser::find_manifest_file(dir).ok_or_else(|| {
                HearthError::ManifestParse(format!("no manifest found in {}", dir.display()))
            })?,
        };
        let parsed = ManifestParser::parse_file(&manifest_path, &vars)?;
        let manifest = parsed.manifest;

        // manifest `name:` beats the built-in project name, not an explicit one
        if let Some(name) = &manifest.name {
            if vars.source(PROJECT_KEY) == Some(VariableSource::Default) {
                vars.set(PROJECT_KEY.to_string(), name.clone(), VariableSource::Default);
            }
        }

        let require_tunnel = manifest
            .tunnel
            .as_ref()
            .map(|t| !t.routes.is_empty() && t.token.is_none())
            .unwrap_or(false);
        let settings = StackSettings::resolve(&vars, require_tunnel, &parsed.missing)?;
        validate_project_name(&settings.project_name)?;

        let supervisor = manifest.supervisor.as_ref();
        let mut defaults = HealthDefaults::default();
        if let Some(healthcheck) = supervisor.and_then(|s| s.healthcheck.as_ref()) {
            defaults = defaults.overlay(healthcheck)?;
        }
        let stop_timeout = match supervisor.and_then(|s| s.stop_timeout.as_deref()) {
            Some(raw) => parse_duration(raw)?,
            None => DEFAULT_STOP_TIMEOUT,
        };

        let registry = ServiceRegistry::from_manifest(&manifest, &defaults)?;
        if registry.is_empty() {
            return Err(HearthError::InvalidConfig(
                "manifest declares no services".to_string(),
            ));
        }

        let backoff = BackoffPolicy::from_section(supervisor)?;
        let tunnel = match &manifest.tunnel {
            Some(section) if !section.routes.is_empty() => Some(TunnelConfig::from_section(
                section,
                &registry,
                settings.tunnel_token.as_deref(),
                backoff,
            )?),
            _ => None,
        };

        let warnings = ManifestParser::warnings(&manifest);
        for warning in &warnings {
            tracing::warn!("{}", warning);
        }
        tracing::debug!(
            project = %settings.project_name,
            services = registry.len(),
            manifest = %manifest_path.display(),
            "Project loaded"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            manifest_path,
            name: settings.project_name.clone(),
            settings,
            registry: Arc::new(registry),
            tunnel,
            stop_timeout,
            warnings,
        })
    }

    /// Supervisor state directory
    pub fn data_dir(&self) -> &Path {
        &self.settings.data_dir
    }

    /// Backing directory for named volumes
    pub fn volumes_dir(&self) -> PathBuf {
        self.settings.data_dir.join("volumes")
    }
}

/// Container and network names derive from the project name
fn validate_project_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(HearthError::InvalidConfig(format!(
            "project name '{}' must be lowercase letters, digits, '-' or '_'",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelToken;
    use tempfile::tempdir;

    const MANIFEST: &str = r#"
name: lab
services:
  postgres:
    image: postgres:16
    environment:
      POSTGRES_PASSWORD: ${POSTGRES_PASSWORD}
    volumes:
      - db_data:/var/lib/postgresql/data
    healthcheck:
      test: ["CMD-SHELL", "pg_isready"]
  n8n:
    image: n8nio/n8n
    ports:
      - "5678:5678"
    depends_on:
      - postgres
volumes:
  db_data:
tunnel:
  routes:
    - hostname: n8n.example.com
      service: n8n
supervisor:
  stop_timeout: 20s
  healthcheck:
    start_period: 45s
"#;

    fn env(data_dir: &Path) -> Vec<(String, String)> {
        [
            ("POSTGRES_USER", "n8n"),
            ("POSTGRES_PASSWORD", "pw"),
            ("N8N_BASIC_AUTH_USER", "admin"),
            ("N8N_BASIC_AUTH_PASSWORD", "secret"),
            ("WEBUI_SECRET_KEY", "k"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .chain([(
            "HEARTH_DATA_DIR".to_string(),
            data_dir.display().to_string(),
        )])
        .collect()
    }

    #[test]
    fn test_load_project() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("hearth.yaml"), MANIFEST).unwrap();
        let mut vars = env(temp.path());
        vars.push((
            "TUNNEL_TOKEN".into(),
            crate::tunnel::config::test_token(),
        ));

        let loader = SettingsLoader::new(temp.path()).with_environment(vars);
        let project = Project::load(temp.path(), None, loader).unwrap();

        assert_eq!(project.name, "lab");
        assert_eq!(project.stop_timeout, Duration::from_secs(20));
        assert_eq!(project.registry.start_order(), ["postgres", "n8n"]);
        let check = project
            .registry
            .get("postgres")
            .unwrap()
            .healthcheck
            .clone()
            .unwrap();
        assert_eq!(check.start_period, Duration::from_secs(45));
        let tunnel = project.tunnel.unwrap();
        assert_eq!(
            tunnel.routes.get("n8n.example.com").unwrap().url,
            "http://127.0.0.1:5678"
        );
    }

    #[test]
    fn test_bundled_stack_loads() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("hearth.yaml"), include_str!("../../hearth.yaml")).unwrap();
        std::fs::write(temp.path().join(".env"), include_str!("../../.env.example")).unwrap();
        let loader = SettingsLoader::new(temp.path()).with_environment([(
            "HEARTH_DATA_DIR".to_string(),
            temp.path().join("data").display().to_string(),
        )]);

        let project = Project::load(temp.path(), None, loader).unwrap();
        assert_eq!(project.name, "hearth");
        assert_eq!(project.stop_timeout, Duration::from_secs(15));
        assert_eq!(project.registry.len(), 4);

        let tunnel = project.tunnel.unwrap();
        let route = tunnel.routes.get("n8n.example.com").unwrap();
        assert_eq!(route.service.as_deref(), Some("n8n"));
        assert_eq!(route.url, "http://127.0.0.1:5678");
        TunnelToken::parse(&tunnel.token).unwrap();
    }

    #[test]
    fn test_missing_keys_reported_together() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("hearth.yaml"), MANIFEST).unwrap();
        let loader = SettingsLoader::new(temp.path()).with_environment(Vec::<(String, String)>::new());

        let err = Project::load(temp.path(), None, loader).unwrap_err();
        match err {
            HearthError::MissingConfiguration { keys } => {
                assert!(keys.contains(&"POSTGRES_PASSWORD".to_string()));
                assert!(keys.contains(&"WEBUI_SECRET_KEY".to_string()));
                assert!(keys.contains(&"TUNNEL_TOKEN".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_manifest() {
        let temp = tempdir().unwrap();
        let loader = SettingsLoader::new(temp.path()).with_environment(env(temp.path()));
        let err = Project::load(temp.path(), None, loader).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_project_name_validation() {
        assert!(validate_project_name("hearth").is_ok());
        assert!(validate_project_name("my_stack-2").is_ok());
        assert!(validate_project_name("My Stack").is_err());
        assert!(validate_project_name("-x").is_err());
        assert!(validate_project_name("").is_err());
    }
}
