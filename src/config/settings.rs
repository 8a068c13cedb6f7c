//! Stack settings loading and validation

use crate::error::{HearthError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Project-level variables file
pub const ENV_FILE: &str = ".env";

/// Keys that must be non-empty before any service starts
pub const REQUIRED_KEYS: &[&str] = &[
    "POSTGRES_USER",
    "POSTGRES_PASSWORD",
    "POSTGRES_DB",
    "N8N_BASIC_AUTH_USER",
    "N8N_BASIC_AUTH_PASSWORD",
    "WEBUI_SECRET_KEY",
];

/// Required only when the manifest declares tunnel routes
pub const TUNNEL_TOKEN_KEY: &str = "TUNNEL_TOKEN";

const DEFAULTS: &[(&str, &str)] = &[
    ("HEARTH_PROJECT", "hearth"),
    ("POSTGRES_DB", "n8n"),
    ("GENERIC_TIMEZONE", "UTC"),
    ("N8N_PROTOCOL", "http"),
    ("N8N_HOST", "localhost"),
    ("N8N_PORT", "5678"),
    ("N8N_PROXY_HOPS", "0"),
];

/// Where a variable's value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableSource {
    /// Built-in default
    Default,
    /// Project `.env` file
    File,
    /// Process environment
    Environment,
}

/// Resolved variables with their origin
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: BTreeMap<String, (String, VariableSource)>,
}

impl Variables {
    /// Build from plain key/value pairs, all tagged as coming from the environment
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut vars = Self::default();
        for (k, v) in pairs {
            vars.set(k.into(), v.into(), VariableSource::Environment);
        }
        vars
    }

    /// Set a value, overriding any lower layer
    pub fn set(&mut self, key: String, value: String, source: VariableSource) {
        self.values.insert(key, (value, source));
    }

    /// Get a value; empty strings count as unset
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|(v, _)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Get a value even if it is empty
    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|(v, _)| v.as_str())
    }

    /// Origin of a value
    pub fn source(&self, key: &str) -> Option<VariableSource> {
        self.values.get(key).map(|(_, s)| *s)
    }

    /// Whether a key is set to a non-empty value
    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterate over all variables
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, (v, _))| (k.as_str(), v.as_str()))
    }
}

/// Loads [`Variables`] from defaults, the project file and the environment
pub struct SettingsLoader {
    project_dir: PathBuf,
    environment: Vec<(String, String)>,
}

impl SettingsLoader {
    /// Loader for a project directory using the process environment
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            environment: std::env::vars().collect(),
        }
    }

    /// Replace the environment layer
    pub fn with_environment<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Resolve all layers
    pub fn load(&self) -> Result<Variables> {
        let mut vars = Variables::default();

        for (key, value) in DEFAULTS {
            vars.set(key.to_string(), value.to_string(), VariableSource::Default);
        }

        let env_file = self.project_dir.join(ENV_FILE);
        if env_file.exists() {
            let iter = dotenvy::from_path_iter(&env_file).map_err(|e| {
                HearthError::InvalidConfig(format!("{}: {}", env_file.display(), e))
            })?;
            for item in iter {
                let (key, value) = item.map_err(|e| {
                    HearthError::InvalidConfig(format!("{}: {}", env_file.display(), e))
                })?;
                vars.set(key, value, VariableSource::File);
            }
            tracing::debug!(path = %env_file.display(), "Loaded project variables");
        }

        for (key, value) in &self.environment {
            vars.set(key.clone(), value.clone(), VariableSource::Environment);
        }

        Ok(vars)
    }
}

/// Database credentials
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSettings {
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub name: String,
}

/// Basic auth in front of the workflow platform
#[derive(Debug, Clone, Serialize)]
pub struct BasicAuthSettings {
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
}

/// Externally visible URL of the workflow platform
#[derive(Debug, Clone, Serialize)]
pub struct ExternalUrl {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub base_url: Option<String>,
    pub proxy_hops: u32,
}

impl ExternalUrl {
    /// Base URL used for webhooks and editor links
    pub fn url(&self) -> String {
        if let Some(base) = &self.base_url {
            return base.clone();
        }
        let default_port = matches!(
            (self.protocol.as_str(), self.port),
            ("http", 80) | ("https", 443)
        );
        if default_port {
            format!("{}://{}/", self.protocol, self.host)
        } else {
            format!("{}://{}:{}/", self.protocol, self.host, self.port)
        }
    }
}

/// Typed, validated stack settings
#[derive(Debug, Clone, Serialize)]
pub struct StackSettings {
    pub project_name: String,
    pub database: DatabaseSettings,
    pub basic_auth: BasicAuthSettings,
    #[serde(skip_serializing)]
    pub webui_secret_key: String,
    pub timezone: String,
    #[serde(skip_serializing)]
    pub tunnel_token: Option<String>,
    pub public_hostnames: Vec<String>,
    pub external_url: ExternalUrl,
    pub data_dir: PathBuf,
}

impl StackSettings {
    /// Validate and type the resolved variables.
    ///
    /// `extra_missing` carries keys the manifest referenced without a default;
    /// they are reported together with the built-in required keys.
    pub fn resolve(
        vars: &Variables,
        require_tunnel: bool,
        extra_missing: &BTreeSet<String>,
    ) -> Result<Self> {
        let mut missing: BTreeSet<String> = REQUIRED_KEYS
            .iter()
            .filter(|k| !vars.is_set(k))
            .map(|k| k.to_string())
            .collect();
        if require_tunnel && !vars.is_set(TUNNEL_TOKEN_KEY) {
            missing.insert(TUNNEL_TOKEN_KEY.to_string());
        }
        missing.extend(extra_missing.iter().cloned());

        if !missing.is_empty() {
            return Err(HearthError::MissingConfiguration {
                keys: missing.into_iter().collect(),
            });
        }

        let get = |key: &str| vars.get(key).unwrap_or_default().to_string();

        let port = parse_number::<u16>(vars, "N8N_PORT")?;
        let proxy_hops = parse_number::<u32>(vars, "N8N_PROXY_HOPS")?;

        let project_name = get("HEARTH_PROJECT");
        let data_dir = match vars.get("HEARTH_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("hearth")
                .join(&project_name),
        };

        let public_hostnames = vars
            .get("PUBLIC_HOSTNAMES")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            project_name,
            database: DatabaseSettings {
                user: get("POSTGRES_USER"),
                password: get("POSTGRES_PASSWORD"),
                name: get("POSTGRES_DB"),
            },
            basic_auth: BasicAuthSettings {
                user: get("N8N_BASIC_AUTH_USER"),
                password: get("N8N_BASIC_AUTH_PASSWORD"),
            },
            webui_secret_key: get("WEBUI_SECRET_KEY"),
            timezone: get("GENERIC_TIMEZONE"),
            tunnel_token: vars.get(TUNNEL_TOKEN_KEY).map(str::to_string),
            public_hostnames,
            external_url: ExternalUrl {
                protocol: get("N8N_PROTOCOL"),
                host: get("N8N_HOST"),
                port,
                base_url: vars.get("WEBHOOK_URL").map(str::to_string),
                proxy_hops,
            },
            data_dir,
        })
    }
}

fn parse_number<T: std::str::FromStr>(vars: &Variables, key: &str) -> Result<T> {
    let raw = vars.get(key).unwrap_or_default();
    raw.parse().map_err(|_| {
        HearthError::InvalidConfig(format!("{} must be a number, got '{}'", key, raw))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn complete_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("POSTGRES_USER", "n8n"),
            ("POSTGRES_PASSWORD", "pw"),
            ("POSTGRES_DB", "n8n"),
            ("N8N_BASIC_AUTH_USER", "admin"),
            ("N8N_BASIC_AUTH_PASSWORD", "secret"),
            ("WEBUI_SECRET_KEY", "k"),
            ("HEARTH_DATA_DIR", "/tmp/hearth-test"),
        ]
    }

    #[test]
    fn test_environment_overrides_file_overrides_defaults() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join(ENV_FILE),
            "GENERIC_TIMEZONE=Europe/Berlin\nN8N_HOST=file.example\n",
        )
        .unwrap();

        let vars = SettingsLoader::new(temp.path())
            .with_environment([("N8N_HOST", "env.example")])
            .load()
            .unwrap();

        assert_eq!(vars.get("N8N_PROTOCOL"), Some("http"));
        assert_eq!(vars.source("N8N_PROTOCOL"), Some(VariableSource::Default));
        assert_eq!(vars.get("GENERIC_TIMEZONE"), Some("Europe/Berlin"));
        assert_eq!(vars.source("GENERIC_TIMEZONE"), Some(VariableSource::File));
        assert_eq!(vars.get("N8N_HOST"), Some("env.example"));
        assert_eq!(vars.source("N8N_HOST"), Some(VariableSource::Environment));
    }

    #[test]
    fn test_missing_keys_reported_together() {
        let temp = tempdir().unwrap();
        let vars = SettingsLoader::new(temp.path())
            .with_environment([("POSTGRES_USER", "n8n"), ("POSTGRES_PASSWORD", "")])
            .load()
            .unwrap();

        let err = StackSettings::resolve(&vars, true, &BTreeSet::new()).unwrap_err();
        match err {
            HearthError::MissingConfiguration { keys } => {
                assert_eq!(
                    keys,
                    vec![
                        "N8N_BASIC_AUTH_PASSWORD",
                        "N8N_BASIC_AUTH_USER",
                        "POSTGRES_PASSWORD",
                        "TUNNEL_TOKEN",
                        "WEBUI_SECRET_KEY",
                    ]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_manifest_missing_keys_are_merged() {
        let vars = Variables::from_pairs(complete_env());
        let extra: BTreeSet<String> = ["OLLAMA_MODEL".to_string()].into_iter().collect();
        let err = StackSettings::resolve(&vars, false, &extra).unwrap_err();
        assert!(matches!(err, HearthError::MissingConfiguration { keys } if keys == vec!["OLLAMA_MODEL"]));
    }

    #[test]
    fn test_resolve_typed_settings() {
        let mut env = complete_env();
        env.push(("N8N_PORT", "5678"));
        env.push(("N8N_HOST", "localhost"));
        env.push(("N8N_PROTOCOL", "http"));
        env.push(("N8N_PROXY_HOPS", "1"));
        env.push(("HEARTH_PROJECT", "ai"));
        env.push(("PUBLIC_HOSTNAMES", "n8n.example.com, chat.example.com"));
        let vars = Variables::from_pairs(env);

        let settings = StackSettings::resolve(&vars, false, &BTreeSet::new()).unwrap();
        assert_eq!(settings.project_name, "ai");
        assert_eq!(settings.external_url.proxy_hops, 1);
        assert_eq!(settings.external_url.url(), "http://localhost:5678/");
        assert_eq!(
            settings.public_hostnames,
            vec!["n8n.example.com", "chat.example.com"]
        );
        assert_eq!(settings.data_dir, PathBuf::from("/tmp/hearth-test"));
    }

    #[test]
    fn test_invalid_port_rejected() {
        let mut env = complete_env();
        env.push(("N8N_PORT", "http"));
        env.push(("N8N_PROXY_HOPS", "0"));
        let vars = Variables::from_pairs(env);
        let err = StackSettings::resolve(&vars, false, &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, HearthError::InvalidConfig(_)));
    }
}
