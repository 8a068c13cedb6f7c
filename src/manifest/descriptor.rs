//! Typed service descriptors built from the manifest

use super::config::{
    CommandConfig, EnvironmentConfig, HealthcheckConfig, HealthcheckTest, NetworksConfig,
    PortConfig, ServiceConfig, VolumeMount,
};
use crate::error::{HearthError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Network every service joins when it names none
pub const DEFAULT_NETWORK: &str = "default";

const SECRET_MARKERS: &[&str] = &["PASSWORD", "SECRET", "TOKEN", "KEY", "CREDENTIAL"];
const REDACTED: &str = "********";

/// Whether an environment key holds a secret
pub fn is_secret_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SECRET_MARKERS.iter().any(|m| upper.contains(m))
}

/// Parse a duration like `500ms`, `30s`, `1m30s` or `2h`; a bare number is seconds
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(HearthError::InvalidConfig("empty duration".to_string()));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let invalid = || HearthError::InvalidConfig(format!("invalid duration '{}'", input));
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let secs = match unit {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return Err(invalid()),
        };
        let part = Duration::try_from_secs_f64(secs).map_err(|_| invalid())?;
        total = total.checked_add(part).ok_or_else(invalid)?;
    }
    Ok(total)
}

/// Transport protocol of a published port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Container port published on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host: u16,
    pub container: u16,
    pub protocol: Protocol,
}

impl PortBinding {
    /// Parse `[ip:]host:container[/proto]` or a bare `port`
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || HearthError::InvalidConfig(format!("invalid port mapping '{}'", spec));

        let (ports, protocol) = match spec.rsplit_once('/') {
            Some((p, "tcp")) => (p, Protocol::Tcp),
            Some((p, "udp")) => (p, Protocol::Udp),
            Some(_) => return Err(invalid()),
            None => (spec, Protocol::Tcp),
        };

        let parts: Vec<&str> = ports.split(':').collect();
        let port = |s: &str| s.trim().parse::<u16>().map_err(|_| invalid());
        let (host_ip, host, container) = match parts.as_slice() {
            [single] => (None, port(single)?, port(single)?),
            [host, container] => (None, port(host)?, port(container)?),
            [ip, host, container] => (Some(ip.to_string()), port(host)?, port(container)?),
            _ => return Err(invalid()),
        };

        Ok(Self {
            host_ip,
            host,
            container,
            protocol,
        })
    }
}

impl std::fmt::Display for PortBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{}:", ip)?;
        }
        write!(f, "{}:{}/{}", self.host, self.container, self.protocol)
    }
}

/// Where a mount's data lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeSource {
    /// Named, supervisor-managed volume
    Named(String),
    /// Host path bind mount
    Bind(PathBuf),
}

/// A mount inside a service container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeBinding {
    pub source: VolumeSource,
    pub target: String,
    pub read_only: bool,
}

impl VolumeBinding {
    /// Parse `source:target[:ro|rw]`; sources starting with `.`, `/` or `~` are bind mounts
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || HearthError::InvalidConfig(format!("invalid volume mount '{}'", spec));
        let parts: Vec<&str> = spec.split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            _ => return Err(invalid()),
        };
        if source.is_empty() || !target.starts_with('/') {
            return Err(invalid());
        }
        Ok(Self {
            source: volume_source(source),
            target: target.to_string(),
            read_only,
        })
    }

    /// Volume name if this is a named mount
    pub fn volume_name(&self) -> Option<&str> {
        match &self.source {
            VolumeSource::Named(name) => Some(name),
            VolumeSource::Bind(_) => None,
        }
    }
}

fn volume_source(source: &str) -> VolumeSource {
    if source.starts_with('.') || source.starts_with('/') || source.starts_with('~') {
        VolumeSource::Bind(PathBuf::from(source))
    } else {
        VolumeSource::Named(source.to_string())
    }
}

/// How readiness is tested
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Probe {
    /// Command run inside the container; exit 0 means healthy
    Command(Vec<String>),
    /// HTTP GET from the host; 2xx or 3xx means healthy
    Http { url: String },
}

/// Health check timing and probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub probe: Probe,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

/// Defaults for unspecified health check timings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthDefaults {
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

impl Default for HealthDefaults {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            retries: 3,
            start_period: Duration::from_secs(60),
        }
    }
}

impl HealthDefaults {
    /// Overlay the supervisor-level defaults from the manifest
    pub fn overlay(mut self, config: &HealthcheckConfig) -> Result<Self> {
        if let Some(v) = &config.interval {
            self.interval = parse_duration(v)?;
        }
        if let Some(v) = &config.timeout {
            self.timeout = parse_duration(v)?;
        }
        if let Some(v) = config.retries {
            self.retries = v;
        }
        if let Some(v) = &config.start_period {
            self.start_period = parse_duration(v)?;
        }
        Ok(self)
    }
}

impl HealthCheck {
    /// Build from manifest config; `None` if disabled or no probe given
    pub fn from_config(
        service: &str,
        config: &HealthcheckConfig,
        defaults: &HealthDefaults,
    ) -> Result<Option<Self>> {
        if config.disable == Some(true) {
            return Ok(None);
        }

        let probe = match (&config.test, &config.http) {
            (Some(_), Some(_)) => {
                return Err(HearthError::InvalidConfig(format!(
                    "service '{}' healthcheck sets both 'test' and 'http'",
                    service
                )))
            }
            (Some(test), None) => match command_probe(test) {
                Some(probe) => probe,
                None => return Ok(None),
            },
            (None, Some(url)) => {
                reqwest::Url::parse(url).map_err(|e| {
                    HearthError::InvalidConfig(format!(
                        "service '{}' healthcheck url '{}': {}",
                        service, url, e
                    ))
                })?;
                Probe::Http { url: url.clone() }
            }
            (None, None) => return Ok(None),
        };

        let timings = defaults.clone().overlay(config)?;
        if timings.interval.is_zero() {
            return Err(HearthError::InvalidConfig(format!(
                "service '{}' healthcheck interval must be positive",
                service
            )));
        }

        Ok(Some(Self {
            probe,
            interval: timings.interval,
            timeout: timings.timeout,
            retries: timings.retries.max(1),
            start_period: timings.start_period,
        }))
    }
}

/// `NONE` disables; `CMD` is exec form; `CMD-SHELL` and plain strings run under `sh -c`
fn command_probe(test: &HealthcheckTest) -> Option<Probe> {
    let argv = match test {
        HealthcheckTest::Command(cmd) => vec!["sh".to_string(), "-c".to_string(), cmd.clone()],
        HealthcheckTest::Array(arr) => match arr.split_first() {
            Some((head, _)) if head == "NONE" => return None,
            Some((head, rest)) if head == "CMD" => rest.to_vec(),
            Some((head, rest)) if head == "CMD-SHELL" => {
                vec!["sh".to_string(), "-c".to_string(), rest.join(" ")]
            }
            Some(_) => arr.clone(),
            None => return None,
        },
    };
    if argv.is_empty() {
        None
    } else {
        Some(Probe::Command(argv))
    }
}

/// Declarative description of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub ports: Vec<PortBinding>,
    pub volumes: Vec<VolumeBinding>,
    pub networks: Vec<String>,
    #[serde(serialize_with = "serialize_redacted")]
    pub environment: BTreeMap<String, String>,
    pub depends_on: BTreeSet<String>,
    pub healthcheck: Option<HealthCheck>,
    pub extra_hosts: Vec<String>,
    pub restart: Option<String>,
}

fn serialize_redacted<S: serde::Serializer>(
    env: &BTreeMap<String, String>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_map(redact(env))
}

fn redact(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let shown = if is_secret_key(k) && !v.is_empty() {
                REDACTED.to_string()
            } else {
                v.clone()
            };
            (k.clone(), shown)
        })
        .collect()
}

impl ServiceDescriptor {
    /// Minimal descriptor, mostly for tests and programmatic stacks
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            command: Vec::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
            networks: vec![DEFAULT_NETWORK.to_string()],
            environment: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            healthcheck: None,
            extra_hosts: Vec::new(),
            restart: None,
        }
    }

    /// Add a dependency
    pub fn depends_on(mut self, service: &str) -> Self {
        self.depends_on.insert(service.to_string());
        self
    }

    /// Set the health check
    pub fn healthcheck(mut self, check: HealthCheck) -> Self {
        self.healthcheck = Some(check);
        self
    }

    /// Add a port binding
    pub fn port(mut self, binding: PortBinding) -> Self {
        self.ports.push(binding);
        self
    }

    /// Add a volume mount
    pub fn volume(mut self, binding: VolumeBinding) -> Self {
        self.volumes.push(binding);
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    /// Environment with secret values masked, for logs and `hearth config`
    pub fn redacted_environment(&self) -> BTreeMap<String, String> {
        redact(&self.environment)
    }

    /// Build from the manifest's service block
    pub fn from_config(
        name: &str,
        service: &ServiceConfig,
        defaults: &HealthDefaults,
    ) -> Result<Self> {
        let image = service
            .image
            .clone()
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| {
                HearthError::InvalidConfig(format!("service '{}' must specify an image", name))
            })?;

        let mut descriptor = Self::new(name, &image);

        if let Some(cmd) = &service.command {
            descriptor.command = match cmd {
                CommandConfig::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
                CommandConfig::Exec(arr) => arr.clone(),
            };
        }

        if let Some(env) = &service.environment {
            match env {
                EnvironmentConfig::Array(arr) => {
                    for item in arr {
                        match item.split_once('=') {
                            Some((key, value)) => {
                                descriptor.environment.insert(key.to_string(), value.to_string());
                            }
                            None => {
                                descriptor.environment.insert(item.clone(), String::new());
                            }
                        }
                    }
                }
                EnvironmentConfig::Map(map) => {
                    for (key, value) in map {
                        let value = value.as_ref().map(|v| v.to_string()).unwrap_or_default();
                        descriptor.environment.insert(key.clone(), value);
                    }
                }
            }
        }

        for port in service.ports.iter().flatten() {
            let binding = match port {
                PortConfig::Short(spec) => PortBinding::parse(spec)?,
                PortConfig::Long(long) => PortBinding {
                    host_ip: long.host_ip.clone(),
                    host: long.published.unwrap_or(long.target),
                    container: long.target,
                    protocol: match long.protocol.as_deref() {
                        None | Some("tcp") => Protocol::Tcp,
                        Some("udp") => Protocol::Udp,
                        Some(other) => {
                            return Err(HearthError::InvalidConfig(format!(
                                "service '{}' port protocol '{}' is not tcp or udp",
                                name, other
                            )))
                        }
                    },
                },
            };
            descriptor.ports.push(binding);
        }

        for mount in service.volumes.iter().flatten() {
            let binding = match mount {
                VolumeMount::Short(spec) => VolumeBinding::parse(spec)?,
                VolumeMount::Long(long) => VolumeBinding {
                    source: match long.mount_type.as_deref() {
                        Some("bind") => VolumeSource::Bind(PathBuf::from(&long.source)),
                        Some("volume") => VolumeSource::Named(long.source.clone()),
                        _ => volume_source(&long.source),
                    },
                    target: long.target.clone(),
                    read_only: long.read_only.unwrap_or(false),
                },
            };
            descriptor.volumes.push(binding);
        }

        if let Some(networks) = &service.networks {
            descriptor.networks = match networks {
                NetworksConfig::Array(arr) => arr.clone(),
                NetworksConfig::Map(map) => map.keys().cloned().collect(),
            };
        }

        if let Some(depends) = &service.depends_on {
            descriptor.depends_on = depends.names().into_iter().collect();
        }

        if let Some(check) = &service.healthcheck {
            descriptor.healthcheck = HealthCheck::from_config(name, check, defaults)?;
        }

        descriptor.extra_hosts = service.extra_hosts.clone().unwrap_or_default();
        descriptor.restart = service.restart.clone();

        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_parse_duration_out_of_range() {
        for input in [
            "99999999999999999999999h",
            "18446744073709550000s18446744073709550000s",
        ] {
            assert!(
                matches!(parse_duration(input), Err(HearthError::InvalidConfig(_))),
                "{input}"
            );
        }
    }

    #[test]
    fn test_parse_ports() {
        let p = PortBinding::parse("5678:5678").unwrap();
        assert_eq!((p.host, p.container, p.protocol), (5678, 5678, Protocol::Tcp));

        let p = PortBinding::parse("127.0.0.1:3000:8080/tcp").unwrap();
        assert_eq!(p.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!((p.host, p.container), (3000, 8080));

        let p = PortBinding::parse("53/udp").unwrap();
        assert_eq!((p.host, p.container, p.protocol), (53, 53, Protocol::Udp));

        assert!(PortBinding::parse("abc:80").is_err());
        assert!(PortBinding::parse("80:80/sctp").is_err());
    }

    #[test]
    fn test_parse_volumes() {
        let v = VolumeBinding::parse("db_storage:/var/lib/postgresql/data").unwrap();
        assert_eq!(v.volume_name(), Some("db_storage"));
        assert!(!v.read_only);

        let v = VolumeBinding::parse("./init.sql:/docker-entrypoint-initdb.d/init.sql:ro").unwrap();
        assert_eq!(v.source, VolumeSource::Bind(PathBuf::from("./init.sql")));
        assert!(v.read_only);

        assert!(VolumeBinding::parse("data").is_err());
        assert!(VolumeBinding::parse("data:relative").is_err());
    }

    #[test]
    fn test_healthcheck_forms() {
        let defaults = HealthDefaults::default();

        let config = HealthcheckConfig {
            test: Some(HealthcheckTest::Array(vec![
                "CMD-SHELL".into(),
                "pg_isready".into(),
                "-U".into(),
                "n8n".into(),
            ])),
            interval: Some("2s".into()),
            start_period: Some("30s".into()),
            ..Default::default()
        };
        let check = HealthCheck::from_config("db", &config, &defaults).unwrap().unwrap();
        assert_eq!(
            check.probe,
            Probe::Command(vec!["sh".into(), "-c".into(), "pg_isready -U n8n".into()])
        );
        assert_eq!(check.interval, Duration::from_secs(2));
        assert_eq!(check.timeout, defaults.timeout);
        assert_eq!(check.start_period, Duration::from_secs(30));

        let config = HealthcheckConfig {
            http: Some("http://localhost:5678/healthz".into()),
            ..Default::default()
        };
        let check = HealthCheck::from_config("n8n", &config, &defaults).unwrap().unwrap();
        assert!(matches!(check.probe, Probe::Http { .. }));

        let config = HealthcheckConfig {
            test: Some(HealthcheckTest::Array(vec!["NONE".into()])),
            ..Default::default()
        };
        assert!(HealthCheck::from_config("x", &config, &defaults).unwrap().is_none());

        let config = HealthcheckConfig {
            http: Some("not a url".into()),
            ..Default::default()
        };
        assert!(HealthCheck::from_config("x", &config, &defaults).is_err());
    }

    #[test]
    fn test_secrets_redacted() {
        let d = ServiceDescriptor::new("db", "postgres:16")
            .env("POSTGRES_USER", "n8n")
            .env("POSTGRES_PASSWORD", "hunter2")
            .env("WEBUI_SECRET_KEY", "abc");
        let env = d.redacted_environment();
        assert_eq!(env["POSTGRES_USER"], "n8n");
        assert_eq!(env["POSTGRES_PASSWORD"], REDACTED);
        assert_eq!(env["WEBUI_SECRET_KEY"], REDACTED);

        let json = serde_json::to_string(&d).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_from_config_requires_image() {
        let err = ServiceDescriptor::from_config("x", &ServiceConfig::default(), &HealthDefaults::default());
        assert!(err.is_err());
    }
}
