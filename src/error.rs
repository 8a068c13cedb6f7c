//! Error types for Hearth

use thiserror::Error;

/// Result type for Hearth operations
pub type Result<T> = std::result::Result<T, HearthError>;

/// A single service that did not come up during `start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    /// Service name
    pub service: String,
    /// Failure kind
    pub kind: FailureKind,
    /// Human readable detail
    pub detail: String,
    /// Host port that was taken, for port conflicts
    pub port: Option<u16>,
}

impl ServiceFailure {
    /// Record an error that kept a service from starting
    pub fn from_error(service: &str, error: &HearthError) -> Self {
        let (kind, port) = match error {
            HearthError::PortConflict { port, .. } => (FailureKind::PortConflict, Some(*port)),
            HearthError::HealthCheckTimeout { .. } => (FailureKind::HealthCheckTimeout, None),
            _ => (FailureKind::Runtime, None),
        };
        let detail = match error {
            HearthError::Runtime { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            service: service.to_string(),
            kind,
            detail,
            port,
        }
    }

    /// The error for a single service operation such as `restart`
    pub fn into_error(self) -> HearthError {
        match (self.kind, self.port) {
            (FailureKind::PortConflict, Some(port)) => HearthError::PortConflict {
                service: self.service,
                port,
            },
            _ => HearthError::Runtime {
                service: self.service,
                message: self.detail,
            },
        }
    }
}

/// Why a service failed to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Health check never passed within the start period
    HealthCheckTimeout,
    /// A published host port was already taken
    PortConflict,
    /// The container runtime refused to start the service or it exited
    Runtime,
}

impl std::fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.service, self.detail)
    }
}

/// Hearth error types
#[derive(Error, Debug)]
pub enum HearthError {
    #[error("Missing configuration: {}", keys.join(", "))]
    MissingConfiguration { keys: Vec<String> },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Health check for service {service} did not pass within {start_period_secs}s")]
    HealthCheckTimeout {
        service: String,
        start_period_secs: u64,
    },

    #[error("Port {port} needed by service {service} is already in use")]
    PortConflict { service: String, port: u16 },

    #[error("Startup failed: {}; blocked: [{}]", format_failures(failures), blocked.join(", "))]
    StartupFailed {
        failures: Vec<ServiceFailure>,
        blocked: Vec<String>,
    },

    #[error("Service {service} cannot restart: dependency {dependency} is not healthy")]
    DependencyNotReady { service: String, dependency: String },

    #[error("Tunnel authentication failed: {0}")]
    TunnelAuth(String),

    #[error("Tunnel connection error: {0}")]
    TunnelTransient(String),

    #[error("Runtime error for service {service}: {message}")]
    Runtime { service: String, message: String },

    #[error("Volume error: {0}")]
    Volume(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_failures(failures: &[ServiceFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl HearthError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            HearthError::MissingConfiguration { .. }
            | HearthError::InvalidConfig(_)
            | HearthError::ManifestParse(_)
            | HearthError::Yaml(_) => 2,
            HearthError::CyclicDependency { .. } => 3,
            HearthError::HealthCheckTimeout { .. } => 4,
            HearthError::TunnelAuth(_) => 5,
            HearthError::TunnelTransient(_) => 6,
            HearthError::PortConflict { .. } => 7,
            HearthError::StartupFailed { failures, .. } => match failures.first().map(|f| f.kind) {
                Some(FailureKind::HealthCheckTimeout) => 4,
                Some(FailureKind::PortConflict) => 7,
                _ => 8,
            },
            HearthError::ServiceNotFound(_) | HearthError::DependencyNotReady { .. } => 9,
            HearthError::Runtime { .. } => 8,
            HearthError::Volume(_) | HearthError::VolumeNotFound(_) => 10,
            HearthError::Interrupted => 130,
            HearthError::Io(_)
            | HearthError::Json(_)
            | HearthError::Lock(_)
            | HearthError::Internal(_) => 1,
        }
    }

    /// Remediation hint shown next to the error
    pub fn hint(&self) -> Option<String> {
        match self {
            HearthError::MissingConfiguration { keys } => Some(format!(
                "set {} in the project .env file or the environment",
                keys.join(", ")
            )),
            HearthError::InvalidConfig(_) | HearthError::ManifestParse(_) | HearthError::Yaml(_) => {
                Some("run `hearth config` to validate the manifest".to_string())
            }
            HearthError::CyclicDependency { cycle } => Some(format!(
                "remove one of the depends_on edges between {}",
                cycle.join(", ")
            )),
            HearthError::HealthCheckTimeout { service, .. } => Some(format!(
                "check `hearth logs {}` or raise its healthcheck start_period",
                service
            )),
            HearthError::PortConflict { port, .. } => Some(format!(
                "free host port {} or change the published port in the manifest",
                port
            )),
            HearthError::StartupFailed { failures, .. } => failures
                .first()
                .map(|f| format!("inspect `hearth logs {}` and fix it first", f.service)),
            HearthError::DependencyNotReady { dependency, .. } => {
                Some(format!("start {} first with `hearth start`", dependency))
            }
            HearthError::TunnelAuth(_) => {
                Some("check TUNNEL_TOKEN; retrying will not fix an invalid token".to_string())
            }
            HearthError::TunnelTransient(_) => {
                Some("check network connectivity; the tunnel retries automatically".to_string())
            }
            HearthError::ServiceNotFound(_) => {
                Some("run `hearth status` to list known services".to_string())
            }
            HearthError::Volume(_) => {
                Some("stop the owning service with `hearth stop` first".to_string())
            }
            HearthError::VolumeNotFound(_) => {
                Some("run `hearth volume ls` to list volumes".to_string())
            }
            _ => None,
        }
    }

    /// What the CLI prints on failure: the error, the service it concerns and
    /// a hint, one per line
    pub fn report(&self) -> String {
        let mut report = format!("Error: {}", self);
        if let Some(service) = self.service() {
            report.push_str(&format!("\nService: {}", service));
        }
        if let Some(hint) = self.hint() {
            report.push_str(&format!("\nHint: {}", hint));
        }
        report
    }

    /// Service the error is scoped to, if any
    pub fn service(&self) -> Option<&str> {
        match self {
            HearthError::HealthCheckTimeout { service, .. }
            | HearthError::PortConflict { service, .. }
            | HearthError::DependencyNotReady { service, .. }
            | HearthError::Runtime { service, .. } => Some(service),
            HearthError::ServiceNotFound(name) => Some(name),
            HearthError::StartupFailed { failures, .. } => failures.first().map(|f| f.service.as_str()),
            _ => None,
        }
    }
}
