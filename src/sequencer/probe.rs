//! Health probes
//!
//! Each probe loop runs as its own task so a hung service never stalls the
//! coordinator.

use crate::manifest::{HealthCheck, Probe, ServiceDescriptor};
use crate::runtime::{ContainerRuntime, ContainerState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Poll interval for services that have no health check
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Result of waiting for a freshly started service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupOutcome {
    /// Probe passed
    Healthy,
    /// Start period elapsed without a passing probe
    TimedOut,
    /// Container exited before becoming healthy
    Exited(Option<i32>),
}

/// Change observed while watching a running service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    Recovered(String),
    Degraded { service: String, failures: u32 },
    Exited { service: String, code: Option<i32> },
}

/// Runs health checks against services
pub struct Prober {
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
}

impl Prober {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { runtime, http }
    }

    /// One probe attempt, bounded by the check's timeout
    pub async fn check(&self, service: &str, check: &HealthCheck) -> bool {
        match &check.probe {
            Probe::Command(argv) => {
                match timeout(check.timeout, self.runtime.exec(service, argv)).await {
                    Ok(Ok(code)) => code == 0,
                    Ok(Err(e)) => {
                        tracing::debug!(service, error = %e, "Probe command failed to run");
                        false
                    }
                    Err(_) => {
                        tracing::debug!(service, "Probe command timed out");
                        false
                    }
                }
            }
            Probe::Http { url } => match timeout(check.timeout, self.http.get(url).send()).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    status.is_success() || status.is_redirection()
                }
                Ok(Err(e)) => {
                    tracing::debug!(service, error = %e, "HTTP probe failed");
                    false
                }
                Err(_) => false,
            },
        }
    }

    /// Container state, with errors treated as still running
    async fn container_exit(&self, service: &str) -> Option<Option<i32>> {
        match self.runtime.inspect(service).await {
            Ok(ContainerState::Running) => None,
            Ok(ContainerState::Exited(code)) => Some(code),
            Ok(ContainerState::Missing) => Some(None),
            Err(e) => {
                tracing::debug!(service, error = %e, "Inspect failed");
                None
            }
        }
    }

    /// Probe immediately, then every interval, until the probe passes, the
    /// container exits, or the start period runs out
    pub async fn await_healthy(&self, descriptor: &ServiceDescriptor) -> StartupOutcome {
        let service = descriptor.name.as_str();
        let check = match &descriptor.healthcheck {
            Some(check) => check,
            None => {
                return match self.container_exit(service).await {
                    Some(code) => StartupOutcome::Exited(code),
                    None => StartupOutcome::Healthy,
                }
            }
        };

        let deadline = Instant::now() + check.start_period;
        let mut attempts = 0u32;
        loop {
            if let Some(code) = self.container_exit(service).await {
                return StartupOutcome::Exited(code);
            }

            attempts += 1;
            if self.check(service, check).await {
                tracing::debug!(service, attempts, "Probe passed");
                return StartupOutcome::Healthy;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(service, attempts, "Start period elapsed");
                return StartupOutcome::TimedOut;
            }
            sleep(check.interval.min(deadline - now)).await;
        }
    }

    /// Keep probing a running service and report state changes.
    ///
    /// `retries` consecutive failures mark it degraded; one success recovers it.
    pub async fn watch(
        self: Arc<Self>,
        descriptor: ServiceDescriptor,
        healthy: bool,
        events: mpsc::Sender<HealthEvent>,
        cancel: CancellationToken,
    ) {
        let service = descriptor.name.clone();
        let interval = descriptor
            .healthcheck
            .as_ref()
            .map(|c| c.interval)
            .unwrap_or(DEFAULT_WATCH_INTERVAL);
        let mut healthy = healthy;
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(interval) => {}
            }

            if let Some(code) = self.container_exit(&service).await {
                let _ = events.send(HealthEvent::Exited { service, code }).await;
                return;
            }

            let passed = match &descriptor.healthcheck {
                Some(check) => self.check(&service, check).await,
                None => true,
            };

            let event = if passed {
                failures = 0;
                if healthy {
                    None
                } else {
                    healthy = true;
                    Some(HealthEvent::Recovered(service.clone()))
                }
            } else {
                failures += 1;
                let retries = descriptor.healthcheck.as_ref().map(|c| c.retries).unwrap_or(1);
                if healthy && failures >= retries {
                    healthy = false;
                    Some(HealthEvent::Degraded {
                        service: service.clone(),
                        failures,
                    })
                } else {
                    None
                }
            };

            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}
