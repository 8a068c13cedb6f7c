//! The coordinating task: owns the state table and drives startup,
//! monitoring and teardown

use super::graph::DependencyGraph;
use super::probe::{HealthEvent, Prober, StartupOutcome};
use super::state::{RuntimeState, StackSnapshot, StateTable, Transition};
use crate::error::{FailureKind, HearthError, Result, ServiceFailure};
use crate::manifest::{ServiceDescriptor, ServiceRegistry, VolumeSource};
use crate::runtime::{network_name, ContainerRuntime, ContainerSpec, ContainerState, Mount};
use crate::storage::VolumeManager;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Per-project settings for the sequencer
#[derive(Debug, Clone)]
pub struct SequencerOptions {
    /// Project name, used for container and network names
    pub project: String,
    /// Directory relative bind mounts resolve against
    pub project_dir: PathBuf,
    /// Grace period given to containers on stop
    pub stop_timeout: Duration,
}

/// Health-gated startup and ordered teardown of a stack
pub struct Sequencer {
    registry: Arc<ServiceRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    volumes: Arc<VolumeManager>,
    prober: Arc<Prober>,
    table: StateTable,
    snapshots: watch::Sender<StackSnapshot>,
    options: SequencerOptions,
}

impl Sequencer {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        volumes: Arc<VolumeManager>,
        options: SequencerOptions,
    ) -> Self {
        let table = StateTable::new(&options.project, registry.names());
        Self::with_table(registry, runtime, volumes, options, table)
    }

    /// Resume from a persisted snapshot
    pub fn restore(
        registry: Arc<ServiceRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        volumes: Arc<VolumeManager>,
        options: SequencerOptions,
        snapshot: StackSnapshot,
    ) -> Self {
        let table = StateTable::restore(snapshot, registry.names());
        Self::with_table(registry, runtime, volumes, options, table)
    }

    fn with_table(
        registry: Arc<ServiceRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        volumes: Arc<VolumeManager>,
        options: SequencerOptions,
        table: StateTable,
    ) -> Self {
        let (snapshots, _) = watch::channel(table.snapshot());
        Self {
            prober: Arc::new(Prober::new(runtime.clone())),
            registry,
            runtime,
            volumes,
            table,
            snapshots,
            options,
        }
    }

    /// Receive every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<StackSnapshot> {
        self.snapshots.subscribe()
    }

    /// Current state of every service
    pub fn snapshot(&self) -> StackSnapshot {
        self.table.snapshot()
    }

    /// Transitions applied so far
    pub fn transitions(&self) -> &[Transition] {
        self.table.history()
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.table.snapshot());
    }

    fn set_state(&mut self, service: &str, to: RuntimeState, error: Option<String>) {
        if let Err(e) = self.table.transition(service, to, error) {
            tracing::error!(service, error = %e, "Rejected state change");
        }
        self.publish();
    }

    fn dependencies_healthy(&self, service: &str) -> bool {
        self.registry
            .graph()
            .dependencies(service)
            .all(|dep| self.table.state(dep) == RuntimeState::Healthy)
    }

    /// Bring every service up, each one only after its dependencies are Healthy.
    ///
    /// Healthy services are left alone, so calling this twice is a no-op.
    /// A service that fails blocks its dependents, which stay Pending; all
    /// failures are reported together once nothing else can make progress.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        let order = self.registry.graph().topological_order()?;

        if !order.iter().any(|s| self.table.state(s).is_running()) {
            self.table.set_run_id(uuid::Uuid::new_v4().to_string());
        }

        for name in &order {
            if matches!(
                self.table.state(name),
                RuntimeState::Stopped | RuntimeState::Failed
            ) {
                self.set_state(name, RuntimeState::Pending, None);
            }
        }

        tracing::info!(
            project = %self.options.project,
            services = order.len(),
            "Starting stack"
        );

        let launcher = self.launcher();
        let mut launches: JoinSet<(String, Launch)> = JoinSet::new();
        let mut failures: Vec<ServiceFailure> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return self.interrupt(&mut launches).await;
            }

            let ready: Vec<String> = order
                .iter()
                .filter(|s| {
                    self.table.state(s) == RuntimeState::Pending && self.dependencies_healthy(s)
                })
                .cloned()
                .collect();

            for name in ready {
                match self.begin_launch(&name).await {
                    Ok(descriptor) => {
                        launches.spawn(launcher.clone().run(descriptor));
                    }
                    Err(failure) => failures.push(failure),
                }
            }

            if launches.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.interrupt(&mut launches).await;
                }
                joined = launches.join_next() => {
                    match joined {
                        Some(Ok((name, launch))) => {
                            if let Some(failure) = self.settle(&name, launch) {
                                failures.push(failure);
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Launch task ended unexpectedly");
                        }
                        None => {}
                    }
                }
            }
        }

        for name in self.table.in_state(RuntimeState::Starting) {
            self.set_state(&name, RuntimeState::Failed, Some("launch task ended".to_string()));
            failures.push(ServiceFailure {
                service: name,
                kind: FailureKind::Runtime,
                detail: "launch task ended unexpectedly".to_string(),
                port: None,
            });
        }

        let blocked: Vec<String> = order
            .iter()
            .filter(|s| self.table.state(s) == RuntimeState::Pending)
            .cloned()
            .collect();

        if failures.is_empty() && !blocked.is_empty() {
            // nothing failed this run, so the blockers are services left Unhealthy earlier
            for name in self.table.in_state(RuntimeState::Unhealthy) {
                failures.push(ServiceFailure {
                    service: name,
                    kind: FailureKind::Runtime,
                    detail: "unhealthy".to_string(),
                    port: None,
                });
            }
        }

        if failures.is_empty() {
            tracing::info!(project = %self.options.project, "Stack is healthy");
            return Ok(());
        }

        for failure in &failures {
            let behind: Vec<String> = self
                .registry
                .graph()
                .transitive_dependents(&failure.service)
                .into_iter()
                .filter(|s| blocked.contains(s))
                .collect();
            tracing::error!(
                service = %failure.service,
                detail = %failure.detail,
                blocked = %behind.join(", "),
                "Service failed to start"
            );
        }
        Err(HearthError::StartupFailed { failures, blocked })
    }

    /// Apply a launch result; returns the failure to report, if any
    fn settle(&mut self, name: &str, launch: Launch) -> Option<ServiceFailure> {
        if self.table.state(name) != RuntimeState::Starting {
            return None;
        }

        let outcome = match launch {
            Launch::Refused(e) => {
                let failure = ServiceFailure::from_error(name, &e);
                self.set_state(name, RuntimeState::Failed, Some(failure.detail.clone()));
                return Some(failure);
            }
            Launch::Probed(outcome) => outcome,
        };

        match outcome {
            StartupOutcome::Healthy => {
                tracing::info!(service = name, "Service is healthy");
                self.set_state(name, RuntimeState::Healthy, None);
                None
            }
            StartupOutcome::TimedOut => {
                let start_period = self
                    .registry
                    .get(name)
                    .ok()
                    .and_then(|d| d.healthcheck.as_ref())
                    .map(|c| c.start_period.as_secs())
                    .unwrap_or_default();
                let detail = format!("no passing health check within {}s", start_period);
                self.set_state(name, RuntimeState::Failed, Some(detail.clone()));
                Some(ServiceFailure {
                    service: name.to_string(),
                    kind: FailureKind::HealthCheckTimeout,
                    detail,
                    port: None,
                })
            }
            StartupOutcome::Exited(code) => {
                let detail = match code {
                    Some(code) => format!("container exited with code {}", code),
                    None => "container is gone".to_string(),
                };
                self.set_state(name, RuntimeState::Failed, Some(detail.clone()));
                Some(ServiceFailure {
                    service: name.to_string(),
                    kind: FailureKind::Runtime,
                    detail,
                    port: None,
                })
            }
        }
    }

    /// Abort in-flight launches and stop everything still Starting
    async fn interrupt(&mut self, launches: &mut JoinSet<(String, Launch)>) -> Result<()> {
        launches.abort_all();
        while launches.join_next().await.is_some() {}

        for name in self.table.in_state(RuntimeState::Starting) {
            if let Err(e) = self.runtime.stop(&name, self.options.stop_timeout).await {
                tracing::warn!(service = %name, error = %e, "Failed to stop interrupted service");
            }
            self.set_state(&name, RuntimeState::Stopped, None);
        }
        tracing::warn!("Startup interrupted");
        Err(HearthError::Interrupted)
    }

    fn launcher(&self) -> Launcher {
        Launcher {
            registry: self.registry.clone(),
            runtime: self.runtime.clone(),
            volumes: self.volumes.clone(),
            prober: self.prober.clone(),
            project: self.options.project.clone(),
            project_dir: self.options.project_dir.clone(),
            run_id: self.table.run_id().unwrap_or_default().to_string(),
        }
    }

    /// Pending -> Starting and the service's networks; the container itself
    /// is created by the launch task so a slow pull holds up nobody else
    async fn begin_launch(&mut self, name: &str) -> std::result::Result<ServiceDescriptor, ServiceFailure> {
        let descriptor = self
            .registry
            .get(name)
            .cloned()
            .map_err(|e| ServiceFailure::from_error(name, &e))?;

        self.set_state(name, RuntimeState::Starting, None);
        tracing::info!(service = name, image = %descriptor.image, "Starting service");
        tracing::debug!(service = name, env = ?descriptor.redacted_environment(), "Service environment");

        for network in &descriptor.networks {
            let network = network_name(&self.options.project, network);
            if let Err(e) = self.runtime.ensure_network(&network).await {
                let failure = ServiceFailure::from_error(name, &e);
                self.set_state(name, RuntimeState::Failed, Some(failure.detail.clone()));
                return Err(failure);
            }
        }
        Ok(descriptor)
    }

    /// Watch running services until cancelled, applying health changes
    pub async fn monitor(&mut self, cancel: &CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(64);
        let watchers = cancel.child_token();
        let mut tasks = JoinSet::new();

        for name in self.registry.start_order() {
            let state = self.table.state(name);
            if !matches!(state, RuntimeState::Healthy | RuntimeState::Unhealthy) {
                continue;
            }
            let descriptor = self.registry.get(name)?.clone();
            tasks.spawn(self.prober.clone().watch(
                descriptor,
                state == RuntimeState::Healthy,
                tx.clone(),
                watchers.clone(),
            ));
        }
        drop(tx);
        tracing::info!(services = tasks.len(), "Monitoring service health");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.apply_health_event(event),
                    None => {
                        // every watcher has finished; idle until cancelled
                        cancel.cancelled().await;
                        break;
                    }
                }
            }
        }

        watchers.cancel();
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    fn apply_health_event(&mut self, event: HealthEvent) {
        match event {
            HealthEvent::Degraded { service, failures } => {
                if self.table.state(&service) == RuntimeState::Healthy {
                    tracing::warn!(service = %service, failures, "Service became unhealthy");
                    self.set_state(
                        &service,
                        RuntimeState::Unhealthy,
                        Some(format!("{} consecutive failed probes", failures)),
                    );
                }
            }
            HealthEvent::Recovered(service) => {
                if self.table.state(&service) == RuntimeState::Unhealthy {
                    tracing::info!(service = %service, "Service recovered");
                    self.set_state(&service, RuntimeState::Healthy, None);
                }
            }
            HealthEvent::Exited { service, code } => {
                if self.table.state(&service).is_running() {
                    tracing::error!(service = %service, code = ?code, "Service exited");
                    let detail = match code {
                        Some(code) => format!("container exited with code {}", code),
                        None => "container is gone".to_string(),
                    };
                    self.set_state(&service, RuntimeState::Failed, Some(detail));
                }
            }
        }
    }

    /// Order services will be stopped in
    pub fn stop_order(&self) -> Vec<String> {
        dependents_first(
            self.table.stop_order(self.registry.start_order()),
            self.registry.graph(),
        )
    }

    /// Stop services, dependents before their dependencies.
    ///
    /// Already stopped services are skipped; every service is attempted even
    /// if one fails to stop.
    pub async fn stop(&mut self) -> Result<()> {
        let order = self.stop_order();
        if order.is_empty() {
            tracing::info!(project = %self.options.project, "Stack already stopped");
            return Ok(());
        }

        let mut first_error = None;
        for name in order {
            let state = self.table.state(&name);
            if state != RuntimeState::Pending {
                tracing::info!(service = %name, "Stopping service");
                if let Err(e) = self.runtime.stop(&name, self.options.stop_timeout).await {
                    tracing::error!(service = %name, error = %e, "Failed to stop service");
                    first_error.get_or_insert(e);
                    continue;
                }
            }
            self.set_state(&name, RuntimeState::Stopped, None);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Restart one service after checking its dependencies are still Healthy
    pub async fn restart(&mut self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let descriptor = self.registry.get(name)?.clone();
        for dep in &descriptor.depends_on {
            if self.table.state(dep) != RuntimeState::Healthy {
                return Err(HearthError::DependencyNotReady {
                    service: name.to_string(),
                    dependency: dep.clone(),
                });
            }
        }

        let state = self.table.state(name);
        if state != RuntimeState::Stopped && state != RuntimeState::Pending {
            tracing::info!(service = name, "Stopping service for restart");
            self.runtime.stop(name, self.options.stop_timeout).await?;
            self.set_state(name, RuntimeState::Stopped, None);
        }
        if self.table.state(name) == RuntimeState::Stopped {
            self.set_state(name, RuntimeState::Pending, None);
        }
        if self.table.run_id().is_none() {
            self.table.set_run_id(uuid::Uuid::new_v4().to_string());
        }

        let descriptor = self
            .begin_launch(name)
            .await
            .map_err(ServiceFailure::into_error)?;
        let launcher = self.launcher();

        let launch = tokio::select! {
            _ = cancel.cancelled() => {
                self.runtime.stop(name, self.options.stop_timeout).await?;
                self.set_state(name, RuntimeState::Stopped, None);
                return Err(HearthError::Interrupted);
            }
            (_, launch) = launcher.run(descriptor.clone()) => launch,
        };

        match self.settle(name, launch) {
            None => Ok(()),
            Some(failure) => Err(match failure.kind {
                FailureKind::HealthCheckTimeout => HearthError::HealthCheckTimeout {
                    service: failure.service,
                    start_period_secs: descriptor
                        .healthcheck
                        .as_ref()
                        .map(|c| c.start_period.as_secs())
                        .unwrap_or_default(),
                },
                _ => failure.into_error(),
            }),
        }
    }

    /// Align recorded state with what the runtime reports
    pub async fn reconcile(&mut self) -> Result<()> {
        let names: Vec<String> = self.registry.names().map(str::to_string).collect();
        for name in names {
            let recorded = self.table.state(&name);
            if !recorded.is_running() {
                continue;
            }
            match self.runtime.inspect(&name).await? {
                ContainerState::Running => {}
                ContainerState::Missing => {
                    self.table
                        .reconcile(&name, RuntimeState::Stopped, Some("container is gone".to_string()));
                }
                ContainerState::Exited(code) => {
                    self.table.reconcile(
                        &name,
                        RuntimeState::Failed,
                        Some(format!("container exited with code {}", code.unwrap_or(-1))),
                    );
                }
            }
        }
        self.publish();
        Ok(())
    }
}

/// What a launch task reports back to the coordinator
enum Launch {
    /// The container could not be created
    Refused(HearthError),
    /// The container runs; result of waiting for its first passing probe
    Probed(StartupOutcome),
}

/// The parts of the sequencer a launch task needs, detached from the state table
#[derive(Clone)]
struct Launcher {
    registry: Arc<ServiceRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    volumes: Arc<VolumeManager>,
    prober: Arc<Prober>,
    project: String,
    project_dir: PathBuf,
    run_id: String,
}

impl Launcher {
    async fn run(self, descriptor: ServiceDescriptor) -> (String, Launch) {
        let launch = match self.create_container(&descriptor).await {
            Ok(()) => Launch::Probed(self.prober.await_healthy(&descriptor).await),
            Err(e) => Launch::Refused(e),
        };
        (descriptor.name, launch)
    }

    /// Volumes, port check and container start
    async fn create_container(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        let mut spec = ContainerSpec::for_service(&self.project, &self.run_id, descriptor);

        for binding in &descriptor.volumes {
            let host_path = match &binding.source {
                VolumeSource::Named(volume) => {
                    let owner = self
                        .registry
                        .volume(volume)
                        .map(|v| v.owner.as_str())
                        .unwrap_or(descriptor.name.as_str());
                    self.volumes.ensure(volume, owner)?.0.mountpoint
                }
                VolumeSource::Bind(path) => resolve_bind(&self.project_dir, path),
            };
            spec.mounts.push(Mount {
                host_path,
                target: binding.target.clone(),
                read_only: binding.read_only,
            });
        }

        // a container that is already up holds its own ports
        let running = self.runtime.inspect(&descriptor.name).await? == ContainerState::Running;
        if !running {
            for port in &descriptor.ports {
                if !self.runtime.port_available(port).await {
                    return Err(HearthError::PortConflict {
                        service: descriptor.name.clone(),
                        port: port.host,
                    });
                }
            }
        }

        self.runtime.start(&spec).await
    }
}

/// Reorder so no service is stopped while one of its dependents is still up.
///
/// For a normal run the input is already in that order and comes back unchanged.
fn dependents_first(order: Vec<String>, graph: &DependencyGraph) -> Vec<String> {
    let mut remaining = order;
    let mut result = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let pending: BTreeSet<&str> = remaining.iter().map(String::as_str).collect();
        let pos = remaining
            .iter()
            .position(|s| graph.dependents(s).all(|d| !pending.contains(d)))
            .unwrap_or(0);
        result.push(remaining.remove(pos));
    }
    result
}

fn resolve_bind(project_dir: &Path, path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}
