//! Supervisor front end
//!
//! Wires a loaded [`Project`] to the container runtime, the sequencer, the
//! volume manager and the tunnel, and persists state between invocations.

pub mod project;
pub mod state_store;

pub use project::Project;
pub use state_store::{StateStore, STATE_FILE, TUNNEL_FILE};

use crate::error::{HearthError, Result};
use crate::runtime::{ContainerRuntime, ContainerState, DockerCli, LogLine, LogOptions};
use crate::sequencer::{Sequencer, SequencerOptions, StackSnapshot};
use crate::storage::VolumeManager;
use crate::tunnel::config::DEFAULT_BINARY;
use crate::tunnel::{CloudflaredConnector, TunnelConnector, TunnelHandle, TunnelManager, TunnelStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often `hearth tunnel` rereads the stack state written by `start`
const STATE_REFRESH: Duration = Duration::from_secs(5);

/// What `hearth status` reports
#[derive(Debug, Clone, Serialize)]
pub struct StackStatus {
    pub stack: StackSnapshot,
    /// Last status written by a tunnel manager, if one ever ran
    pub tunnel: Option<TunnelStatus>,
}

/// A volume as `hearth volume ls` shows it
#[derive(Debug, Clone, Serialize)]
pub struct VolumeReport {
    pub name: String,
    pub owner: String,
    pub users: Vec<String>,
    /// Declared in the manifest
    pub declared: bool,
    /// Set once the volume has been created
    pub mountpoint: Option<PathBuf>,
    pub size: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Entry point for every CLI operation
pub struct Supervisor {
    project: Project,
    runtime: Arc<dyn ContainerRuntime>,
    connector: Arc<dyn TunnelConnector>,
    volumes: Arc<VolumeManager>,
    store: StateStore,
}

impl Supervisor {
    /// Supervisor backed by the docker CLI and the cloudflared client
    pub fn new(project: Project) -> Result<Self> {
        let runtime = Arc::new(DockerCli::new(&project.name));
        let binary = project
            .tunnel
            .as_ref()
            .map(|t| t.binary.clone())
            .unwrap_or_else(|| DEFAULT_BINARY.to_string());
        let connector = Arc::new(CloudflaredConnector::new(
            &binary,
            project.data_dir().join("tunnel"),
        ));
        Self::with_parts(project, runtime, connector)
    }

    pub fn with_parts(
        project: Project,
        runtime: Arc<dyn ContainerRuntime>,
        connector: Arc<dyn TunnelConnector>,
    ) -> Result<Self> {
        let volumes = Arc::new(VolumeManager::new(project.volumes_dir())?);
        let store = StateStore::new(project.data_dir());
        Ok(Self {
            project,
            runtime,
            connector,
            volumes,
            store,
        })
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    fn sequencer(&self) -> Result<Sequencer> {
        let options = SequencerOptions {
            project: self.project.name.clone(),
            project_dir: self.project.dir.clone(),
            stop_timeout: self.project.stop_timeout,
        };
        let registry = self.project.registry.clone();
        let runtime = self.runtime.clone();
        let volumes = self.volumes.clone();

        Ok(match self.store.load()? {
            Some(snapshot) if snapshot.project == self.project.name => {
                Sequencer::restore(registry, runtime, volumes, options, snapshot)
            }
            _ => Sequencer::new(registry, runtime, volumes, options),
        })
    }

    /// Sequencer whose persisted state agrees with the runtime
    async fn reconciled(&self) -> Result<Sequencer> {
        let mut sequencer = self.sequencer()?;
        sequencer.reconcile().await?;
        Ok(sequencer)
    }

    async fn persist(&self, writer: JoinHandle<()>, sequencer: &Sequencer) -> Result<()> {
        writer.abort();
        let _ = writer.await;
        self.store.save(&sequencer.snapshot())
    }

    /// Start, tearing the stack back down if interrupted
    async fn bring_up(&self, sequencer: &mut Sequencer, cancel: &CancellationToken) -> Result<()> {
        match sequencer.start(cancel).await {
            Err(HearthError::Interrupted) => {
                tracing::warn!(project = %self.project.name, "Startup interrupted, stopping stack");
                if let Err(e) = sequencer.stop().await {
                    tracing::error!(error = %e, "Teardown after interrupt failed");
                }
                Err(HearthError::Interrupted)
            }
            other => other,
        }
    }

    /// Bring the stack up and return once every service settled
    pub async fn start(&self, cancel: &CancellationToken) -> Result<StackSnapshot> {
        let mut sequencer = self.reconciled().await?;
        let writer = self.store.spawn_writer(sequencer.subscribe());
        let result = self.bring_up(&mut sequencer, cancel).await;
        self.persist(writer, &sequencer).await?;
        result.map(|_| sequencer.snapshot())
    }

    /// Bring the stack up, then monitor health and run the tunnel until
    /// `cancel` fires; tears everything down in reverse order on the way out.
    ///
    /// A tunnel failure is logged and the services keep running.
    pub async fn run_attached(&self, cancel: &CancellationToken, with_tunnel: bool) -> Result<()> {
        let mut sequencer = self.reconciled().await?;
        let writer = self.store.spawn_writer(sequencer.subscribe());
        if let Err(e) = self.bring_up(&mut sequencer, cancel).await {
            self.persist(writer, &sequencer).await?;
            return Err(e);
        }
        tracing::info!(project = %self.project.name, "Stack is up");

        let mut tunnel = match (&self.project.tunnel, with_tunnel) {
            (Some(config), true) => Some(
                TunnelManager::new(config.clone(), self.connector.clone())
                    .wait_for_stack(sequencer.subscribe())
                    .spawn(cancel.child_token()),
            ),
            _ => None,
        };
        let tunnel_status = tunnel.as_ref().map(|t| t.subscribe());
        let tunnel_writer = tunnel
            .as_ref()
            .map(|t| self.store.spawn_tunnel_writer(t.subscribe()));

        let monitored = {
            let monitor = sequencer.monitor(cancel);
            tokio::pin!(monitor);
            loop {
                tokio::select! {
                    result = &mut monitor => break result,
                    result = tunnel_finished(&mut tunnel) => {
                        if let Err(e) = result {
                            tracing::error!(error = %e, "Tunnel stopped; services keep running");
                        }
                    }
                }
            }
        };

        if let Some(handle) = tunnel {
            if let Err(e) = handle.stop().await {
                tracing::debug!(error = %e, "Tunnel ended with error");
            }
        }
        if let (Some(writer), Some(status)) = (tunnel_writer, tunnel_status) {
            writer.abort();
            let _ = writer.await;
            self.store.save_tunnel(&status.borrow())?;
        }

        tracing::info!(project = %self.project.name, "Stopping stack");
        let stopped = sequencer.stop().await;
        self.persist(writer, &sequencer).await?;
        monitored.and(stopped)
    }

    /// Reverse-order teardown; a no-op when already stopped
    pub async fn stop(&self) -> Result<StackSnapshot> {
        let mut sequencer = self.reconciled().await?;
        let writer = self.store.spawn_writer(sequencer.subscribe());
        let result = sequencer.stop().await;
        self.persist(writer, &sequencer).await?;
        result.map(|_| sequencer.snapshot())
    }

    /// Persisted state reconciled with the runtime
    pub async fn status(&self) -> Result<StackStatus> {
        let sequencer = self.reconciled().await?;
        let stack = sequencer.snapshot();
        self.store.save(&stack)?;
        Ok(StackStatus {
            stack,
            tunnel: self.store.load_tunnel()?,
        })
    }

    /// Stream a service's output
    pub async fn logs(&self, service: &str, options: LogOptions) -> Result<mpsc::Receiver<LogLine>> {
        self.project.registry.get(service)?;
        self.runtime.logs(service, options).await
    }

    /// Restart one service; its dependencies must still be Healthy
    pub async fn restart(&self, service: &str, cancel: &CancellationToken) -> Result<()> {
        self.project.registry.get(service)?;
        let mut sequencer = self.reconciled().await?;
        let writer = self.store.spawn_writer(sequencer.subscribe());
        let result = sequencer.restart(service, cancel).await;
        self.persist(writer, &sequencer).await?;
        result
    }

    /// Run only the tunnel against a stack started elsewhere
    pub async fn run_tunnel(&self, cancel: &CancellationToken) -> Result<()> {
        let config = self.project.tunnel.clone().ok_or_else(|| {
            HearthError::InvalidConfig("manifest declares no tunnel routes".to_string())
        })?;

        let snapshot = self.reconciled().await?.snapshot();
        let (stack_tx, stack_rx) = watch::channel(snapshot);
        let refresher = self.spawn_state_refresher(stack_tx, cancel.clone());

        let mut handle = TunnelManager::new(config, self.connector.clone())
            .wait_for_stack(stack_rx)
            .spawn(cancel.child_token());
        let status = handle.subscribe();
        let writer = self.store.spawn_tunnel_writer(handle.subscribe());

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = handle.finished() => result,
        };
        let stopped = handle.stop().await;

        refresher.abort();
        writer.abort();
        let _ = writer.await;
        self.store.save_tunnel(&status.borrow())?;
        result.and(stopped)
    }

    fn spawn_state_refresher(
        &self,
        stack: watch::Sender<StackSnapshot>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATE_REFRESH);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Ok(Some(snapshot)) = store.load() {
                            stack.send_replace(snapshot);
                        }
                    }
                }
            }
        })
    }

    /// Declared and created volumes
    pub fn volume_list(&self) -> Result<Vec<VolumeReport>> {
        let mut reports: BTreeMap<String, VolumeReport> = self
            .project
            .registry
            .volumes()
            .map(|spec| {
                (
                    spec.name.clone(),
                    VolumeReport {
                        name: spec.name.clone(),
                        owner: spec.owner.clone(),
                        users: spec.users.iter().cloned().collect(),
                        declared: true,
                        mountpoint: None,
                        size: None,
                        created_at: None,
                    },
                )
            })
            .collect();

        for volume in self.volumes.list()? {
            let size = volume.size().ok();
            let report = reports
                .entry(volume.name.clone())
                .or_insert_with(|| VolumeReport {
                    name: volume.name.clone(),
                    owner: volume.owner.clone(),
                    users: Vec::new(),
                    declared: false,
                    mountpoint: None,
                    size: None,
                    created_at: None,
                });
            report.mountpoint = Some(volume.mountpoint);
            report.size = size;
            report.created_at = Some(volume.created_at);
        }

        Ok(reports.into_values().collect())
    }

    /// Fails unless every service mounting `volume` is down; returns the owner
    async fn ensure_volume_idle(&self, volume: &str) -> Result<String> {
        let snapshot = self.reconciled().await?.snapshot();
        let (owner, users) = match self.project.registry.volume(volume) {
            Some(spec) => (spec.owner.clone(), spec.users.iter().cloned().collect()),
            None => (
                self.volumes.get(volume).map(|v| v.owner).unwrap_or_default(),
                Vec::<String>::new(),
            ),
        };

        for user in &users {
            let live = matches!(self.runtime.inspect(user).await?, ContainerState::Running);
            if live || snapshot.state(user).is_running() {
                return Err(HearthError::Volume(format!(
                    "volume '{}' is in use by running service '{}'",
                    volume, user
                )));
            }
        }
        Ok(owner)
    }

    /// Archive a volume to `dest` (a file, or a directory to put one in)
    pub async fn volume_backup(&self, name: &str, dest: &Path) -> Result<PathBuf> {
        self.ensure_volume_idle(name).await?;
        let archive = self.volumes.backup(name, dest)?;
        tracing::info!(volume = name, archive = %archive.display(), "Volume backed up");
        Ok(archive)
    }

    /// Replace a volume's contents with an archive
    pub async fn volume_restore(&self, name: &str, archive: &Path) -> Result<()> {
        let owner = self.ensure_volume_idle(name).await?;
        self.volumes.restore(name, archive, &owner)?;
        tracing::info!(volume = name, archive = %archive.display(), "Volume restored");
        Ok(())
    }

    /// Destroy a volume's data
    pub async fn volume_wipe(&self, name: &str) -> Result<()> {
        self.ensure_volume_idle(name).await?;
        self.volumes.wipe(name)?;
        tracing::warn!(volume = name, "Volume wiped");
        Ok(())
    }
}

async fn tunnel_finished(tunnel: &mut Option<TunnelHandle>) -> Result<()> {
    match tunnel {
        Some(handle) => handle.finished().await,
        None => std::future::pending().await,
    }
}
