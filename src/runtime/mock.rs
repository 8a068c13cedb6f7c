//! In-memory runtime for tests
//!
//! Health is driven by the tokio clock: a service answers its probe with
//! exit code 0 once `ready_after` has elapsed since its container started.

use super::{ContainerRuntime, ContainerSpec, ContainerState, LogLine, LogOptions, LogStream};
use crate::error::{HearthError, Result};
use crate::manifest::PortBinding;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Behaviour {
    ReadyAfter(Duration),
    NeverReady,
    FailStart(String),
}

#[derive(Debug)]
struct Container {
    started_at: Instant,
    exit_code: Option<i32>,
}

#[derive(Debug, Default)]
struct State {
    behaviours: HashMap<String, Behaviour>,
    start_delays: HashMap<String, Duration>,
    probe_override: HashMap<String, bool>,
    containers: HashMap<String, Container>,
    busy_ports: BTreeSet<u16>,
    networks: BTreeSet<String>,
    network_creations: usize,
    start_calls: Vec<String>,
    stop_calls: Vec<String>,
    specs: HashMap<String, ContainerSpec>,
}

/// Scriptable [`ContainerRuntime`]
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<State>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Probe succeeds once `delay` has passed since start
    pub fn ready_after(self, service: &str, delay: Duration) -> Self {
        self.with(|s| {
            s.behaviours
                .insert(service.to_string(), Behaviour::ReadyAfter(delay))
        });
        self
    }

    /// Probe never succeeds
    pub fn never_ready(self, service: &str) -> Self {
        self.with(|s| s.behaviours.insert(service.to_string(), Behaviour::NeverReady));
        self
    }

    /// Container creation fails
    pub fn fail_start(self, service: &str, message: &str) -> Self {
        self.with(|s| {
            s.behaviours
                .insert(service.to_string(), Behaviour::FailStart(message.to_string()))
        });
        self
    }

    /// `start` takes this long before the container exists, like an image pull
    pub fn slow_start(self, service: &str, delay: Duration) -> Self {
        self.with(|s| s.start_delays.insert(service.to_string(), delay));
        self
    }

    /// Mark a host port as taken by something else
    pub fn occupy_port(self, port: u16) -> Self {
        self.with(|s| s.busy_ports.insert(port));
        self
    }

    /// Force every later probe result for a service
    pub fn set_probe_result(&self, service: &str, healthy: bool) {
        self.with(|s| s.probe_override.insert(service.to_string(), healthy));
    }

    /// Make a running container exit
    pub fn crash(&self, service: &str, code: i32) {
        self.with(|s| {
            if let Some(container) = s.containers.get_mut(service) {
                container.exit_code = Some(code);
            }
        });
    }

    /// Services passed to `start`, in call order
    pub fn start_calls(&self) -> Vec<String> {
        self.with(|s| s.start_calls.clone())
    }

    /// Services passed to `stop`, in call order
    pub fn stop_calls(&self) -> Vec<String> {
        self.with(|s| s.stop_calls.clone())
    }

    /// How many networks were actually created
    pub fn network_creations(&self) -> usize {
        self.with(|s| s.network_creations)
    }

    /// Last spec a service was started with
    pub fn spec(&self, service: &str) -> Option<ContainerSpec> {
        self.with(|s| s.specs.get(service).cloned())
    }

    /// Whether a container is currently running
    pub fn is_running(&self, service: &str) -> bool {
        self.with(|s| {
            s.containers
                .get(service)
                .map(|c| c.exit_code.is_none())
                .unwrap_or(false)
        })
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ensure_network(&self, name: &str) -> Result<bool> {
        Ok(self.with(|s| {
            let created = s.networks.insert(name.to_string());
            if created {
                s.network_creations += 1;
            }
            created
        }))
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<()> {
        let delay = self.with(|s| {
            s.start_calls.push(spec.service.clone());
            s.start_delays.get(&spec.service).copied()
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.with(|s| {
            if let Some(Behaviour::FailStart(message)) = s.behaviours.get(&spec.service) {
                return Err(HearthError::Runtime {
                    service: spec.service.clone(),
                    message: message.clone(),
                });
            }
            let running = s
                .containers
                .get(&spec.service)
                .map(|c| c.exit_code.is_none())
                .unwrap_or(false);
            if !running {
                s.containers.insert(
                    spec.service.clone(),
                    Container {
                        started_at: Instant::now(),
                        exit_code: None,
                    },
                );
            }
            s.specs.insert(spec.service.clone(), spec.clone());
            Ok(())
        })
    }

    async fn stop(&self, service: &str, _timeout: Duration) -> Result<()> {
        self.with(|s| {
            s.stop_calls.push(service.to_string());
            s.containers.remove(service);
        });
        Ok(())
    }

    async fn inspect(&self, service: &str) -> Result<ContainerState> {
        Ok(self.with(|s| match s.containers.get(service) {
            None => ContainerState::Missing,
            Some(c) => match c.exit_code {
                Some(code) => ContainerState::Exited(Some(code)),
                None => ContainerState::Running,
            },
        }))
    }

    async fn exec(&self, service: &str, _argv: &[String]) -> Result<i32> {
        Ok(self.with(|s| {
            let container = match s.containers.get(service) {
                Some(c) if c.exit_code.is_none() => c,
                _ => return 1,
            };
            if let Some(healthy) = s.probe_override.get(service) {
                return if *healthy { 0 } else { 1 };
            }
            let ready = match s.behaviours.get(service) {
                Some(Behaviour::ReadyAfter(delay)) => container.started_at.elapsed() >= *delay,
                Some(Behaviour::NeverReady) | Some(Behaviour::FailStart(_)) => false,
                None => true,
            };
            if ready {
                0
            } else {
                1
            }
        }))
    }

    async fn port_available(&self, port: &PortBinding) -> bool {
        self.with(|s| !s.busy_ports.contains(&port.host))
    }

    async fn logs(&self, service: &str, options: LogOptions) -> Result<mpsc::Receiver<LogLine>> {
        if !self.with(|s| s.containers.contains_key(service)) {
            return Err(HearthError::Runtime {
                service: service.to_string(),
                message: "no such container".to_string(),
            });
        }

        let mut lines = vec![
            LogLine {
                stream: LogStream::Stdout,
                line: format!("{} starting", service),
            },
            LogLine {
                stream: LogStream::Stderr,
                line: format!("{} warming up", service),
            },
            LogLine {
                stream: LogStream::Stdout,
                line: format!("{} ready", service),
            },
        ];
        if let Some(tail) = options.tail {
            let skip = lines.len().saturating_sub(tail);
            lines.drain(..skip);
        }

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for line in lines {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
