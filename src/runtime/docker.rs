//! Runtime backed by the `docker` command line

use super::{
    container_name, ContainerRuntime, ContainerSpec, ContainerState, LogLine, LogOptions,
    LogStream, LABEL_PROJECT,
};
use crate::error::{HearthError, Result};
use crate::manifest::{PortBinding, Protocol};
use async_trait::async_trait;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Drives containers through the docker CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    project: String,
    binary: String,
}

impl DockerCli {
    /// Runtime for a project, using `docker` from `PATH`
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            binary: "docker".to_string(),
        }
    }

    fn container(&self, service: &str) -> String {
        container_name(&self.project, service)
    }

    async fn output(&self, service: &str, args: &[&str]) -> Result<Output> {
        tracing::debug!(service, "{} {}", self.binary, args.join(" "));
        // an aborted launch takes its docker client down with it
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HearthError::Runtime {
                service: service.to_string(),
                message: format!("failed to run {}: {}", self.binary, e),
            })
    }

    async fn checked(&self, service: &str, args: &[&str]) -> Result<String> {
        let output = self.output(service, args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(HearthError::Runtime {
                service: service.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn run_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".into(), "-d".into(), "--name".into(), spec.name.clone()];

        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }

        if let Some(network) = spec.networks.first() {
            args.push("--network".into());
            args.push(network.clone());
            args.push("--network-alias".into());
            args.push(spec.service.clone());
        }

        // values travel through the child environment, not argv
        for key in spec.env.keys() {
            args.push("-e".into());
            args.push(key.clone());
        }

        for port in &spec.ports {
            args.push("-p".into());
            args.push(port.to_string());
        }

        for mount in &spec.mounts {
            args.push("-v".into());
            let mut value = format!("{}:{}", mount.host_path.display(), mount.target);
            if mount.read_only {
                value.push_str(":ro");
            }
            args.push(value);
        }

        for host in &spec.extra_hosts {
            args.push("--add-host".into());
            args.push(host.clone());
        }

        if let Some(restart) = &spec.restart {
            args.push("--restart".into());
            args.push(restart.clone());
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

fn is_missing(stderr: &[u8]) -> bool {
    let text = String::from_utf8_lossy(stderr).to_ascii_lowercase();
    text.contains("no such container") || text.contains("no such object")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ensure_network(&self, name: &str) -> Result<bool> {
        let inspect = self
            .output("", &["network", "inspect", name])
            .await?;
        if inspect.status.success() {
            return Ok(false);
        }

        let label = format!("{}={}", LABEL_PROJECT, self.project);
        self.checked("", &["network", "create", "--label", label.as_str(), name])
            .await?;
        tracing::info!(network = name, "Created network");
        Ok(true)
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<()> {
        match self.inspect(&spec.service).await? {
            ContainerState::Running => return Ok(()),
            ContainerState::Exited(_) => {
                self.checked(&spec.service, &["rm", "-f", spec.name.as_str()]).await?;
            }
            ContainerState::Missing => {}
        }

        let args = self.run_args(spec);
        tracing::debug!(service = %spec.service, "{} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(&args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HearthError::Runtime {
                service: spec.service.clone(),
                message: format!("failed to run {}: {}", self.binary, e),
            })?;
        if !output.status.success() {
            return Err(HearthError::Runtime {
                service: spec.service.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        for network in spec.networks.iter().skip(1) {
            self.checked(
                &spec.service,
                &[
                    "network",
                    "connect",
                    "--alias",
                    spec.service.as_str(),
                    network.as_str(),
                    spec.name.as_str(),
                ],
            )
            .await?;
        }

        Ok(())
    }

    async fn stop(&self, service: &str, timeout: Duration) -> Result<()> {
        let name = self.container(service);
        let grace = timeout.as_secs().to_string();
        let stop = self
            .output(service, &["stop", "-t", grace.as_str(), name.as_str()])
            .await?;
        if !stop.status.success() && !is_missing(&stop.stderr) {
            return Err(HearthError::Runtime {
                service: service.to_string(),
                message: String::from_utf8_lossy(&stop.stderr).trim().to_string(),
            });
        }

        let rm = self.output(service, &["rm", "-f", name.as_str()]).await?;
        if !rm.status.success() && !is_missing(&rm.stderr) {
            return Err(HearthError::Runtime {
                service: service.to_string(),
                message: String::from_utf8_lossy(&rm.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn inspect(&self, service: &str) -> Result<ContainerState> {
        let name = self.container(service);
        let output = self
            .output(
                service,
                &["inspect", "-f", "{{.State.Status}} {{.State.ExitCode}}", name.as_str()],
            )
            .await?;

        if !output.status.success() {
            if is_missing(&output.stderr) {
                return Ok(ContainerState::Missing);
            }
            return Err(HearthError::Runtime {
                service: service.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut parts = stdout.split_whitespace();
        let status = parts.next().unwrap_or_default();
        let code = parts.next().and_then(|c| c.parse().ok());
        Ok(match status {
            "running" | "restarting" | "paused" => ContainerState::Running,
            _ => ContainerState::Exited(code),
        })
    }

    async fn exec(&self, service: &str, argv: &[String]) -> Result<i32> {
        let name = self.container(service);
        let mut args = vec!["exec", name.as_str()];
        args.extend(argv.iter().map(String::as_str));
        let output = self.output(service, &args).await?;
        Ok(output.status.code().unwrap_or(-1))
    }

    async fn port_available(&self, port: &PortBinding) -> bool {
        let ip = port.host_ip.as_deref().unwrap_or("0.0.0.0");
        let addr = format!("{}:{}", ip, port.host);
        match port.protocol {
            Protocol::Tcp => tokio::net::TcpListener::bind(&addr).await.is_ok(),
            Protocol::Udp => tokio::net::UdpSocket::bind(&addr).await.is_ok(),
        }
    }

    async fn logs(&self, service: &str, options: LogOptions) -> Result<mpsc::Receiver<LogLine>> {
        let mut args = vec!["logs".to_string()];
        if options.follow {
            args.push("--follow".into());
        }
        if let Some(tail) = options.tail {
            args.push("--tail".into());
            args.push(tail.to_string());
        }
        args.push(self.container(service));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HearthError::Runtime {
                service: service.to_string(),
                message: format!("failed to run {}: {}", self.binary, e),
            })?;

        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, LogStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, LogStream::Stderr, tx.clone()));
        }

        let service = service.to_string();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    if let Ok(status) = status {
                        if !status.success() {
                            tracing::debug!(service = %service, code = ?status.code(), "Log stream ended");
                        }
                    }
                }
                _ = tx.closed() => {
                    let _ = child.kill().await;
                }
            }
        });

        Ok(rx)
    }
}

async fn forward_lines<R>(reader: R, stream: LogStream, tx: mpsc::Sender<LogLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(LogLine { stream, line }).await.is_err() {
            break;
        }
    }
}
