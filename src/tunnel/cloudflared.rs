//! `cloudflared` process as a tunnel connector
//!
//! The client is configured through a generated ingress file and the
//! `TUNNEL_TOKEN` environment variable. It has no control channel for route
//! changes, so every route change is a reconnect.

use super::config::{RouteTable, TunnelToken};
use super::connector::{TunnelConnector, TunnelFailure, TunnelSession};
use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Ingress file written next to the supervisor state
pub const INGRESS_FILE: &str = "tunnel-ingress.yml";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct IngressFile {
    tunnel: String,
    ingress: Vec<IngressRule>,
}

#[derive(Serialize)]
struct IngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    service: String,
}

/// Ingress document for a route table; unmatched hosts get a 404
pub fn ingress_yaml(token: &TunnelToken, routes: &RouteTable) -> Result<String, serde_yaml::Error> {
    let mut ingress: Vec<IngressRule> = routes
        .iter()
        .map(|(hostname, target)| IngressRule {
            hostname: Some(hostname.to_string()),
            service: target.url.clone(),
        })
        .collect();
    ingress.push(IngressRule {
        hostname: None,
        service: "http_status:404".to_string(),
    });

    serde_yaml::to_string(&IngressFile {
        tunnel: token.tunnel_id().to_string(),
        ingress,
    })
}

/// What a client log line tells us
#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientEvent {
    Connected,
    AuthRejected(String),
    Error(String),
}

fn classify(line: &str) -> Option<ClientEvent> {
    let lower = line.to_ascii_lowercase();
    if lower.contains("registered tunnel connection") {
        Some(ClientEvent::Connected)
    } else if lower.contains("unauthorized")
        || lower.contains("invalid tunnel secret")
        || lower.contains("provided tunnel token is not valid")
        || lower.contains("tunnel not found")
    {
        Some(ClientEvent::AuthRejected(line.trim().to_string()))
    } else if lower.contains(" err ") || lower.contains("level=error") {
        Some(ClientEvent::Error(line.trim().to_string()))
    } else {
        None
    }
}

async fn forward<R>(reader: R, tx: mpsc::UnboundedSender<ClientEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::trace!(target: "hearth::tunnel::client", "{}", line);
        if let Some(event) = classify(&line) {
            if tx.send(event).is_err() {
                break;
            }
        }
    }
}

/// Send SIGTERM to a process
#[cfg(unix)]
fn terminate(pid: u32) -> io::Result<()> {
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "no SIGTERM"))
}

/// Runs `cloudflared tunnel run`
#[derive(Debug, Clone)]
pub struct CloudflaredConnector {
    binary: String,
    work_dir: PathBuf,
}

impl CloudflaredConnector {
    pub fn new(binary: &str, work_dir: PathBuf) -> Self {
        Self {
            binary: binary.to_string(),
            work_dir,
        }
    }
}

#[async_trait]
impl TunnelConnector for CloudflaredConnector {
    async fn connect(
        &self,
        token: &TunnelToken,
        routes: &RouteTable,
    ) -> Result<Box<dyn TunnelSession>, TunnelFailure> {
        let config = ingress_yaml(token, routes)
            .map_err(|e| TunnelFailure::Transient(format!("failed to render ingress: {}", e)))?;
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| TunnelFailure::Transient(e.to_string()))?;
        let config_path = self.work_dir.join(INGRESS_FILE);
        tokio::fs::write(&config_path, config)
            .await
            .map_err(|e| TunnelFailure::Transient(format!("failed to write ingress: {}", e)))?;

        let mut child = Command::new(&self.binary)
            .args(["tunnel", "--no-autoupdate", "--config"])
            .arg(&config_path)
            .arg("run")
            .env("TUNNEL_TOKEN", token.expose())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TunnelFailure::Transient(format!("failed to start {}: {}", self.binary, e))
            })?;

        let (tx, mut events) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward(stderr, tx));
        }

        let deadline = tokio::time::sleep(CONNECT_TIMEOUT);
        tokio::pin!(deadline);
        let mut last_error = None;
        let mut events_open = true;

        loop {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(ClientEvent::Connected) => {
                        tracing::debug!(pid = ?child.id(), "Tunnel client registered");
                        return Ok(Box::new(CloudflaredSession { child, events, last_error }));
                    }
                    Some(ClientEvent::AuthRejected(line)) => {
                        let _ = child.kill().await;
                        return Err(TunnelFailure::Auth(line));
                    }
                    Some(ClientEvent::Error(line)) => last_error = Some(line),
                    None => events_open = false,
                },
                status = child.wait() => {
                    let detail = last_error.unwrap_or_else(|| match status {
                        Ok(status) => format!("{} exited with {}", self.binary, status),
                        Err(e) => e.to_string(),
                    });
                    return Err(TunnelFailure::Transient(detail));
                }
                _ = &mut deadline => {
                    let _ = child.kill().await;
                    return Err(TunnelFailure::Transient(format!(
                        "no connection registered within {}s",
                        CONNECT_TIMEOUT.as_secs()
                    )));
                }
            }
        }
    }
}

struct CloudflaredSession {
    child: Child,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    last_error: Option<String>,
}

#[async_trait]
impl TunnelSession for CloudflaredSession {
    fn supports_route_updates(&self) -> bool {
        false
    }

    async fn update_routes(&mut self, _routes: &RouteTable) -> Result<(), TunnelFailure> {
        Err(TunnelFailure::Transient(
            "cloudflared cannot update routes in place".to_string(),
        ))
    }

    async fn closed(&mut self) -> TunnelFailure {
        let mut events_open = true;
        loop {
            tokio::select! {
                event = self.events.recv(), if events_open => match event {
                    Some(ClientEvent::AuthRejected(line)) => {
                        let _ = self.child.kill().await;
                        return TunnelFailure::Auth(line);
                    }
                    Some(ClientEvent::Error(line)) => {
                        tracing::debug!(error = %line, "Tunnel client error");
                        self.last_error = Some(line);
                    }
                    Some(ClientEvent::Connected) => {}
                    None => events_open = false,
                },
                status = self.child.wait() => {
                    let detail = self.last_error.take().unwrap_or_else(|| match status {
                        Ok(status) => format!("tunnel client exited with {}", status),
                        Err(e) => e.to_string(),
                    });
                    return TunnelFailure::Transient(detail);
                }
            }
        }
    }

    async fn shutdown(self: Box<Self>) {
        let mut child = self.child;
        if let Some(pid) = child.id() {
            if let Err(e) = terminate(pid) {
                tracing::debug!(pid, error = %e, "SIGTERM failed");
            }
            if tokio::time::timeout(SHUTDOWN_GRACE, child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::config::{test_token, RouteTarget};

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("2024-05-01T10:00:00Z INF Registered tunnel connection connIndex=0"),
            Some(ClientEvent::Connected)
        );
        assert!(matches!(
            classify("2024-05-01T10:00:00Z ERR Provided Tunnel token is not valid."),
            Some(ClientEvent::AuthRejected(_))
        ));
        assert!(matches!(
            classify("2024-05-01T10:00:00Z ERR Failed to dial a quic connection"),
            Some(ClientEvent::Error(_))
        ));
        assert_eq!(classify("2024-05-01T10:00:00Z INF Starting tunnel"), None);
    }

    #[test]
    fn test_ingress_yaml() {
        let token = TunnelToken::parse(&test_token()).unwrap();
        let mut routes = RouteTable::new();
        routes.insert(
            "n8n.example.com",
            RouteTarget {
                service: Some("n8n".into()),
                url: "http://127.0.0.1:5678".into(),
            },
        );

        let yaml = ingress_yaml(&token, &routes).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let rules = doc["ingress"].as_sequence().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0]["hostname"].as_str(), Some("n8n.example.com"));
        assert_eq!(rules[0]["service"].as_str(), Some("http://127.0.0.1:5678"));
        assert_eq!(rules[1]["service"].as_str(), Some("http_status:404"));
        assert!(!yaml.contains("c2VjcmV0"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_transient() {
        let temp = tempfile::tempdir().unwrap();
        let connector =
            CloudflaredConnector::new("hearth-test-no-such-binary", temp.path().to_path_buf());
        let token = TunnelToken::parse(&test_token()).unwrap();
        let err = connector
            .connect(&token, &RouteTable::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelFailure::Transient(_)));
    }
}
