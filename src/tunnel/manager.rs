//! Tunnel lifecycle state machine
//!
//! Disconnected -> Connecting -> Connected, then Reconnecting <-> Connected
//! until stopped. Transient failures back off exponentially up to a cap and
//! retry forever; an authentication failure ends the manager at once.

use super::backoff::{log_failure, Backoff};
use super::config::{RouteTable, RouteTarget, TunnelConfig, TunnelToken};
use super::connector::{TunnelConnector, TunnelFailure, TunnelSession};
use crate::error::{HearthError, Result};
use crate::sequencer::StackSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Connection state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelState::Disconnected => write!(f, "disconnected"),
            TunnelState::Connecting => write!(f, "connecting"),
            TunnelState::Connected => write!(f, "connected"),
            TunnelState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// What the supervisor shows for the tunnel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub state: TunnelState,
    pub last_error: Option<String>,
    /// Set when the manager gave up for good
    pub fatal: bool,
    /// Connection attempts made
    pub attempts: u32,
    /// Times an established connection was replaced
    pub reconnects: u32,
    pub connected_since: Option<DateTime<Utc>>,
    /// Published hostname to origin URL
    pub routes: BTreeMap<String, String>,
}

/// Route change requested while the tunnel runs
#[derive(Debug, Clone)]
pub enum RouteCommand {
    Set { hostname: String, target: RouteTarget },
    Remove { hostname: String },
}

fn route_map(routes: &RouteTable) -> BTreeMap<String, String> {
    routes
        .iter()
        .map(|(host, target)| (host.to_string(), target.url.clone()))
        .collect()
}

/// Control handle for a running tunnel manager
pub struct TunnelHandle {
    status: watch::Receiver<TunnelStatus>,
    commands: mpsc::Sender<RouteCommand>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl TunnelHandle {
    /// Latest status
    pub fn status(&self) -> TunnelStatus {
        self.status.borrow().clone()
    }

    /// Follow status changes
    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.status.clone()
    }

    /// Publish or retarget a hostname
    pub async fn set_route(&self, hostname: &str, target: RouteTarget) -> Result<()> {
        self.send(RouteCommand::Set {
            hostname: hostname.to_string(),
            target,
        })
        .await
    }

    /// Stop publishing a hostname
    pub async fn remove_route(&self, hostname: &str) -> Result<()> {
        self.send(RouteCommand::Remove {
            hostname: hostname.to_string(),
        })
        .await
    }

    async fn send(&self, command: RouteCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HearthError::Internal("tunnel manager is not running".to_string()))
    }

    /// Resolves when the manager exits on its own, e.g. after an auth failure
    pub async fn finished(&mut self) -> Result<()> {
        match self.task.as_mut() {
            Some(task) => {
                let result = task.await;
                self.task = None;
                flatten(result)
            }
            None => std::future::pending().await,
        }
    }

    /// Cancel backoff timers and close the connection
    pub async fn stop(mut self) -> Result<()> {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => flatten(task.await),
            None => Ok(()),
        }
    }
}

fn flatten(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(HearthError::Internal(format!("tunnel task failed: {}", e))),
    }
}

/// Builds and spawns the tunnel state machine
pub struct TunnelManager {
    config: TunnelConfig,
    connector: Arc<dyn TunnelConnector>,
    stack: Option<watch::Receiver<StackSnapshot>>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig, connector: Arc<dyn TunnelConnector>) -> Self {
        Self {
            config,
            connector,
            stack: None,
        }
    }

    /// Hold off connecting until every routed service is Healthy
    pub fn wait_for_stack(mut self, stack: watch::Receiver<StackSnapshot>) -> Self {
        self.stack = Some(stack);
        self
    }

    /// Start the manager; `cancel` stops it
    pub fn spawn(self, cancel: CancellationToken) -> TunnelHandle {
        let routes = self.config.routes.clone();
        let status = TunnelStatus {
            routes: route_map(&routes),
            ..Default::default()
        };
        let (status_tx, status_rx) = watch::channel(status.clone());
        let (commands_tx, commands_rx) = mpsc::channel(16);

        let runner = Runner {
            connector: self.connector,
            token: self.config.token,
            backoff: Backoff::new(self.config.backoff),
            stack: self.stack,
            routes,
            commands: commands_rx,
            commands_open: true,
            status,
            status_tx,
        };
        let task = tokio::spawn(runner.run(cancel.clone()));

        TunnelHandle {
            status: status_rx,
            commands: commands_tx,
            cancel,
            task: Some(task),
        }
    }
}

/// How a connected session ended
enum SessionEnd {
    Stopped,
    RoutesChanged,
    Dropped(TunnelFailure),
}

struct Runner {
    connector: Arc<dyn TunnelConnector>,
    token: String,
    backoff: Backoff,
    stack: Option<watch::Receiver<StackSnapshot>>,
    routes: RouteTable,
    commands: mpsc::Receiver<RouteCommand>,
    commands_open: bool,
    status: TunnelStatus,
    status_tx: watch::Sender<TunnelStatus>,
}

impl Runner {
    fn publish(&self) {
        self.status_tx.send_replace(self.status.clone());
    }

    fn set_state(&mut self, state: TunnelState) {
        if self.status.state != state {
            tracing::debug!(from = %self.status.state, to = %state, "Tunnel state");
        }
        self.status.state = state;
        self.publish();
    }

    fn finish(&mut self) {
        self.status.connected_since = None;
        self.set_state(TunnelState::Disconnected);
        tracing::info!("Tunnel stopped");
    }

    fn fail(&mut self, error: HearthError) -> Result<()> {
        tracing::error!(error = %error, "Tunnel disabled");
        self.status.last_error = Some(error.to_string());
        self.status.fatal = true;
        self.status.connected_since = None;
        self.set_state(TunnelState::Disconnected);
        Err(error)
    }

    async fn next_command(&mut self) -> Option<RouteCommand> {
        let command = self.commands.recv().await;
        if command.is_none() {
            self.commands_open = false;
        }
        command
    }

    /// Apply a route change; returns whether the table changed
    fn apply(&mut self, command: RouteCommand) -> bool {
        let changed = match command {
            RouteCommand::Set { hostname, target } => {
                tracing::info!(hostname = %hostname, url = %target.url, "Route set");
                self.routes.insert(&hostname, target.clone()) != Some(target)
            }
            RouteCommand::Remove { hostname } => {
                tracing::info!(hostname = %hostname, "Route removed");
                self.routes.remove(&hostname).is_some()
            }
        };
        if changed {
            self.status.routes = route_map(&self.routes);
        }
        changed
    }

    async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let token = match TunnelToken::parse(&self.token) {
            Ok(token) => token,
            Err(e) => return self.fail(e),
        };

        if !self.wait_for_targets(&cancel).await {
            self.finish();
            return Ok(());
        }

        loop {
            self.status.attempts += 1;
            let state = if self.status.attempts == 1 {
                TunnelState::Connecting
            } else {
                TunnelState::Reconnecting
            };
            self.set_state(state);
            tracing::debug!(attempt = self.status.attempts, routes = self.routes.len(), "Connecting tunnel");

            let connected = tokio::select! {
                _ = cancel.cancelled() => {
                    self.finish();
                    return Ok(());
                }
                result = self.connector.connect(&token, &self.routes) => result,
            };

            let failure = match connected {
                Ok(session) => {
                    self.backoff.reset();
                    self.status.connected_since = Some(Utc::now());
                    self.set_state(TunnelState::Connected);
                    tracing::info!(
                        tunnel = token.tunnel_id(),
                        routes = self.routes.len(),
                        "Tunnel connected"
                    );

                    let end = self.supervise(session, &cancel).await;
                    self.status.connected_since = None;
                    match end {
                        SessionEnd::Stopped => {
                            self.finish();
                            return Ok(());
                        }
                        SessionEnd::RoutesChanged => {
                            self.status.reconnects += 1;
                            continue;
                        }
                        SessionEnd::Dropped(failure) => {
                            self.status.reconnects += 1;
                            failure
                        }
                    }
                }
                Err(failure) => failure,
            };

            let message = match failure {
                TunnelFailure::Auth(message) => return self.fail(HearthError::TunnelAuth(message)),
                TunnelFailure::Transient(message) => message,
            };

            let delay = self.backoff.next_delay();
            log_failure(self.backoff.failures(), delay, &message);
            self.status.last_error = Some(message);
            self.set_state(TunnelState::Reconnecting);

            if !self.wait_backoff(delay, &cancel).await {
                self.finish();
                return Ok(());
            }
        }
    }

    /// Returns false if cancelled
    async fn wait_for_targets(&mut self, cancel: &CancellationToken) -> bool {
        let Some(mut stack) = self.stack.take() else {
            return true;
        };
        let targets = self.routes.target_services();
        if targets.is_empty() {
            return true;
        }

        let mut announced = false;
        loop {
            let ready = {
                let snapshot = stack.borrow_and_update();
                targets.iter().all(|s| snapshot.is_healthy(s))
            };
            if ready {
                return true;
            }
            if !announced {
                tracing::info!(targets = ?targets, "Waiting for routed services to become healthy");
                announced = true;
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = stack.changed() => {
                    if changed.is_err() {
                        tracing::warn!("Stack state is no longer published; connecting anyway");
                        return true;
                    }
                }
                Some(command) = self.next_command(), if self.commands_open => {
                    if self.apply(command) {
                        self.publish();
                    }
                }
            }
        }
    }

    /// Sleep out a backoff delay, still taking route changes; false if cancelled
    async fn wait_backoff(&mut self, delay: Duration, cancel: &CancellationToken) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(command) = self.next_command(), if self.commands_open => {
                    if self.apply(command) {
                        self.publish();
                    }
                }
            }
        }
    }

    async fn supervise(
        &mut self,
        mut session: Box<dyn TunnelSession>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    session.shutdown().await;
                    return SessionEnd::Stopped;
                }
                failure = session.closed() => {
                    tracing::warn!(error = %failure, "Tunnel connection lost");
                    return SessionEnd::Dropped(failure);
                }
                Some(command) = self.next_command(), if self.commands_open => {
                    if !self.apply(command) {
                        continue;
                    }
                    if session.supports_route_updates() {
                        match session.update_routes(&self.routes).await {
                            Ok(()) => {
                                tracing::info!(routes = self.routes.len(), "Tunnel routes updated in place");
                                self.publish();
                            }
                            Err(failure) => {
                                session.shutdown().await;
                                return SessionEnd::Dropped(failure);
                            }
                        }
                    } else {
                        tracing::info!("Reconnecting tunnel to apply route change");
                        self.publish();
                        session.shutdown().await;
                        return SessionEnd::RoutesChanged;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::{RuntimeState, StateTable};
    use crate::tunnel::backoff::BackoffPolicy;
    use crate::tunnel::config::test_token;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    enum Step {
        Fail(TunnelFailure),
        Connect { drop_after: Option<Duration> },
    }

    #[derive(Default)]
    struct Recorder {
        attempts: Vec<Instant>,
        connected_routes: Vec<RouteTable>,
        updates: Vec<RouteTable>,
        shutdowns: usize,
    }

    struct ScriptedConnector {
        script: Mutex<VecDeque<Step>>,
        in_place_updates: bool,
        recorder: Arc<Mutex<Recorder>>,
    }

    impl ScriptedConnector {
        fn new(steps: Vec<Step>, in_place_updates: bool) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                in_place_updates,
                recorder: Arc::new(Mutex::new(Recorder::default())),
            })
        }

        fn attempts(&self) -> Vec<Instant> {
            self.recorder.lock().unwrap().attempts.clone()
        }
    }

    #[async_trait]
    impl TunnelConnector for ScriptedConnector {
        async fn connect(
            &self,
            _token: &TunnelToken,
            routes: &RouteTable,
        ) -> std::result::Result<Box<dyn TunnelSession>, TunnelFailure> {
            self.recorder.lock().unwrap().attempts.push(Instant::now());
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::Fail(TunnelFailure::Transient("script exhausted".into())));
            match step {
                Step::Fail(failure) => Err(failure),
                Step::Connect { drop_after } => {
                    self.recorder
                        .lock()
                        .unwrap()
                        .connected_routes
                        .push(routes.clone());
                    Ok(Box::new(ScriptedSession {
                        drop_after,
                        in_place_updates: self.in_place_updates,
                        recorder: self.recorder.clone(),
                    }))
                }
            }
        }
    }

    struct ScriptedSession {
        drop_after: Option<Duration>,
        in_place_updates: bool,
        recorder: Arc<Mutex<Recorder>>,
    }

    #[async_trait]
    impl TunnelSession for ScriptedSession {
        fn supports_route_updates(&self) -> bool {
            self.in_place_updates
        }

        async fn update_routes(
            &mut self,
            routes: &RouteTable,
        ) -> std::result::Result<(), TunnelFailure> {
            self.recorder.lock().unwrap().updates.push(routes.clone());
            Ok(())
        }

        async fn closed(&mut self) -> TunnelFailure {
            match self.drop_after {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    TunnelFailure::Transient("connection reset".into())
                }
                None => std::future::pending().await,
            }
        }

        async fn shutdown(self: Box<Self>) {
            self.recorder.lock().unwrap().shutdowns += 1;
        }
    }

    fn config(token: String, backoff: BackoffPolicy) -> TunnelConfig {
        let mut routes = RouteTable::new();
        routes.insert(
            "n8n.example.com",
            RouteTarget {
                service: Some("n8n".into()),
                url: "http://127.0.0.1:5678".into(),
            },
        );
        TunnelConfig {
            token,
            routes,
            binary: "cloudflared".into(),
            backoff,
        }
    }

    fn policy(initial: u64, max: u64) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(initial),
            multiplier: 2.0,
            max: Duration::from_secs(max),
        }
    }

    async fn wait_state(handle: &TunnelHandle, state: TunnelState) -> TunnelStatus {
        handle
            .subscribe()
            .wait_for(|s| s.state == state)
            .await
            .unwrap()
            .clone()
    }

    fn transient() -> Step {
        Step::Fail(TunnelFailure::Transient("network unreachable".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_back_off_up_to_cap() {
        let mut steps: Vec<Step> = (0..6).map(|_| transient()).collect();
        steps.push(Step::Connect { drop_after: None });
        let connector = ScriptedConnector::new(steps, false);

        let handle = TunnelManager::new(config(test_token(), policy(1, 8)), connector.clone())
            .spawn(CancellationToken::new());
        let status = wait_state(&handle, TunnelState::Connected).await;
        assert_eq!(status.attempts, 7);
        assert_eq!(status.last_error.as_deref(), Some("network unreachable"));

        let attempts = connector.attempts();
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        let secs: Vec<u64> = gaps.iter().map(|g| g.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 8, 8]);
        let cap = Duration::from_secs(8);
        for pair in gaps.windows(2) {
            assert!(pair[1] <= cap);
            assert!(pair[1] > pair[0] || pair[1] == cap);
        }

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_fatal_without_retry() {
        let connector = ScriptedConnector::new(
            vec![Step::Fail(TunnelFailure::Auth("invalid tunnel secret".into()))],
            false,
        );
        let mut handle = TunnelManager::new(config(test_token(), policy(1, 8)), connector.clone())
            .spawn(CancellationToken::new());

        let err = handle.finished().await.unwrap_err();
        assert!(matches!(err, HearthError::TunnelAuth(_)));
        assert_eq!(err.exit_code(), 5);
        assert_eq!(connector.attempts().len(), 1);

        let status = handle.status();
        assert!(status.fatal);
        assert_eq!(status.state, TunnelState::Disconnected);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_token_never_connects() {
        let connector = ScriptedConnector::new(vec![Step::Connect { drop_after: None }], false);
        let handle = TunnelManager::new(config("garbage".into(), policy(1, 8)), connector.clone())
            .spawn(CancellationToken::new());

        assert!(matches!(handle.stop().await, Err(HearthError::TunnelAuth(_))));
        assert!(connector.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_change_applied_in_place() {
        let connector = ScriptedConnector::new(vec![Step::Connect { drop_after: None }], true);
        let handle = TunnelManager::new(config(test_token(), policy(1, 8)), connector.clone())
            .spawn(CancellationToken::new());
        wait_state(&handle, TunnelState::Connected).await;

        let mut status_rx = handle.subscribe();
        handle
            .set_route(
                "chat.example.com",
                RouteTarget {
                    service: Some("open-webui".into()),
                    url: "http://127.0.0.1:3000".into(),
                },
            )
            .await
            .unwrap();
        let status = status_rx
            .wait_for(|s| s.routes.len() == 2)
            .await
            .unwrap()
            .clone();

        assert_eq!(status.state, TunnelState::Connected);
        assert_eq!(status.reconnects, 0);
        assert_eq!(connector.attempts().len(), 1);
        {
            let recorder = connector.recorder.lock().unwrap();
            assert_eq!(recorder.updates.len(), 1);
            assert!(recorder.updates[0].get("chat.example.com").is_some());
        }

        handle.stop().await.unwrap();
        assert_eq!(connector.recorder.lock().unwrap().shutdowns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_change_reconnects_without_backoff() {
        let connector = ScriptedConnector::new(
            vec![
                Step::Connect { drop_after: None },
                Step::Connect { drop_after: None },
            ],
            false,
        );
        let handle = TunnelManager::new(config(test_token(), policy(1, 8)), connector.clone())
            .spawn(CancellationToken::new());
        wait_state(&handle, TunnelState::Connected).await;

        let t0 = Instant::now();
        handle.remove_route("n8n.example.com").await.unwrap();
        let status = handle
            .subscribe()
            .wait_for(|s| s.state == TunnelState::Connected && s.reconnects == 1)
            .await
            .unwrap()
            .clone();

        assert!(status.routes.is_empty());
        assert_eq!(t0.elapsed(), Duration::ZERO);
        {
            let recorder = connector.recorder.lock().unwrap();
            assert_eq!(recorder.attempts.len(), 2);
            assert!(recorder.connected_routes[1].is_empty());
            assert_eq!(recorder.shutdowns, 1);
        }
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_session_reconnects() {
        let connector = ScriptedConnector::new(
            vec![
                Step::Connect {
                    drop_after: Some(Duration::from_secs(30)),
                },
                Step::Connect { drop_after: None },
            ],
            false,
        );
        let handle = TunnelManager::new(config(test_token(), policy(2, 8)), connector.clone())
            .spawn(CancellationToken::new());

        let status = handle
            .subscribe()
            .wait_for(|s| s.state == TunnelState::Connected && s.reconnects == 1)
            .await
            .unwrap()
            .clone();
        assert_eq!(status.last_error.as_deref(), Some("connection reset"));

        let attempts = connector.attempts();
        assert_eq!(attempts[1] - attempts[0], Duration::from_secs(32));
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_backoff() {
        let connector = ScriptedConnector::new(vec![transient()], false);
        let handle = TunnelManager::new(config(test_token(), policy(300, 600)), connector.clone())
            .spawn(CancellationToken::new());
        wait_state(&handle, TunnelState::Reconnecting).await;

        let t0 = Instant::now();
        let mut status_rx = handle.subscribe();
        handle.stop().await.unwrap();
        assert!(t0.elapsed() < Duration::from_secs(1));
        assert_eq!(status_rx.borrow_and_update().state, TunnelState::Disconnected);
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_healthy_targets() {
        let mut table = StateTable::new("test", ["n8n"]);
        let (stack_tx, stack_rx) = watch::channel(table.snapshot());

        let connector = ScriptedConnector::new(vec![Step::Connect { drop_after: None }], false);
        let handle = TunnelManager::new(config(test_token(), policy(1, 8)), connector.clone())
            .wait_for_stack(stack_rx)
            .spawn(CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(connector.attempts().is_empty());
        assert_eq!(handle.status().state, TunnelState::Disconnected);

        table.transition("n8n", RuntimeState::Starting, None).unwrap();
        table.transition("n8n", RuntimeState::Healthy, None).unwrap();
        stack_tx.send_replace(table.snapshot());

        wait_state(&handle, TunnelState::Connected).await;
        assert_eq!(connector.attempts().len(), 1);
        handle.stop().await.unwrap();
    }
}
