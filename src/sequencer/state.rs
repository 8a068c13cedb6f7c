//! Per-service runtime state and the table that owns it

use crate::error::{HearthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of one service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    /// Waiting for dependencies
    #[default]
    Pending,
    /// Container launched, health check not yet passed
    Starting,
    /// Health check passed
    Healthy,
    /// Was healthy, health check now failing
    Unhealthy,
    /// Not running
    Stopped,
    /// Did not become healthy, or exited
    Failed,
}

impl RuntimeState {
    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(self, next: RuntimeState) -> bool {
        use RuntimeState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Stopped)
                | (Starting, Healthy)
                | (Starting, Failed)
                | (Starting, Stopped)
                | (Healthy, Unhealthy)
                | (Healthy, Failed)
                | (Healthy, Stopped)
                | (Unhealthy, Healthy)
                | (Unhealthy, Failed)
                | (Unhealthy, Stopped)
                | (Stopped, Pending)
                | (Failed, Pending)
                | (Failed, Stopped)
        )
    }

    /// Whether a container is expected to exist for this state
    pub fn is_running(self) -> bool {
        matches!(
            self,
            RuntimeState::Starting | RuntimeState::Healthy | RuntimeState::Unhealthy
        )
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeState::Pending => write!(f, "pending"),
            RuntimeState::Starting => write!(f, "starting"),
            RuntimeState::Healthy => write!(f, "healthy"),
            RuntimeState::Unhealthy => write!(f, "unhealthy"),
            RuntimeState::Stopped => write!(f, "stopped"),
            RuntimeState::Failed => write!(f, "failed"),
        }
    }
}

/// Status record for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Service name
    pub name: String,
    /// Current state
    pub state: RuntimeState,
    /// When the current state was entered
    pub since: DateTime<Utc>,
    /// Position in the order services reached Healthy during the current run
    pub healthy_seq: Option<u64>,
    /// Last failure, if any
    pub last_error: Option<String>,
}

impl ServiceStatus {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RuntimeState::Pending,
            since: Utc::now(),
            healthy_seq: None,
            last_error: None,
        }
    }
}

/// Read-only copy of the state table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackSnapshot {
    /// Project name
    pub project: String,
    /// Identifier of the run that last started services
    pub run_id: Option<String>,
    /// Per-service status
    pub services: BTreeMap<String, ServiceStatus>,
    /// Next healthy sequence number
    #[serde(default)]
    pub next_seq: u64,
    /// Snapshot time
    pub updated_at: DateTime<Utc>,
}

impl StackSnapshot {
    /// State of a service, Pending if unknown
    pub fn state(&self, service: &str) -> RuntimeState {
        self.services
            .get(service)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Whether a service is Healthy
    pub fn is_healthy(&self, service: &str) -> bool {
        self.state(service) == RuntimeState::Healthy
    }

    /// Services in the order they reached Healthy
    pub fn healthy_order(&self) -> Vec<String> {
        let mut healthy: Vec<&ServiceStatus> = self
            .services
            .values()
            .filter(|s| s.healthy_seq.is_some())
            .collect();
        healthy.sort_by_key(|s| s.healthy_seq);
        healthy.into_iter().map(|s| s.name.clone()).collect()
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub service: String,
    pub from: RuntimeState,
    pub to: RuntimeState,
}

/// The single owned table of service states.
///
/// Only the sequencer holds a `StateTable`; everybody else reads
/// [`StackSnapshot`]s.
#[derive(Debug, Clone)]
pub struct StateTable {
    project: String,
    run_id: Option<String>,
    services: BTreeMap<String, ServiceStatus>,
    next_seq: u64,
    history: Vec<Transition>,
}

impl StateTable {
    /// Fresh table with every service Pending
    pub fn new<'a, I>(project: &str, services: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self {
            project: project.to_string(),
            run_id: None,
            services: services
                .into_iter()
                .map(|name| (name.to_string(), ServiceStatus::new(name)))
                .collect(),
            next_seq: 0,
            history: Vec::new(),
        }
    }

    /// Rebuild from a persisted snapshot, keeping only known services
    pub fn restore<'a, I>(snapshot: StackSnapshot, services: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut table = Self::new(&snapshot.project, services);
        table.run_id = snapshot.run_id;
        table.next_seq = snapshot.next_seq;
        for (name, status) in snapshot.services {
            if let Some(slot) = table.services.get_mut(&name) {
                *slot = status;
            }
        }
        table
    }

    /// Current run identifier
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Set the run identifier
    pub fn set_run_id(&mut self, run_id: String) {
        self.run_id = Some(run_id);
    }

    /// Status of a service
    pub fn get(&self, service: &str) -> Option<&ServiceStatus> {
        self.services.get(service)
    }

    /// State of a service, Pending if unknown
    pub fn state(&self, service: &str) -> RuntimeState {
        self.services
            .get(service)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Apply a state change, rejecting ones the state machine forbids
    pub fn transition(
        &mut self,
        service: &str,
        to: RuntimeState,
        error: Option<String>,
    ) -> Result<()> {
        let status = self
            .services
            .get_mut(service)
            .ok_or_else(|| HearthError::ServiceNotFound(service.to_string()))?;

        let from = status.state;
        if !from.can_transition_to(to) {
            return Err(HearthError::Internal(format!(
                "invalid transition for {}: {} -> {}",
                service, from, to
            )));
        }

        status.state = to;
        status.since = Utc::now();
        match to {
            RuntimeState::Healthy if from == RuntimeState::Starting => {
                status.healthy_seq = Some(self.next_seq);
                self.next_seq += 1;
                status.last_error = None;
            }
            RuntimeState::Healthy => status.last_error = None,
            RuntimeState::Pending | RuntimeState::Stopped => {
                status.healthy_seq = None;
                if to == RuntimeState::Pending {
                    status.last_error = None;
                }
            }
            RuntimeState::Failed => status.healthy_seq = None,
            _ => {}
        }
        if error.is_some() {
            status.last_error = error;
        }

        tracing::debug!(service, %from, %to, "State transition");
        self.history.push(Transition {
            service: service.to_string(),
            from,
            to,
        });
        Ok(())
    }

    /// Overwrite a state without the state machine, used only to reconcile
    /// persisted state with what the runtime reports
    pub fn reconcile(&mut self, service: &str, state: RuntimeState, note: Option<String>) {
        if let Some(status) = self.services.get_mut(service) {
            if status.state != state {
                tracing::info!(service, from = %status.state, to = %state, "Reconciled with runtime");
                status.state = state;
                status.since = Utc::now();
                if !state.is_running() {
                    status.healthy_seq = None;
                }
                if note.is_some() {
                    status.last_error = note;
                }
            }
        }
    }

    /// Order in which services must be stopped: services that never became
    /// Healthy this run first (reverse start order), then the rest in exact
    /// reverse of the order they reached Healthy
    pub fn stop_order(&self, start_order: &[String]) -> Vec<String> {
        let mut unsequenced: Vec<String> = start_order
            .iter()
            .rev()
            .filter(|name| {
                self.services
                    .get(name.as_str())
                    .map(|s| s.healthy_seq.is_none() && s.state != RuntimeState::Stopped)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let mut sequenced: Vec<&ServiceStatus> = self
            .services
            .values()
            .filter(|s| s.healthy_seq.is_some() && s.state != RuntimeState::Stopped)
            .collect();
        sequenced.sort_by_key(|s| std::cmp::Reverse(s.healthy_seq));

        unsequenced.extend(sequenced.into_iter().map(|s| s.name.clone()));
        unsequenced
    }

    /// Services currently in a given state
    pub fn in_state(&self, state: RuntimeState) -> Vec<String> {
        self.services
            .values()
            .filter(|s| s.state == state)
            .map(|s| s.name.clone())
            .collect()
    }

    /// All transitions applied through this table
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Consistent copy for readers
    pub fn snapshot(&self) -> StackSnapshot {
        StackSnapshot {
            project: self.project.clone(),
            run_id: self.run_id.clone(),
            services: self.services.clone(),
            next_seq: self.next_seq,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StateTable {
        StateTable::new("test", ["db", "app", "ui"])
    }

    #[test]
    fn test_new_table_is_pending() {
        let t = table();
        assert_eq!(t.state("db"), RuntimeState::Pending);
        assert_eq!(t.in_state(RuntimeState::Pending).len(), 3);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut t = table();
        assert!(t.transition("db", RuntimeState::Healthy, None).is_err());
        assert_eq!(t.state("db"), RuntimeState::Pending);
        assert!(t.history().is_empty());
    }

    #[test]
    fn test_healthy_sequence_and_stop_order() {
        let mut t = table();
        let start_order: Vec<String> = ["db", "app", "ui"].iter().map(|s| s.to_string()).collect();
        for name in &start_order {
            t.transition(name, RuntimeState::Starting, None).unwrap();
            t.transition(name, RuntimeState::Healthy, None).unwrap();
        }
        assert_eq!(t.snapshot().healthy_order(), start_order);
        assert_eq!(t.stop_order(&start_order), vec!["ui", "app", "db"]);

        // a flap to Unhealthy and back keeps the original position
        t.transition("db", RuntimeState::Unhealthy, Some("probe failed".into())).unwrap();
        t.transition("db", RuntimeState::Healthy, None).unwrap();
        assert_eq!(t.stop_order(&start_order), vec!["ui", "app", "db"]);
    }

    #[test]
    fn test_stop_order_puts_unsequenced_first() {
        let mut t = table();
        let start_order: Vec<String> = ["db", "app", "ui"].iter().map(|s| s.to_string()).collect();
        t.transition("db", RuntimeState::Starting, None).unwrap();
        t.transition("db", RuntimeState::Healthy, None).unwrap();
        t.transition("app", RuntimeState::Starting, None).unwrap();
        assert_eq!(t.stop_order(&start_order), vec!["ui", "app", "db"]);

        t.transition("ui", RuntimeState::Stopped, None).unwrap();
        assert_eq!(t.stop_order(&start_order), vec!["app", "db"]);
    }

    #[test]
    fn test_restore_round_trips_through_snapshot() {
        let mut t = table();
        t.set_run_id("run-1".into());
        t.transition("db", RuntimeState::Starting, None).unwrap();
        t.transition("db", RuntimeState::Healthy, None).unwrap();

        let json = serde_json::to_string(&t.snapshot()).unwrap();
        let snapshot: StackSnapshot = serde_json::from_str(&json).unwrap();
        let restored = StateTable::restore(snapshot, ["db", "app"]);

        assert_eq!(restored.state("db"), RuntimeState::Healthy);
        assert_eq!(restored.run_id(), Some("run-1"));
        assert!(restored.get("ui").is_none());
        assert_eq!(restored.snapshot().next_seq, 1);
    }
}
