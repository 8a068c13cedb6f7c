//! Persisted supervisor state, so separate CLI invocations share it

use crate::error::Result;
use crate::sequencer::StackSnapshot;
use crate::tunnel::TunnelStatus;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Latest stack snapshot
pub const STATE_FILE: &str = "state.json";
/// Latest tunnel status
pub const TUNNEL_FILE: &str = "tunnel.json";

/// JSON files under the project data directory
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<Option<StackSnapshot>> {
        read_json(&self.dir.join(STATE_FILE))
    }

    pub fn save(&self, snapshot: &StackSnapshot) -> Result<()> {
        write_json(&self.dir, STATE_FILE, snapshot)
    }

    pub fn load_tunnel(&self) -> Result<Option<TunnelStatus>> {
        read_json(&self.dir.join(TUNNEL_FILE))
    }

    pub fn save_tunnel(&self, status: &TunnelStatus) -> Result<()> {
        write_json(&self.dir, TUNNEL_FILE, status)
    }

    /// Persist every snapshot published on `snapshots`
    pub fn spawn_writer(&self, snapshots: watch::Receiver<StackSnapshot>) -> JoinHandle<()> {
        spawn_json_writer(self.dir.clone(), STATE_FILE, snapshots)
    }

    /// Persist every tunnel status published on `status`
    pub fn spawn_tunnel_writer(&self, status: watch::Receiver<TunnelStatus>) -> JoinHandle<()> {
        spawn_json_writer(self.dir.clone(), TUNNEL_FILE, status)
    }
}

fn spawn_json_writer<T>(dir: PathBuf, file: &'static str, mut rx: watch::Receiver<T>) -> JoinHandle<()>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            let value = rx.borrow_and_update().clone();
            if let Err(e) = write_json(&dir, file, &value) {
                tracing::warn!(file, error = %e, "Failed to persist state");
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable state file");
            Ok(None)
        }
    }
}

/// Write through a temp file and rename, so readers never see a torn file
fn write_json<T: Serialize>(dir: &Path, file: &str, value: &T) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let content = serde_json::to_string_pretty(value)?;
    let tmp = dir.join(format!("{}.tmp", file));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, dir.join(file))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::{RuntimeState, StateTable};
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        assert!(store.load().unwrap().is_none());

        let mut table = StateTable::new("lab", ["db", "app"]);
        table.transition("db", RuntimeState::Starting, None).unwrap();
        table.transition("db", RuntimeState::Healthy, None).unwrap();
        store.save(&table.snapshot()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.state("db"), RuntimeState::Healthy);
        assert_eq!(loaded.state("app"), RuntimeState::Pending);
        assert!(!temp.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join(STATE_FILE), "{not json").unwrap();
        assert!(StateStore::new(temp.path()).load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writer_follows_channel() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        let mut table = StateTable::new("lab", ["db"]);
        let (tx, rx) = watch::channel(table.snapshot());
        let writer = store.spawn_writer(rx);

        table.transition("db", RuntimeState::Starting, None).unwrap();
        tx.send_replace(table.snapshot());
        drop(tx);
        writer.await.unwrap();

        assert_eq!(
            store.load().unwrap().unwrap().state("db"),
            RuntimeState::Starting
        );
    }
}
