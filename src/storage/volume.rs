//! Host-backed named volumes

use crate::error::{HearthError, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Registry file inside the volumes directory
pub const VOLUMES_FILE: &str = "volumes.json";

/// A named volume and the service it was first created for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    /// Empty when no service mounts it
    pub owner: String,
    pub mountpoint: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Volume {
    fn new(name: &str, owner: &str, data_path: &Path) -> Self {
        Self {
            name: name.to_string(),
            owner: owner.to_string(),
            mountpoint: data_path.join(name),
            created_at: Utc::now(),
        }
    }

    /// Bytes used by regular files under the mountpoint
    pub fn size(&self) -> Result<u64> {
        if !self.mountpoint.exists() {
            return Ok(0);
        }
        Ok(walkdir::WalkDir::new(&self.mountpoint)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.metadata().ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(HearthError::Volume(format!("invalid volume name '{}'", name)))
    }
}

/// Volume directories under `<data dir>/volumes/data`, indexed by `volumes.json`
pub struct VolumeManager {
    volumes: Arc<RwLock<BTreeMap<String, Volume>>>,
    base_path: PathBuf,
    data_path: PathBuf,
}

impl VolumeManager {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        let data_path = base_path.join("data");
        std::fs::create_dir_all(&data_path)?;

        let registry = base_path.join(VOLUMES_FILE);
        let volumes = if registry.exists() {
            let content = std::fs::read_to_string(&registry)?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            volumes: Arc::new(RwLock::new(volumes)),
            base_path,
            data_path,
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Volume>>> {
        self.volumes
            .read()
            .map_err(|_| HearthError::Lock("volume registry poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Volume>>> {
        self.volumes
            .write()
            .map_err(|_| HearthError::Lock("volume registry poisoned".to_string()))
    }

    fn persist(&self, volumes: &BTreeMap<String, Volume>) -> Result<()> {
        let path = self.base_path.join(VOLUMES_FILE);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(volumes)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Create a volume on first use; returns the volume and whether it was created
    pub fn ensure(&self, name: &str, owner: &str) -> Result<(Volume, bool)> {
        validate_name(name)?;
        let mut volumes = self.write()?;

        if let Some(volume) = volumes.get(name) {
            std::fs::create_dir_all(&volume.mountpoint)?;
            return Ok((volume.clone(), false));
        }

        let volume = Volume::new(name, owner, &self.data_path);
        std::fs::create_dir_all(&volume.mountpoint)?;
        volumes.insert(name.to_string(), volume.clone());
        self.persist(&volumes)?;

        tracing::info!(volume = name, owner, "Created volume");
        Ok((volume, true))
    }

    pub fn get(&self, name: &str) -> Result<Volume> {
        self.read()?
            .get(name)
            .cloned()
            .ok_or_else(|| HearthError::VolumeNotFound(name.to_string()))
    }

    pub fn list(&self) -> Result<Vec<Volume>> {
        Ok(self.read()?.values().cloned().collect())
    }

    /// Destroy a volume's data and forget it
    pub fn wipe(&self, name: &str) -> Result<()> {
        let mut volumes = self.write()?;
        let mountpoint = volumes
            .get(name)
            .map(|v| v.mountpoint.clone())
            .ok_or_else(|| HearthError::VolumeNotFound(name.to_string()))?;

        // the entry goes only once the data is gone, so a failed delete can be retried
        if mountpoint.exists() {
            std::fs::remove_dir_all(&mountpoint)?;
        }
        volumes.remove(name);
        self.persist(&volumes)?;

        tracing::warn!(volume = name, "Wiped volume");
        Ok(())
    }

    /// Archive a volume to `.tar.gz`; `dest` may be a directory or a file path
    pub fn backup(&self, name: &str, dest: &Path) -> Result<PathBuf> {
        let volume = self.get(name)?;
        let archive = if dest.is_dir() {
            dest.join(format!(
                "{}-{}.tar.gz",
                name,
                Utc::now().format("%Y%m%dT%H%M%SZ")
            ))
        } else {
            dest.to_path_buf()
        };

        let file = File::create(&archive)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        if volume.mountpoint.exists() {
            builder.append_dir_all(".", &volume.mountpoint)?;
        }
        builder.into_inner()?.finish()?;

        tracing::info!(volume = name, archive = %archive.display(), "Backed up volume");
        Ok(archive)
    }

    /// Replace a volume's contents with an archive made by [`backup`](Self::backup)
    pub fn restore(&self, name: &str, archive: &Path, owner: &str) -> Result<Volume> {
        if !archive.is_file() {
            return Err(HearthError::Volume(format!(
                "archive {} does not exist",
                archive.display()
            )));
        }

        let (volume, _) = self.ensure(name, owner)?;
        std::fs::remove_dir_all(&volume.mountpoint)?;
        std::fs::create_dir_all(&volume.mountpoint)?;

        let file = File::open(archive)?;
        let mut unpacker = tar::Archive::new(GzDecoder::new(file));
        unpacker.unpack(&volume.mountpoint).map_err(|e| {
            HearthError::Volume(format!("failed to unpack {}: {}", archive.display(), e))
        })?;

        tracing::info!(volume = name, archive = %archive.display(), "Restored volume");
        Ok(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_volume() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();

        let (volume, created) = manager.ensure("db_storage", "postgres").unwrap();
        assert!(created);
        assert_eq!(volume.owner, "postgres");
        assert!(volume.mountpoint.exists());

        let (again, created) = manager.ensure("db_storage", "postgres").unwrap();
        assert!(!created);
        assert_eq!(again.created_at, volume.created_at);
    }

    #[test]
    fn test_registry_survives_reload() {
        let temp = tempdir().unwrap();
        {
            let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
            manager.ensure("n8n_storage", "n8n").unwrap();
        }

        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        assert_eq!(manager.get("n8n_storage").unwrap().owner, "n8n");
        let (_, created) = manager.ensure("n8n_storage", "n8n").unwrap();
        assert!(!created);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        assert!(manager.ensure("../etc", "x").is_err());
        assert!(manager.ensure("", "x").is_err());
    }

    #[test]
    fn test_backup_wipe_restore() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().join("volumes")).unwrap();

        let (volume, _) = manager.ensure("db_storage", "postgres").unwrap();
        std::fs::create_dir_all(volume.mountpoint.join("base")).unwrap();
        std::fs::write(volume.mountpoint.join("base/1234"), b"pages").unwrap();
        std::fs::write(volume.mountpoint.join("PG_VERSION"), b"16").unwrap();
        assert_eq!(volume.size().unwrap(), 7);

        let backups = temp.path().join("backups");
        std::fs::create_dir_all(&backups).unwrap();
        let archive = manager.backup("db_storage", &backups).unwrap();
        assert!(archive.exists());

        manager.wipe("db_storage").unwrap();
        assert!(!volume.mountpoint.exists());
        assert!(matches!(
            manager.get("db_storage"),
            Err(HearthError::VolumeNotFound(_))
        ));

        let restored = manager.restore("db_storage", &archive, "postgres").unwrap();
        assert_eq!(
            std::fs::read(restored.mountpoint.join("base/1234")).unwrap(),
            b"pages"
        );
        assert_eq!(
            std::fs::read(restored.mountpoint.join("PG_VERSION")).unwrap(),
            b"16"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_wipe_keeps_registry_entry() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        let (volume, _) = manager.ensure("db_storage", "postgres").unwrap();
        let locked = volume.mountpoint.join("base");
        std::fs::create_dir_all(&locked).unwrap();
        std::fs::write(locked.join("1234"), b"pages").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o500)).unwrap();

        let result = manager.wipe("db_storage");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o700)).unwrap();
        if result.is_err() {
            assert_eq!(manager.get("db_storage").unwrap(), volume);
            let reloaded = VolumeManager::new(temp.path().to_path_buf()).unwrap();
            assert!(reloaded.get("db_storage").is_ok());
            manager.wipe("db_storage").unwrap();
        }
        // as root the permissions never stop the first delete
        assert!(!volume.mountpoint.exists());
        assert!(matches!(
            manager.get("db_storage"),
            Err(HearthError::VolumeNotFound(_))
        ));
    }

    #[test]
    fn test_wipe_unknown_volume() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        assert!(matches!(
            manager.wipe("missing"),
            Err(HearthError::VolumeNotFound(_))
        ));
    }
}
