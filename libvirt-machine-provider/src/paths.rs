//! Deterministic on-disk layout under a configured root directory.
//!
//! `Paths::new` is a pure function from root directory to the stable
//! subpaths the rest of the crate reads and writes; nothing here touches
//! the filesystem except the `ensure_*` helpers.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{ProviderError, Result};

pub const DIR_MODE: u32 = 0o777;
pub const FILE_MODE_RW: u32 = 0o660;
pub const FILE_MODE_RW_ALL: u32 = 0o666;

#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn store_machines_dir(&self) -> PathBuf {
        self.root.join("store").join("machines")
    }

    pub fn store_volumes_dir(&self) -> PathBuf {
        self.root.join("store").join("volumes")
    }

    pub fn machine_dir(&self, uid: &str) -> PathBuf {
        self.root.join("machines").join(uid)
    }

    pub fn rootfs_dir(&self, uid: &str) -> PathBuf {
        self.machine_dir(uid).join("rootfs")
    }

    pub fn rootfs_file(&self, uid: &str) -> PathBuf {
        self.rootfs_dir(uid).join("rootfs")
    }

    pub fn volumes_dir(&self, uid: &str) -> PathBuf {
        self.machine_dir(uid).join("volumes")
    }

    pub fn volume_dir(&self, uid: &str, plugin: &str, name: &str) -> PathBuf {
        self.volumes_dir(uid).join(plugin).join(name)
    }

    pub fn volume_disk_file(&self, uid: &str, plugin: &str, name: &str) -> PathBuf {
        self.volume_dir(uid, plugin, name).join("disk.raw")
    }

    pub fn nics_dir(&self, uid: &str) -> PathBuf {
        self.machine_dir(uid).join("networkinterfaces")
    }

    pub fn nic_dir(&self, uid: &str, name: &str) -> PathBuf {
        self.nics_dir(uid).join(name)
    }

    pub fn nic_apinet_state_file(&self, uid: &str, name: &str) -> PathBuf {
        self.nic_dir(uid, name).join("api-net.json")
    }

    pub fn ignitions_dir(&self, uid: &str) -> PathBuf {
        self.machine_dir(uid).join("ignitions")
    }

    pub fn ignition_file(&self, uid: &str) -> PathBuf {
        self.ignitions_dir(uid).join("data.ign")
    }
}

/// Creates `dir` (and any missing ancestors) with `DIR_MODE`, tolerating
/// the directory already existing.
pub async fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| ProviderError::transient(dir.display().to_string(), "ensure_dir", e))?;
    set_mode(dir, DIR_MODE).await
}

/// Applies `mode` to an already-created regular file. Callers that write
/// one of the store/disk/state files named in spec §4.A call this right
/// after the write so the file ends up 0660/0666 rather than whatever the
/// process umask produced.
pub async fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    set_mode(path, mode).await
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perms)
        .await
        .map_err(|e| ProviderError::transient(path.display().to_string(), "set_mode", e))
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
