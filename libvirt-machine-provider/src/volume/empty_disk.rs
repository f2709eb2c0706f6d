use async_trait::async_trait;
use rand::Rng;

use super::raw::{self, CreateOptions};
use super::{Volume, VolumeBacking, VolumePlugin};
use crate::error::Result;
use crate::model::{Machine, VolumeSpec, VolumeSpecKind, VOLUME_PLUGIN_EMPTY_DISK};
use crate::paths::Paths;

const DEFAULT_SIZE_BYTES: u64 = 500 * 1024 * 1024;

pub struct EmptyDiskPlugin {
    paths: Paths,
}

impl EmptyDiskPlugin {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    fn random_handle() -> String {
        let bytes: [u8; 8] = rand::thread_rng().gen();
        hex::encode(bytes)
    }
}

#[async_trait]
impl VolumePlugin for EmptyDiskPlugin {
    fn name(&self) -> &str {
        VOLUME_PLUGIN_EMPTY_DISK
    }

    fn can_support(&self, spec: &VolumeSpec) -> bool {
        matches!(spec.kind, VolumeSpecKind::EmptyDisk { .. })
    }

    async fn apply(&self, spec: &VolumeSpec, machine: &Machine) -> Result<Volume> {
        let size_bytes = match &spec.kind {
            VolumeSpecKind::EmptyDisk { size_bytes } => size_bytes.unwrap_or(DEFAULT_SIZE_BYTES),
            _ => DEFAULT_SIZE_BYTES,
        };
        let path = self.paths.volume_disk_file(&machine.uid, self.name(), &spec.name);
        raw::create(
            &path,
            &CreateOptions {
                size_bytes: Some(size_bytes),
                source_file: None,
            },
        )
        .await?;

        Ok(Volume {
            handle: Self::random_handle(),
            backing: VolumeBacking::RawFile {
                path: path.display().to_string(),
            },
        })
    }

    async fn delete(&self, name: &str, machine_uid: &str) -> Result<()> {
        let dir = self.paths.volume_dir(machine_uid, self.name(), name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(crate::error::ProviderError::transient(
                dir.display().to_string(),
                "empty_disk.delete",
                e,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MachineStatus;

    fn machine(uid: &str) -> Machine {
        Machine {
            uid: uid.to_string(),
            generation: 0,
            memory_bytes: 0,
            cpu_millis: 0,
            image: None,
            ignition: None,
            volumes: vec![],
            network_interfaces: vec![],
            class: "default".to_string(),
            finalizers: Default::default(),
            deleted_at: None,
            status: MachineStatus::default(),
        }
    }

    #[tokio::test]
    async fn defaults_to_500_mib() {
        let tmp = tempfile::tempdir().unwrap();
        let plugin = EmptyDiskPlugin::new(Paths::new(tmp.path()));
        let spec = VolumeSpec {
            name: "d0".into(),
            provider: VOLUME_PLUGIN_EMPTY_DISK.into(),
            kind: VolumeSpecKind::EmptyDisk { size_bytes: None },
        };
        let volume = plugin.apply(&spec, &machine("m1")).await.unwrap();
        let path = match volume.backing {
            VolumeBacking::RawFile { path } => path,
            _ => panic!("expected raw file"),
        };
        assert_eq!(
            tokio::fs::metadata(path).await.unwrap().len(),
            DEFAULT_SIZE_BYTES
        );
        assert_eq!(DEFAULT_SIZE_BYTES, 524_288_000);
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let plugin = EmptyDiskPlugin::new(Paths::new(tmp.path()));
        let spec = VolumeSpec {
            name: "d0".into(),
            provider: VOLUME_PLUGIN_EMPTY_DISK.into(),
            kind: VolumeSpecKind::EmptyDisk {
                size_bytes: Some(1024),
            },
        };
        let first = plugin.apply(&spec, &machine("m1")).await.unwrap();
        let second = plugin.apply(&spec, &machine("m1")).await.unwrap();
        assert_eq!(first.backing, second.backing);
    }

    #[test]
    fn handle_is_16_hex_chars() {
        let handle = EmptyDiskPlugin::random_handle();
        assert_eq!(handle.len(), 16);
        assert!(handle.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
