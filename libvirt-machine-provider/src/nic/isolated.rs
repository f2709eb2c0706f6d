use async_trait::async_trait;

use super::{ensure_nic_dir, NetworkInterface, NicKind, NicPlugin};
use crate::error::Result;
use crate::model::{Machine, NetworkInterfaceSpec};
use crate::paths::Paths;

pub struct IsolatedPlugin {
    paths: Paths,
}

impl IsolatedPlugin {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl NicPlugin for IsolatedPlugin {
    fn name(&self) -> &str {
        "isolated"
    }

    async fn apply(&self, spec: &NetworkInterfaceSpec, machine: &Machine) -> Result<NetworkInterface> {
        ensure_nic_dir(&self.paths, &machine.uid, &spec.name).await?;
        Ok(NetworkInterface {
            handle: format!("isolated-{}", spec.name),
            ips: spec.ips.clone(),
            kind: NicKind::Isolated,
        })
    }

    async fn delete(&self, nic_name: &str, machine_uid: &str) -> Result<()> {
        let dir = self.paths.nic_dir(machine_uid, nic_name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(crate::error::ProviderError::transient(
                dir.display().to_string(),
                "isolated.delete",
                e,
            )),
        }
    }
}
