//! NIC plugin contract and the discriminated `NetworkInterface` result type.

pub mod apinet;
pub mod isolated;
pub mod providernet;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Machine, NetworkInterfaceSpec};
use crate::paths::{ensure_dir, Paths};

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInterface {
    pub handle: String,
    pub ips: Vec<String>,
    pub kind: NicKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NicKind {
    Isolated,
    ProviderNetwork { network_name: String },
    HostDevice {
        pci_domain: u32,
        bus: u32,
        slot: u32,
        function: u32,
    },
}

#[async_trait]
pub trait NicPlugin: Send + Sync {
    fn name(&self) -> &str;
    async fn apply(&self, spec: &NetworkInterfaceSpec, machine: &Machine) -> Result<NetworkInterface>;
    async fn delete(&self, nic_name: &str, machine_uid: &str) -> Result<()>;
}

/// Ensures `machines/<uid>/networkinterfaces/<name>/` exists, as every
/// plugin's `apply` must do before materializing its device.
pub async fn ensure_nic_dir(paths: &Paths, machine_uid: &str, name: &str) -> Result<()> {
    ensure_dir(&paths.nic_dir(machine_uid, name)).await
}
