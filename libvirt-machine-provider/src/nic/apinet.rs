//! The `apinet` NIC plugin: the only stateful NIC plugin.
//!
//! Applies an interface object to an external control-plane client under
//! a deterministic name, then bounded-polls for it to come up as a PCI
//! host device.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use hostname::get as host_hostname;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::{ensure_nic_dir, NetworkInterface, NicKind, NicPlugin};
use crate::error::{ProviderError, Result};
use crate::model::{Machine, NetworkInterfaceSpec};
use crate::paths::Paths;

const APPLY_TIMEOUT: Duration = Duration::from_secs(5);
const DELETE_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// apinet's own namespace UUID for deriving `uuid_v5` network-interface
/// names; arbitrary but fixed so names are stable across restarts.
const APINET_UUID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0xa4, 0x59, 0xea, 0x42, 0xe1, 0x4d, 0x5f, 0x92, 0x94, 0x40, 0x1a, 0xf8, 0x1c, 0x8c, 0xa9,
]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiNetState {
    Pending,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub struct PciAddressHex {
    pub domain: String,
    pub bus: String,
    pub slot: String,
    pub function: String,
}

#[derive(Debug, Clone)]
pub struct ApiNetStatus {
    pub state: ApiNetState,
    pub pci_address: Option<PciAddressHex>,
}

/// The external apinet control plane. A production build would talk to
/// it over gRPC; here it is a trait so tests can drive it deterministically.
#[async_trait]
pub trait ApiNetClient: Send + Sync {
    async fn apply(&self, name: &str, namespace: &str, node_name: &str, ips: &[String]) -> Result<()>;
    async fn get_status(&self, name: &str) -> Result<ApiNetStatus>;
    /// Deletes the object; tolerant of it already being gone.
    async fn delete(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiNetLocalState {
    namespace: String,
}

/// Placeholder wired in by the binary until a real control-plane client
/// is configured; every call fails transiently so `apply` times out
/// rather than fabricating a host device.
pub struct UnsupportedApiNetClient;

#[async_trait]
impl ApiNetClient for UnsupportedApiNetClient {
    async fn apply(&self, name: &str, _namespace: &str, _node_name: &str, _ips: &[String]) -> Result<()> {
        Err(ProviderError::transient(
            name.to_string(),
            "apinet.apply",
            anyhow::anyhow!("no apinet client configured"),
        ))
    }

    async fn get_status(&self, name: &str) -> Result<ApiNetStatus> {
        Err(ProviderError::transient(
            name.to_string(),
            "apinet.get_status",
            anyhow::anyhow!("no apinet client configured"),
        ))
    }

    async fn delete(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

pub struct ApiNetPlugin {
    paths: Paths,
    client: std::sync::Arc<dyn ApiNetClient>,
    node_name: String,
}

impl ApiNetPlugin {
    pub fn new(paths: Paths, client: std::sync::Arc<dyn ApiNetClient>) -> Self {
        let node_name = host_hostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            paths,
            client,
            node_name,
        }
    }

    fn object_name(machine_uid: &str, nic_name: &str) -> String {
        Uuid::new_v5(
            &APINET_UUID_NAMESPACE,
            format!("{machine_uid}/{nic_name}").as_bytes(),
        )
        .to_string()
    }

    fn parse_network_id(network_id: &str) -> Result<(String, String)> {
        let mut parts = network_id.splitn(2, '/');
        let namespace = parts.next().unwrap_or_default();
        let network_name = parts.next().unwrap_or_default();
        if namespace.is_empty() || network_name.is_empty() {
            return Err(ProviderError::invalid_spec(
                network_id,
                "apinet.parse_network_id",
                "expected \"<namespace>/<networkName>\"",
            ));
        }
        Ok((namespace.to_string(), network_name.to_string()))
    }

    async fn write_local_state(&self, state_path: &Path, namespace: &str) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&ApiNetLocalState {
            namespace: namespace.to_string(),
        })
        .expect("ApiNetLocalState always serializes");
        tokio::fs::write(state_path, bytes)
            .await
            .map_err(|e| ProviderError::transient(state_path.display().to_string(), "apinet.apply", e))?;
        crate::paths::set_file_mode(state_path, crate::paths::FILE_MODE_RW).await
    }

    async fn read_local_state(&self, state_path: &Path) -> Result<ApiNetLocalState> {
        let bytes = tokio::fs::read(state_path)
            .await
            .map_err(|e| ProviderError::transient(state_path.display().to_string(), "apinet.delete", e))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ProviderError::invalid_spec(state_path.display().to_string(), "apinet.delete", e.to_string())
        })
    }
}

fn parse_hex_u32(value: &str, field: &'static str) -> Result<u32> {
    u32::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| ProviderError::invalid_spec(field, "apinet.parse_pci_address", e.to_string()))
}

#[async_trait]
impl NicPlugin for ApiNetPlugin {
    fn name(&self) -> &str {
        "apinet"
    }

    async fn apply(&self, spec: &NetworkInterfaceSpec, machine: &Machine) -> Result<NetworkInterface> {
        ensure_nic_dir(&self.paths, &machine.uid, &spec.name).await?;
        let (namespace, _network_name) = Self::parse_network_id(&spec.network_id)?;
        let state_path = self.paths.nic_apinet_state_file(&machine.uid, &spec.name);
        self.write_local_state(&state_path, &namespace).await?;

        let object_name = Self::object_name(&machine.uid, &spec.name);
        self.client
            .apply(&object_name, &namespace, &self.node_name, &spec.ips)
            .await?;

        let deadline = Instant::now() + APPLY_TIMEOUT;
        loop {
            let status = self.client.get_status(&object_name).await?;
            match status.state {
                ApiNetState::Error => {
                    return Err(ProviderError::transient(
                        spec.name.clone(),
                        "apinet.apply",
                        anyhow::anyhow!("interface is in state error"),
                    ))
                }
                ApiNetState::Ready => {
                    if let Some(pci) = status.pci_address {
                        return Ok(NetworkInterface {
                            handle: object_name,
                            ips: spec.ips.clone(),
                            kind: NicKind::HostDevice {
                                pci_domain: parse_hex_u32(&pci.domain, "pciAddress.domain")?,
                                bus: parse_hex_u32(&pci.bus, "pciAddress.bus")?,
                                slot: parse_hex_u32(&pci.slot, "pciAddress.slot")?,
                                function: parse_hex_u32(&pci.function, "pciAddress.function")?,
                            },
                        });
                    }
                }
                ApiNetState::Pending => {}
            }
            if Instant::now() >= deadline {
                return Err(ProviderError::transient(
                    spec.name.clone(),
                    "apinet.apply",
                    anyhow::anyhow!("timed out waiting for interface to become ready"),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn delete(&self, nic_name: &str, machine_uid: &str) -> Result<()> {
        let state_path = self.paths.nic_apinet_state_file(machine_uid, nic_name);
        if !state_path.exists() {
            return Ok(());
        }
        let _state = self.read_local_state(&state_path).await?;
        let object_name = Self::object_name(machine_uid, nic_name);

        match self.client.delete(&object_name).await {
            Ok(()) => {}
            Err(ProviderError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let deadline = Instant::now() + DELETE_TIMEOUT;
        loop {
            match self.client.get_status(&object_name).await {
                Err(ProviderError::NotFound { .. }) => break,
                Ok(_) | Err(_) => {
                    if Instant::now() >= deadline {
                        return Err(ProviderError::transient(
                            nic_name.to_string(),
                            "apinet.delete",
                            anyhow::anyhow!("timed out waiting for interface to disappear"),
                        ));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        let dir = self.paths.nic_dir(machine_uid, nic_name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProviderError::transient(dir.display().to_string(), "apinet.delete", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MachineStatus;
    use std::sync::Mutex;

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

    fn spec() -> NetworkInterfaceSpec {
        NetworkInterfaceSpec {
            name: "n0".into(),
            network_id: "ns/net".into(),
            ips: vec!["10.0.0.2".into()],
            attributes: Default::default(),
        }
    }

    struct FakeClient {
        ready_after_polls: u32,
        polls: Mutex<u32>,
        deleted: Mutex<bool>,
    }

    #[async_trait]
    impl ApiNetClient for FakeClient {
        async fn apply(&self, _name: &str, _namespace: &str, _node_name: &str, _ips: &[String]) -> Result<()> {
            Ok(())
        }

        async fn get_status(&self, _name: &str) -> Result<ApiNetStatus> {
            if *self.deleted.lock().unwrap() {
                return Err(ProviderError::not_found("iface", "get_status"));
            }
            let mut polls = self.polls.lock().unwrap();
            *polls += 1;
            if *polls >= self.ready_after_polls {
                Ok(ApiNetStatus {
                    state: ApiNetState::Ready,
                    pci_address: Some(PciAddressHex {
                        domain: "0000".into(),
                        bus: "01".into(),
                        slot: "00".into(),
                        function: "0".into(),
                    }),
                })
            } else {
                Ok(ApiNetStatus {
                    state: ApiNetState::Pending,
                    pci_address: None,
                })
            }
        }

        async fn delete(&self, _name: &str) -> Result<()> {
            *self.deleted.lock().unwrap() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn apply_converges_to_host_device() {
        let tmp = tempfile::tempdir().unwrap();
        let client = std::sync::Arc::new(FakeClient {
            ready_after_polls: 2,
            polls: Mutex::new(0),
            deleted: Mutex::new(false),
        });
        let plugin = ApiNetPlugin::new(Paths::new(tmp.path()), client);
        let nic = plugin.apply(&spec(), &machine("m1")).await.unwrap();
        match nic.kind {
            NicKind::HostDevice { bus, .. } => assert_eq!(bus, 1),
            _ => panic!("expected host device"),
        }
    }

    #[tokio::test]
    async fn apply_times_out_when_never_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let client = std::sync::Arc::new(FakeClient {
            ready_after_polls: u32::MAX,
            polls: Mutex::new(0),
            deleted: Mutex::new(false),
        });
        let plugin = ApiNetPlugin::new(Paths::new(tmp.path()), client);
        let start = std::time::Instant::now();
        let err = plugin.apply(&spec(), &machine("m1")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transient { .. }));
        assert!(start.elapsed() >= APPLY_TIMEOUT);
        // Marker directory remains for retry.
        assert!(Paths::new(tmp.path()).nic_dir("m1", "n0").is_dir());
    }

    #[test]
    fn rejects_network_id_without_namespace_separator() {
        assert!(ApiNetPlugin::parse_network_id("noSeparator").is_err());
    }

    #[test]
    fn object_name_is_deterministic() {
        let a = ApiNetPlugin::object_name("m1", "n0");
        let b = ApiNetPlugin::object_name("m1", "n0");
        assert_eq!(a, b);
    }
}
