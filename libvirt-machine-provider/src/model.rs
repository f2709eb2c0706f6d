//! Data model: `Machine`, `Volume`, their specs and statuses.
//!
//! These are the objects the Store (`crate::store`) persists and the
//! reconcilers (`crate::reconciler`) drive toward their desired state.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A declarative virtual machine spec, identified by an immutable UID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Machine {
    pub uid: String,
    /// Optimistic-concurrency counter, bumped on every `Store::update`.
    pub generation: u64,
    pub memory_bytes: u64,
    pub cpu_millis: u32,
    pub image: Option<String>,
    #[serde(default)]
    pub ignition: Option<Vec<u8>>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    #[serde(default = "default_class")]
    pub class: String,
    #[serde(default)]
    pub finalizers: HashSet<String>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: MachineStatus,
}

fn default_class() -> String {
    "default".to_string()
}

impl Machine {
    pub fn is_deleting(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers.contains(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MachineState {
    #[default]
    Pending,
    Running,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MachineStatus {
    pub state: MachineState,
    #[serde(default)]
    pub volumes: Vec<VolumeStatus>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeStatus {
    pub name: String,
    pub handle: String,
    pub state: DeviceState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkInterfaceStatus {
    pub name: String,
    pub handle: String,
    pub state: DeviceState,
    #[serde(default)]
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeviceState {
    #[default]
    Pending,
    Attached,
    Error,
}

/// One entry of `Machine.volumes`: exactly one of `empty_disk`/`connection`
/// must be set — enforced by `VolumeSpec::kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeSpec {
    pub name: String,
    pub provider: String,
    #[serde(flatten)]
    pub kind: VolumeSpecKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSpecKind {
    EmptyDisk {
        #[serde(default)]
        size_bytes: Option<u64>,
    },
    Connection {
        driver: String,
        handle: String,
        #[serde(default)]
        attributes: HashMap<String, String>,
        #[serde(default)]
        secret_data: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkInterfaceSpec {
    pub name: String,
    pub network_id: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// A standalone volume object, reconciled independently of any machine
/// (spec §4.H). Mirrors `Machine`'s finalizer/deletion shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    pub uid: String,
    pub generation: u64,
    pub name: String,
    pub spec: VolumeSpec,
    #[serde(default)]
    pub finalizers: HashSet<String>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: VolumeObjectStatus,
}

impl Volume {
    pub fn is_deleting(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers.contains(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VolumeObjectStatus {
    pub state: DeviceState,
    pub handle: String,
}

pub const MACHINE_FINALIZER: &str = "machine";
pub const VOLUME_FINALIZER: &str = "volume";

/// Stable wire identifiers for the volume plugins (spec §6).
pub const VOLUME_PLUGIN_CEPH: &str = "libvirt-provider.ironcore.dev/ceph";
pub const VOLUME_PLUGIN_EMPTY_DISK: &str = "libvirt-provider.ironcore.dev/empty-disk";

/// NIC plugin priorities (spec §6); lower sorts first.
pub const NIC_PLUGIN_ISOLATED: (&str, i32) = ("isolated", 5);
pub const NIC_PLUGIN_PROVIDERNET: (&str, i32) = ("providernet", 10);
pub const NIC_PLUGIN_APINET: (&str, i32) = ("apinet", 20);

pub const CEPH_DRIVER: &str = "ceph";
