//! Volume plugin contract and the discriminated `Volume` result type.

pub mod ceph;
pub mod empty_disk;
pub mod raw;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Machine, VolumeSpec};
use crate::registry::SupportsSpec;

/// Materialized volume result, carrying exactly one backing-storage
/// variant plus an opaque handle.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub handle: String,
    pub backing: VolumeBacking,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VolumeBacking {
    RawFile { path: String },
    Qcow2File { path: String },
    CephDisk {
        name: String,
        monitors: Vec<String>,
        auth: CephAuth,
        encryption: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CephAuth {
    pub user_name: String,
    pub user_key: String,
}

#[async_trait]
pub trait VolumePlugin: Send + Sync {
    fn name(&self) -> &str;
    fn can_support(&self, spec: &VolumeSpec) -> bool;
    async fn apply(&self, spec: &VolumeSpec, machine: &Machine) -> Result<Volume>;
    async fn delete(&self, name: &str, machine_uid: &str) -> Result<()>;
}

impl SupportsSpec<VolumeSpec> for std::sync::Arc<dyn VolumePlugin> {
    fn can_support(&self, spec: &VolumeSpec) -> bool {
        VolumePlugin::can_support(self.as_ref(), spec)
    }
}
