//! Guest capability detection: out of scope beyond the `{domainType,
//! machineType}` tuple this provider consumes.

use async_trait::async_trait;

use crate::domain::GuestCapabilities;
use crate::error::Result;

#[async_trait]
pub trait GuestCapabilitiesProvider: Send + Sync {
    async fn capabilities_for_class(&self, class: &str) -> Result<GuestCapabilities>;
}

/// Returns a fixed `{kvm, q35}` pair regardless of class; a production
/// build would query libvirt's `virConnectGetCapabilities` and pick a
/// machine type from the class catalog.
pub struct StaticGuestCapabilities {
    pub domain_type: String,
    pub machine_type: String,
}

impl Default for StaticGuestCapabilities {
    fn default() -> Self {
        Self {
            domain_type: "kvm".to_string(),
            machine_type: "q35".to_string(),
        }
    }
}

#[async_trait]
impl GuestCapabilitiesProvider for StaticGuestCapabilities {
    async fn capabilities_for_class(&self, _class: &str) -> Result<GuestCapabilities> {
        Ok(GuestCapabilities {
            domain_type: self.domain_type.clone(),
            machine_type: self.machine_type.clone(),
        })
    }
}
