//! The standalone volume reconciler: a lightweight mirror of
//! `MachineReconciler` for `Volume` objects reconciled independently of
//! any machine.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::Reconciler;
use crate::error::{ProviderError, Result};
use crate::model::{DeviceState, Volume, VolumeObjectStatus, VOLUME_FINALIZER};
use crate::registry::PluginRegistry;
use crate::store::Store;
use crate::volume::VolumePlugin;

pub struct VolumeReconciler {
    pub store: Arc<dyn Store<Volume>>,
    pub volume_registry: Arc<PluginRegistry<Arc<dyn VolumePlugin>>>,
}

impl VolumeReconciler {
    async fn teardown(&self, volume: Volume) -> Result<()> {
        if !volume.has_finalizer(VOLUME_FINALIZER) {
            return Ok(());
        }

        let plugin = self.volume_registry.find_by_name(&volume.spec.provider)?;
        plugin.delete(&volume.name, &volume.uid).await?;

        let mut updated = volume;
        updated.finalizers.remove(VOLUME_FINALIZER);
        match self.store.delete(&updated.uid).await {
            Ok(()) => {}
            Err(crate::store::StoreError::NotFound { .. }) => {}
            Err(e) => {
                return Err(ProviderError::transient(
                    updated.uid.clone(),
                    "volume_teardown.remove_finalizer",
                    e,
                ))
            }
        }
        info!(uid = %updated.uid, "volume torn down");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for VolumeReconciler {
    async fn reconcile(&self, uid: &str) -> Result<()> {
        let volume = match self.store.get(uid).await {
            Ok(v) => v,
            Err(crate::store::StoreError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(ProviderError::transient(uid.to_string(), "volume_reconcile.load", e)),
        };

        if volume.is_deleting() {
            return self.teardown(volume).await;
        }

        if !volume.has_finalizer(VOLUME_FINALIZER) {
            let mut updated = volume;
            updated.finalizers.insert(VOLUME_FINALIZER.to_string());
            self.store
                .update(updated)
                .await
                .map_err(|e| ProviderError::transient(uid.to_string(), "volume_reconcile.add_finalizer", e))?;
            return Ok(());
        }

        let plugin = self.volume_registry.find_by_spec(&volume.spec)?;
        // Volumes standing alone have no owning machine; pass a
        // placeholder with just the UID so plugins materialize under a
        // directory keyed by the volume's own UID.
        let placeholder = crate::model::Machine {
            uid: volume.uid.clone(),
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
            status: Default::default(),
        };
        let applied = plugin.apply(&volume.spec, &placeholder).await?;

        let mut updated = volume;
        updated.status = VolumeObjectStatus {
            state: DeviceState::Attached,
            handle: applied.handle,
        };
        self.store
            .update(updated)
            .await
            .map_err(|e| ProviderError::transient(uid.to_string(), "volume_reconcile.update_status", e))?;
        Ok(())
    }
}
