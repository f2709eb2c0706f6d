//! The machine reconciler: per-UID state machine driving a `Machine`
//! toward a running (or torn down) libvirt domain.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::Reconciler;
use crate::domain::{self, DomainAssemblerOptions};
use crate::error::{ProviderError, Result};
use crate::guestcaps::GuestCapabilitiesProvider;
use crate::hypervisor::HypervisorClient;
use crate::imagecache::ImageCache;
use crate::model::{
    DeviceState, Machine, MachineState, MachineStatus, NetworkInterfaceStatus, VolumeStatus,
    MACHINE_FINALIZER,
};
use crate::nic::NicPlugin;
use crate::paths::Paths;
use crate::registry::PluginRegistry;
use crate::store::Store;
use crate::volume::VolumePlugin;

pub struct MachineReconciler {
    pub store: Arc<dyn Store<Machine>>,
    pub hypervisor: Arc<dyn HypervisorClient>,
    pub image_cache: Arc<dyn ImageCache>,
    pub guest_caps: Arc<dyn GuestCapabilitiesProvider>,
    pub volume_registry: Arc<PluginRegistry<Arc<dyn VolumePlugin>>>,
    pub nic_registry: Arc<PluginRegistry<Arc<dyn NicPlugin>>>,
    pub paths: Paths,
    pub domain_opts: DomainAssemblerOptions,
}

impl MachineReconciler {
    async fn select_nic_plugin(&self, spec: &crate::model::NetworkInterfaceSpec) -> Result<Arc<dyn NicPlugin>> {
        match spec.attributes.get("provider") {
            Some(name) => self.nic_registry.find_by_name(name),
            None => self.nic_registry.default_plugin(),
        }
    }

    async fn apply_devices(
        &self,
        machine: &Machine,
    ) -> Result<(
        Vec<(String, crate::volume::Volume)>,
        Vec<(String, crate::nic::NetworkInterface)>,
    )> {
        let mut volumes = Vec::with_capacity(machine.volumes.len());
        for spec in &machine.volumes {
            let plugin = self.volume_registry.find_by_spec(spec)?;
            let volume = plugin.apply(spec, machine).await?;
            volumes.push((spec.name.clone(), volume));
        }

        let mut nics = Vec::with_capacity(machine.network_interfaces.len());
        for spec in &machine.network_interfaces {
            let plugin = self.select_nic_plugin(spec).await?;
            let nic = plugin.apply(spec, machine).await?;
            nics.push((spec.name.clone(), nic));
        }

        Ok((volumes, nics))
    }

    async fn create_domain(&self, machine: &Machine) -> Result<Machine> {
        let (volumes, nics) = self.apply_devices(machine).await?;

        let caps = self.guest_caps.capabilities_for_class(&machine.class).await?;
        let image = match &machine.image {
            Some(image_ref) => Some(self.image_cache.resolve(image_ref).await?),
            None => None,
        };

        let xml = domain::assemble_domain_xml(
            machine,
            &caps,
            image.as_ref(),
            &volumes,
            &nics,
            &self.paths,
            &self.domain_opts,
        )
        .await?;

        self.hypervisor.create_domain_xml(&machine.uid, &xml).await?;
        info!(uid = %machine.uid, "domain created");

        Ok(with_status(machine, &volumes, &nics))
    }

    /// Drift reconciliation: compares the observed domain XML's device
    /// aliases against the desired spec, detaches devices with no desired
    /// counterpart, re-attaches anything whose freshly-assembled fragment
    /// differs from what is observed, and removes on-disk marker
    /// directories for devices no longer in the spec (spec §4.G
    /// "Reconcile drift"). Real libvirt XML diffing would parse the
    /// returned document into a DOM; here device boundaries are found by
    /// alias-name search, which is enough to drive attach/detach/byte
    /// comparison without a full XML parser.
    async fn reconcile_drift(&self, machine: &Machine, domain: &crate::hypervisor::DomainHandle) -> Result<Machine> {
        let observed_xml = self.hypervisor.get_xml_desc(domain).await?;
        let (volumes, nics) = self.apply_devices(machine).await?;

        let mut failures = 0usize;
        let mut attempted = 0usize;

        let observed_nic_aliases = observed_aliases(&observed_xml, crate::domain::NIC_ALIAS_PREFIX);
        let desired_nic_aliases: std::collections::HashSet<String> = nics
            .iter()
            .map(|(name, _)| format!("{}{}", crate::domain::NIC_ALIAS_PREFIX, name))
            .collect();
        for stale in observed_nic_aliases.difference(&desired_nic_aliases) {
            attempted += 1;
            debug!(uid = %machine.uid, alias = %stale, "detaching stale nic");
            if self.hypervisor.detach_device(domain, stale).await.is_err() {
                failures += 1;
            }
        }

        let observed_volume_aliases = observed_aliases(&observed_xml, crate::domain::VOLUME_ALIAS_PREFIX);
        let desired_volume_aliases: std::collections::HashSet<String> = volumes
            .iter()
            .map(|(name, _)| format!("{}{}", crate::domain::VOLUME_ALIAS_PREFIX, name))
            .collect();
        for stale in observed_volume_aliases.difference(&desired_volume_aliases) {
            attempted += 1;
            debug!(uid = %machine.uid, alias = %stale, "detaching stale volume");
            if self.hypervisor.detach_device(domain, stale).await.is_err() {
                failures += 1;
            }
        }

        for (name, nic) in &nics {
            let alias = format!("{}{}", crate::domain::NIC_ALIAS_PREFIX, name);
            let fragment = crate::domain::nic_device_xml(name, nic)?;
            if observed_nic_aliases.contains(&alias) && observed_xml.contains(&fragment) {
                continue;
            }
            attempted += 1;
            debug!(uid = %machine.uid, nic = %name, "attaching drifted nic");
            if observed_nic_aliases.contains(&alias) && self.hypervisor.detach_device(domain, &alias).await.is_err() {
                failures += 1;
                continue;
            }
            if self.hypervisor.attach_device(domain, &fragment).await.is_err() {
                failures += 1;
            }
        }

        for (name, volume) in &volumes {
            let alias = format!("{}{}", crate::domain::VOLUME_ALIAS_PREFIX, name);
            let fragment = crate::domain::volume_device_xml(name, volume)?;
            if observed_volume_aliases.contains(&alias) && observed_xml.contains(&fragment) {
                continue;
            }
            attempted += 1;
            debug!(uid = %machine.uid, volume = %name, "attaching drifted volume");
            if observed_volume_aliases.contains(&alias) && self.hypervisor.detach_device(domain, &alias).await.is_err() {
                failures += 1;
                continue;
            }
            if self.hypervisor.attach_device(domain, &fragment).await.is_err() {
                failures += 1;
            }
        }

        self.cleanup_stale_markers(machine, &volumes, &nics).await;

        if failures > 0 {
            return Err(ProviderError::Partial {
                entity: machine.uid.clone(),
                phase: "reconcile_drift".to_string(),
                attempted,
                failed: failures,
            });
        }

        Ok(with_status(machine, &volumes, &nics))
    }

    /// Removes on-disk marker directories for devices that no longer
    /// appear in the spec, calling each device's plugin `Delete` so
    /// stateful plugins (apinet, ceph) can clean up their remote state.
    async fn cleanup_stale_markers(
        &self,
        machine: &Machine,
        volumes: &[(String, crate::volume::Volume)],
        nics: &[(String, crate::nic::NetworkInterface)],
    ) {
        // Walked per registered plugin name (not by reading the on-disk
        // tree) because plugin names like `libvirt-provider.ironcore.dev/
        // ceph` contain slashes and so span more than one directory level
        // under `volumes_dir`.
        let desired_volume_names: std::collections::HashSet<&str> =
            volumes.iter().map(|(n, _)| n.as_str()).collect();
        for plugin_name in self.volume_registry.plugin_names() {
            let plugin_dir = self.paths.volumes_dir(&machine.uid).join(&plugin_name);
            let Ok(mut name_dirs) = tokio::fs::read_dir(&plugin_dir).await else {
                continue;
            };
            let Ok(plugin) = self.volume_registry.find_by_name(&plugin_name) else {
                continue;
            };
            while let Ok(Some(name_entry)) = name_dirs.next_entry().await {
                let name = name_entry.file_name().to_string_lossy().into_owned();
                if !desired_volume_names.contains(name.as_str()) {
                    if let Err(e) = plugin.delete(&name, &machine.uid).await {
                        tracing::warn!(uid = %machine.uid, volume = %name, error = %e, "failed to delete stale volume marker");
                    }
                }
            }
        }

        let desired_nic_names: std::collections::HashSet<&str> = nics.iter().map(|(n, _)| n.as_str()).collect();
        let nics_dir = self.paths.nics_dir(&machine.uid);
        if let Ok(mut nic_dirs) = tokio::fs::read_dir(&nics_dir).await {
            while let Ok(Some(entry)) = nic_dirs.next_entry().await {
                let name = entry.file_name().to_string_lossy().into_owned();
                if desired_nic_names.contains(name.as_str()) {
                    continue;
                }
                let is_apinet = entry.path().join("api-net.json").exists();
                let result = if is_apinet {
                    match self.nic_registry.find_by_name("apinet") {
                        Ok(plugin) => plugin.delete(&name, &machine.uid).await,
                        Err(e) => Err(e),
                    }
                } else {
                    tokio::fs::remove_dir_all(entry.path())
                        .await
                        .map_err(|e| ProviderError::transient(name.clone(), "cleanup_stale_markers", e))
                };
                if let Err(e) = result {
                    tracing::warn!(uid = %machine.uid, nic = %name, error = %e, "failed to delete stale nic marker");
                }
            }
        }
    }

    async fn teardown(&self, machine: Machine) -> Result<()> {
        if !machine.has_finalizer(MACHINE_FINALIZER) {
            return Ok(());
        }

        if let Some(domain) = self.hypervisor.lookup_domain(&machine.uid).await? {
            self.hypervisor.destroy_domain(&domain).await?;
        }

        for spec in &machine.volumes {
            if let Ok(plugin) = self.volume_registry.find_by_spec(spec) {
                plugin.delete(&spec.name, &machine.uid).await?;
            }
        }
        for spec in &machine.network_interfaces {
            let plugin = self.select_nic_plugin(spec).await?;
            plugin.delete(&spec.name, &machine.uid).await?;
        }

        let nics_dir = self.paths.nics_dir(&machine.uid);
        let _ = tokio::fs::remove_dir_all(&nics_dir).await;
        let volumes_dir = self.paths.volumes_dir(&machine.uid);
        let _ = tokio::fs::remove_dir_all(&volumes_dir).await;
        let machine_dir = self.paths.machine_dir(&machine.uid);
        let _ = tokio::fs::remove_dir_all(&machine_dir).await;

        let mut updated = machine;
        updated.finalizers.remove(MACHINE_FINALIZER);
        match self.store.delete(&updated.uid).await {
            Ok(()) => {}
            Err(crate::store::StoreError::NotFound { .. }) => {}
            Err(e) => {
                return Err(ProviderError::transient(
                    updated.uid.clone(),
                    "teardown.remove_finalizer",
                    e,
                ))
            }
        }
        info!(uid = %updated.uid, "machine torn down");
        Ok(())
    }
}

/// Scans a domain XML document for `alias name="<prefix>..."` occurrences
/// and returns the matched alias names, without a full XML parse.
fn observed_aliases(xml: &str, prefix: &str) -> std::collections::HashSet<String> {
    let needle = "alias name=\"";
    let mut aliases = std::collections::HashSet::new();
    let mut rest = xml;
    while let Some(start) = rest.find(needle) {
        rest = &rest[start + needle.len()..];
        if let Some(end) = rest.find('"') {
            let name = &rest[..end];
            if name.starts_with(prefix) {
                aliases.insert(name.to_string());
            }
            rest = &rest[end..];
        } else {
            break;
        }
    }
    aliases
}

fn with_status(
    machine: &Machine,
    volumes: &[(String, crate::volume::Volume)],
    nics: &[(String, crate::nic::NetworkInterface)],
) -> Machine {
    let mut updated = machine.clone();
    updated.status = MachineStatus {
        state: MachineState::Running,
        volumes: volumes
            .iter()
            .map(|(name, v)| VolumeStatus {
                name: name.clone(),
                handle: v.handle.clone(),
                state: DeviceState::Attached,
            })
            .collect(),
        network_interfaces: nics
            .iter()
            .map(|(name, n)| NetworkInterfaceStatus {
                name: name.clone(),
                handle: n.handle.clone(),
                state: DeviceState::Attached,
                ips: n.ips.clone(),
            })
            .collect(),
    };
    updated
}

#[async_trait]
impl Reconciler for MachineReconciler {
    async fn reconcile(&self, uid: &str) -> Result<()> {
        let machine = match self.store.get(uid).await {
            Ok(m) => m,
            Err(crate::store::StoreError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(ProviderError::transient(uid.to_string(), "reconcile.load", e)),
        };

        if machine.is_deleting() {
            return self.teardown(machine).await;
        }

        if !machine.has_finalizer(MACHINE_FINALIZER) {
            let mut updated = machine;
            updated.finalizers.insert(MACHINE_FINALIZER.to_string());
            self.store
                .update(updated)
                .await
                .map_err(|e| ProviderError::transient(uid.to_string(), "reconcile.add_finalizer", e))?;
            return Ok(());
        }

        let existing_domain = self.hypervisor.lookup_domain(&machine.uid).await?;
        let updated = match existing_domain {
            None => self.create_domain(&machine).await?,
            Some(domain) => self.reconcile_drift(&machine, &domain).await?,
        };

        self.store
            .update(updated)
            .await
            .map_err(|e| ProviderError::transient(uid.to_string(), "reconcile.update_status", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guestcaps::StaticGuestCapabilities;
    use crate::hypervisor::fake::FakeHypervisor;
    use crate::imagecache::fake::FakeImageCache;
    use crate::model::{VolumeSpec, VolumeSpecKind};
    use crate::nic::isolated::IsolatedPlugin;
    use crate::nic::providernet::ProviderNetPlugin;
    use crate::store::FileStore;
    use crate::volume::empty_disk::EmptyDiskPlugin;

    async fn setup(tmp: &tempfile::TempDir) -> (Arc<dyn Store<Machine>>, Arc<MachineReconciler>) {
        let paths = Paths::new(tmp.path());
        let store: Arc<dyn Store<Machine>> =
            Arc::new(FileStore::load(paths.store_machines_dir(), "machine").await.unwrap());

        let volume_registry = Arc::new(PluginRegistry::new());
        volume_registry
            .register(
                crate::model::VOLUME_PLUGIN_EMPTY_DISK,
                10,
                Arc::new(EmptyDiskPlugin::new(paths.clone())) as Arc<dyn VolumePlugin>,
            )
            .unwrap();

        let nic_registry = Arc::new(PluginRegistry::new());
        nic_registry
            .register(
                "isolated",
                5,
                Arc::new(IsolatedPlugin::new(paths.clone())) as Arc<dyn NicPlugin>,
            )
            .unwrap();

        let reconciler = Arc::new(MachineReconciler {
            store: store.clone(),
            hypervisor: Arc::new(FakeHypervisor::default()),
            image_cache: Arc::new(FakeImageCache::default()),
            guest_caps: Arc::new(StaticGuestCapabilities::default()),
            volume_registry,
            nic_registry,
            paths,
            domain_opts: DomainAssemblerOptions::default(),
        });

        (store, reconciler)
    }

    fn machine(uid: &str) -> Machine {
        Machine {
            uid: uid.to_string(),
            generation: 0,
            memory_bytes: 2_147_483_648,
            cpu_millis: 2,
            image: None,
            ignition: None,
            volumes: vec![VolumeSpec {
                name: "d0".to_string(),
                provider: crate::model::VOLUME_PLUGIN_EMPTY_DISK.to_string(),
                kind: VolumeSpecKind::EmptyDisk { size_bytes: None },
            }],
            network_interfaces: vec![crate::model::NetworkInterfaceSpec {
                name: "n0".to_string(),
                network_id: "ns/net".to_string(),
                ips: vec!["10.0.0.2".to_string()],
                attributes: Default::default(),
            }],
            class: "default".to_string(),
            finalizers: Default::default(),
            deleted_at: None,
            status: MachineStatus::default(),
        }
    }

    #[tokio::test]
    async fn cold_create_adds_finalizer_then_creates_domain() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, reconciler) = setup(&tmp).await;
        store.create(machine("m1")).await.unwrap();

        reconciler.reconcile("m1").await.unwrap();
        let after_first = store.get("m1").await.unwrap();
        assert!(after_first.has_finalizer(MACHINE_FINALIZER));
        assert_eq!(after_first.status.state, MachineState::Pending);

        reconciler.reconcile("m1").await.unwrap();
        let after_second = store.get("m1").await.unwrap();
        assert_eq!(after_second.status.state, MachineState::Running);
        assert_eq!(after_second.status.volumes.len(), 1);
        assert_eq!(after_second.status.network_interfaces.len(), 1);

        let paths = Paths::new(tmp.path());
        assert!(paths.volume_disk_file("m1", crate::model::VOLUME_PLUGIN_EMPTY_DISK, "d0").exists());
        assert!(paths.nic_dir("m1", "n0").is_dir());
    }

    #[tokio::test]
    async fn reconciling_missing_uid_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, reconciler) = setup(&tmp).await;
        reconciler.reconcile("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_delete_tears_down_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, reconciler) = setup(&tmp).await;
        store.create(machine("m1")).await.unwrap();
        reconciler.reconcile("m1").await.unwrap();
        reconciler.reconcile("m1").await.unwrap();

        let mut m = store.get("m1").await.unwrap();
        m.deleted_at = Some(chrono::Utc::now());
        store.update(m).await.unwrap();

        reconciler.reconcile("m1").await.unwrap();

        assert!(matches!(
            store.get("m1").await.unwrap_err(),
            crate::store::StoreError::NotFound { .. }
        ));
        let paths = Paths::new(tmp.path());
        assert!(!paths.machine_dir("m1").exists());
    }

    #[tokio::test]
    async fn plugin_ambiguity_marks_machine_error_without_creating_domain() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        let store: Arc<dyn Store<Machine>> =
            Arc::new(FileStore::load(paths.store_machines_dir(), "machine").await.unwrap());

        let volume_registry = Arc::new(PluginRegistry::new());
        volume_registry
            .register(
                "dup-a",
                1,
                Arc::new(EmptyDiskPlugin::new(paths.clone())) as Arc<dyn VolumePlugin>,
            )
            .unwrap();
        volume_registry
            .register(
                "dup-b",
                2,
                Arc::new(EmptyDiskPlugin::new(paths.clone())) as Arc<dyn VolumePlugin>,
            )
            .unwrap();

        let nic_registry = Arc::new(PluginRegistry::new());
        nic_registry
            .register("isolated", 5, Arc::new(IsolatedPlugin::new(paths.clone())) as Arc<dyn NicPlugin>)
            .unwrap();

        let hypervisor = Arc::new(FakeHypervisor::default());
        let reconciler = Arc::new(MachineReconciler {
            store: store.clone(),
            hypervisor: hypervisor.clone(),
            image_cache: Arc::new(FakeImageCache::default()),
            guest_caps: Arc::new(StaticGuestCapabilities::default()),
            volume_registry,
            nic_registry,
            paths: paths.clone(),
            domain_opts: DomainAssemblerOptions::default(),
        });

        let mut m = machine("m1");
        m.network_interfaces.clear();
        store.create(m).await.unwrap();
        reconciler.reconcile("m1").await.unwrap();

        let err = reconciler.reconcile("m1").await.unwrap_err();
        assert!(matches!(err, ProviderError::PluginAmbiguous { .. }));
        assert!(hypervisor.lookup_domain("m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drift_reconcile_swaps_nic_to_new_network_and_cleans_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        let store: Arc<dyn Store<Machine>> =
            Arc::new(FileStore::load(paths.store_machines_dir(), "machine").await.unwrap());

        let volume_registry = Arc::new(PluginRegistry::new());
        volume_registry
            .register(
                crate::model::VOLUME_PLUGIN_EMPTY_DISK,
                10,
                Arc::new(EmptyDiskPlugin::new(paths.clone())) as Arc<dyn VolumePlugin>,
            )
            .unwrap();

        let nic_registry = Arc::new(PluginRegistry::new());
        nic_registry
            .register("isolated", 5, Arc::new(IsolatedPlugin::new(paths.clone())) as Arc<dyn NicPlugin>)
            .unwrap();
        nic_registry
            .register(
                "providernet",
                10,
                Arc::new(ProviderNetPlugin::new(paths.clone())) as Arc<dyn NicPlugin>,
            )
            .unwrap();

        let hypervisor = Arc::new(FakeHypervisor::default());
        let reconciler = Arc::new(MachineReconciler {
            store: store.clone(),
            hypervisor: hypervisor.clone(),
            image_cache: Arc::new(FakeImageCache::default()),
            guest_caps: Arc::new(StaticGuestCapabilities::default()),
            volume_registry,
            nic_registry,
            paths: paths.clone(),
            domain_opts: DomainAssemblerOptions::default(),
        });

        let mut m = machine("m1");
        m.network_interfaces = vec![crate::model::NetworkInterfaceSpec {
            name: "n0".to_string(),
            network_id: "ns/netA".to_string(),
            ips: vec!["10.0.0.2".to_string()],
            attributes: [("provider".to_string(), "providernet".to_string())].into(),
        }];
        store.create(m).await.unwrap();

        reconciler.reconcile("m1").await.unwrap(); // add finalizer
        reconciler.reconcile("m1").await.unwrap(); // create domain
        assert!(paths.nic_dir("m1", "n0").is_dir());

        let mut m = store.get("m1").await.unwrap();
        m.network_interfaces[0].network_id = "ns/netB".to_string();
        store.update(m).await.unwrap();

        reconciler.reconcile("m1").await.unwrap(); // drift reconcile

        assert!(hypervisor.detached_aliases().iter().any(|a| a == "ua-nic-n0"));
        assert!(hypervisor
            .attached_fragments()
            .iter()
            .any(|f| f.contains("ua-nic-n0") && f.contains("ns/netB")));

        let domain = hypervisor.lookup_domain("m1").await.unwrap().unwrap();
        let xml = hypervisor.get_xml_desc(&domain).await.unwrap();
        assert!(xml.contains("ns/netB"));
        assert!(!xml.contains("ns/netA"));

        // the marker directory survives a swap, only a removed nic's does not.
        assert!(paths.nic_dir("m1", "n0").is_dir());

        let after = store.get("m1").await.unwrap();
        assert_eq!(after.status.state, MachineState::Running);
    }

    #[tokio::test]
    async fn drift_reconcile_detaches_and_cleans_up_removed_nic() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, reconciler) = setup(&tmp).await;
        store.create(machine("m1")).await.unwrap();
        reconciler.reconcile("m1").await.unwrap();
        reconciler.reconcile("m1").await.unwrap();

        let paths = Paths::new(tmp.path());
        assert!(paths.nic_dir("m1", "n0").is_dir());

        let mut m = store.get("m1").await.unwrap();
        m.network_interfaces.clear();
        store.update(m).await.unwrap();

        reconciler.reconcile("m1").await.unwrap();

        let after = store.get("m1").await.unwrap();
        assert!(after.status.network_interfaces.is_empty());
        assert!(!paths.nic_dir("m1", "n0").exists());
    }
}
