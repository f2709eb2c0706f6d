//! libvirt-machine-provider: reconciles declarative machine specs into
//! running libvirt/QEMU domains on a single host.
//!
//! Wires the Store, Event Source, Plugin Registries, and the Machine/Volume
//! reconcilers, then drives worker pools until shutdown.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod domain;
mod error;
mod eventsource;
mod guestcaps;
mod hypervisor;
mod imagecache;
mod model;
mod nic;
mod paths;
mod reconciler;
mod registry;
mod store;
mod volume;
mod workqueue;

use config::{ConfigOverrides, Settings};
use domain::DomainAssemblerOptions;
use eventsource::EventSource;
use guestcaps::StaticGuestCapabilities;
use model::{Machine, Volume as VolumeObject, NIC_PLUGIN_APINET, NIC_PLUGIN_ISOLATED, NIC_PLUGIN_PROVIDERNET};
use nic::apinet::ApiNetPlugin;
use nic::isolated::IsolatedPlugin;
use nic::providernet::ProviderNetPlugin;
use nic::NicPlugin;
use paths::Paths;
use reconciler::machine::MachineReconciler;
use reconciler::volume::VolumeReconciler;
use reconciler::{run_workers, Reconciler};
use registry::PluginRegistry;
use store::{FileStore, Store};
use volume::ceph::CephPlugin;
use volume::empty_disk::EmptyDiskPlugin;
use volume::VolumePlugin;
use workqueue::{RateLimiterConfig, WorkQueue};

/// Machine provider daemon: materializes Machines and Volumes into
/// libvirt/QEMU domains.
#[derive(Parser, Debug)]
#[command(name = "libvirt-machine-provider", version, about)]
struct Args {
    /// Optional YAML config file; CLI flags below override its values.
    #[arg(long)]
    config: Option<String>,

    /// Root directory for the on-disk store and machine/volume layout.
    #[arg(long)]
    root_dir: Option<String>,

    /// Worker pool size per reconciler.
    #[arg(long)]
    workers: Option<usize>,

    /// Path to a `tcmalloc` shared object to `LD_PRELOAD` into QEMU.
    #[arg(long)]
    tcmalloc_lib_path: Option<String>,

    /// Log level / `EnvFilter` directive.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("libvirt_machine_provider={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load(
        args.config.as_deref(),
        ConfigOverrides {
            root_dir: args.root_dir.clone(),
            workers: args.workers,
            tcmalloc_lib_path: args.tcmalloc_lib_path.clone(),
        },
    )?;

    info!(root_dir = %settings.root_dir, workers = settings.workers, "starting libvirt-machine-provider");

    let paths = Paths::new(settings.root_dir.clone());

    let machine_store: Arc<dyn Store<Machine>> =
        Arc::new(FileStore::load(paths.store_machines_dir(), "machine").await?);
    let volume_store: Arc<dyn Store<VolumeObject>> =
        Arc::new(FileStore::load(paths.store_volumes_dir(), "volume").await?);

    let volume_registry = build_volume_registry(&paths)?;
    let nic_registry = build_nic_registry(&paths)?;

    let hypervisor: Arc<dyn hypervisor::HypervisorClient> = Arc::new(hypervisor::fake::FakeHypervisor::default());
    let image_cache: Arc<dyn imagecache::ImageCache> = Arc::new(imagecache::fake::FakeImageCache::default());
    let guest_caps = Arc::new(StaticGuestCapabilities::default());

    let machine_reconciler = Arc::new(MachineReconciler {
        store: machine_store.clone(),
        hypervisor,
        image_cache,
        guest_caps,
        volume_registry: volume_registry.clone(),
        nic_registry: nic_registry.clone(),
        paths: paths.clone(),
        domain_opts: DomainAssemblerOptions {
            tcmalloc_lib_path: settings.tcmalloc_lib_path.clone(),
        },
    });
    let volume_reconciler = Arc::new(VolumeReconciler {
        store: volume_store.clone(),
        volume_registry,
    });

    let rate_limiter = RateLimiterConfig {
        base_delay: std::time::Duration::from_millis(settings.rate_limiter_base_delay_ms),
        max_delay: std::time::Duration::from_millis(settings.rate_limiter_max_delay_ms),
    };
    let machine_queue = Arc::new(WorkQueue::new(rate_limiter));
    let volume_queue = Arc::new(WorkQueue::new(rate_limiter));

    let machine_events = Arc::new(EventSource::new(machine_store));
    let volume_events = Arc::new(EventSource::new(volume_store));

    {
        let queue = machine_queue.clone();
        machine_events
            .add_handler(move |event| {
                queue.add_rate_limited(event.object.uid);
            })
            .await;
    }
    {
        let queue = volume_queue.clone();
        volume_events
            .add_handler(move |event| {
                queue.add_rate_limited(event.object.uid);
            })
            .await;
    }

    let machine_dispatch = tokio::spawn({
        let events = machine_events.clone();
        async move { events.run().await }
    });
    let volume_dispatch = tokio::spawn({
        let events = volume_events.clone();
        async move { events.run().await }
    });

    let machine_workers = tokio::spawn(run_reconciler_workers(machine_reconciler, machine_queue.clone(), settings.workers));
    let volume_workers = tokio::spawn(run_reconciler_workers(volume_reconciler, volume_queue.clone(), settings.workers));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining work queues");
    machine_queue.shutdown().await;
    volume_queue.shutdown().await;

    machine_dispatch.abort();
    volume_dispatch.abort();
    let _ = machine_workers.await;
    let _ = volume_workers.await;

    Ok(())
}

async fn run_reconciler_workers<R: Reconciler>(reconciler: Arc<R>, queue: Arc<WorkQueue>, workers: usize) {
    run_workers(reconciler, queue, workers).await;
}

/// Builds the default volume plugin registry: empty-disk and ceph,
/// matching the stable wire identifiers named in spec §6.
fn build_volume_registry(paths: &Paths) -> anyhow::Result<Arc<PluginRegistry<Arc<dyn VolumePlugin>>>> {
    let registry = Arc::new(PluginRegistry::new());
    registry.register(
        model::VOLUME_PLUGIN_EMPTY_DISK,
        10,
        Arc::new(EmptyDiskPlugin::new(paths.clone())) as Arc<dyn VolumePlugin>,
    )?;
    registry.register(
        model::VOLUME_PLUGIN_CEPH,
        20,
        Arc::new(CephPlugin::new(Arc::new(volume::ceph::UnsupportedRbdConnector))) as Arc<dyn VolumePlugin>,
    )?;
    Ok(registry)
}

/// Builds the default NIC plugin registry: isolated (priority 5),
/// providernet (priority 10), apinet (priority 20, per spec §6).
fn build_nic_registry(paths: &Paths) -> anyhow::Result<Arc<PluginRegistry<Arc<dyn NicPlugin>>>> {
    let registry = Arc::new(PluginRegistry::new());
    let (isolated_name, isolated_prio) = NIC_PLUGIN_ISOLATED;
    registry.register(
        isolated_name,
        isolated_prio,
        Arc::new(IsolatedPlugin::new(paths.clone())) as Arc<dyn NicPlugin>,
    )?;
    let (providernet_name, providernet_prio) = NIC_PLUGIN_PROVIDERNET;
    registry.register(
        providernet_name,
        providernet_prio,
        Arc::new(ProviderNetPlugin::new(paths.clone())) as Arc<dyn NicPlugin>,
    )?;
    let (apinet_name, apinet_prio) = NIC_PLUGIN_APINET;
    registry.register(
        apinet_name,
        apinet_prio,
        Arc::new(ApiNetPlugin::new(
            paths.clone(),
            Arc::new(nic::apinet::UnsupportedApiNetClient),
        )) as Arc<dyn NicPlugin>,
    )?;
    Ok(registry)
}
