//! Composes the libvirt domain description from a machine spec and its
//! plugins' results.
//!
//! The struct tree mirrors LNVPS-api's `quick_xml::se`-based domain XML
//! (`#[serde(rename = "@attr")]` for attributes, `"$text"`/`"$value"` for
//! element content), generalized to the constants and device shapes this
//! provider emits.

use serde::Serialize;

use crate::error::Result;
use crate::model::Machine;
use crate::nic::{NetworkInterface, NicKind};
use crate::paths::Paths;
use crate::volume::raw::{self, CreateOptions};
use crate::volume::{Volume, VolumeBacking};

pub const ROOTFS_ALIAS: &str = "ua-rootfs";
pub const NIC_ALIAS_PREFIX: &str = "ua-nic-";
pub const VOLUME_ALIAS_PREFIX: &str = "ua-volume-";
pub const IGNITION_FW_CFG_KEY: &str = "opt/com.coreos/config";
const PCIE_ROOT_PORT_COUNT: usize = 30;
const VIRTIO_RNG_RATE_BYTES: u32 = 512;

/// Produced by the out-of-scope guest-capability-detection collaborator.
#[derive(Debug, Clone)]
pub struct GuestCapabilities {
    pub domain_type: String,
    pub machine_type: String,
}

/// Produced by the out-of-scope image cache collaborator.
#[derive(Debug, Clone, Default)]
pub struct ImageArtifact {
    pub kernel_path: Option<String>,
    pub initrd_path: Option<String>,
    pub cmdline: Option<String>,
    pub rootfs_source: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct DomainAssemblerOptions {
    pub tcmalloc_lib_path: Option<String>,
}

/// Assembles the domain XML for `machine`, creating the rootfs disk file
/// (if an image is given and it isn't already present) and the ignition
/// config file (if ignition bytes are set) as a side effect, matching the
/// behavior the reconciler relies on to make creation idempotent.
pub async fn assemble_domain_xml(
    machine: &Machine,
    caps: &GuestCapabilities,
    image: Option<&ImageArtifact>,
    volumes: &[(String, Volume)],
    nics: &[(String, NetworkInterface)],
    paths: &Paths,
    opts: &DomainAssemblerOptions,
) -> Result<String> {
    let mut devices = Vec::new();

    devices.push(DomainDevice::Controller(Controller {
        kind: "pci".to_string(),
        model: "pcie-root".to_string(),
    }));
    for _ in 0..PCIE_ROOT_PORT_COUNT {
        devices.push(DomainDevice::Controller(Controller {
            kind: "pci".to_string(),
            model: "pcie-root-port".to_string(),
        }));
    }

    let mut sysinfo = None;
    if let Some(image) = image {
        if let Some(source) = &image.rootfs_source {
            let rootfs_path = paths.rootfs_file(&machine.uid);
            raw::create(
                &rootfs_path,
                &CreateOptions {
                    size_bytes: None,
                    source_file: Some(source.clone()),
                },
            )
            .await?;
            devices.push(DomainDevice::Disk(Disk {
                kind: "file".to_string(),
                device: "disk".to_string(),
                source: DiskSource {
                    file: Some(rootfs_path.display().to_string()),
                    protocol: None,
                    name: None,
                    hosts: vec![],
                },
                target: DiskTarget {
                    dev: "vdaaa".to_string(),
                    bus: "virtio".to_string(),
                },
                read_only: Some(ReadOnlyMarker {}),
                serial: Some(TextElement("machineboot".to_string())),
                auth: None,
                alias: Alias {
                    name: ROOTFS_ALIAS.to_string(),
                },
            }));
        }
    }

    if let Some(ignition) = &machine.ignition {
        let path = paths.ignition_file(&machine.uid);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                crate::error::ProviderError::transient(path.display().to_string(), "domain.ignition", e)
            })?;
        }
        tokio::fs::write(&path, ignition).await.map_err(|e| {
            crate::error::ProviderError::transient(path.display().to_string(), "domain.ignition", e)
        })?;
        crate::paths::set_file_mode(&path, crate::paths::FILE_MODE_RW).await?;
        sysinfo = Some(DomainSysinfo {
            kind: "smbios".to_string(),
            fw_cfg: FwCfgEntry {
                name: IGNITION_FW_CFG_KEY.to_string(),
                file: path.display().to_string(),
            },
        });
    }

    for (name, volume) in volumes {
        devices.push(disk_device_for_volume(name, volume));
    }

    for (name, nic) in nics {
        devices.push(device_for_nic(name, nic));
    }

    devices.push(DomainDevice::Serial(Serial {
        kind: "pci".to_string(),
        target: SerialTarget {},
    }));
    devices.push(DomainDevice::Console(Console {
        kind: "pty".to_string(),
        target: ConsoleTarget {
            kind: "serial".to_string(),
        },
    }));
    devices.push(DomainDevice::Rng(Rng {
        model: "virtio".to_string(),
        backend: RngBackend {
            model: "random".to_string(),
            rate: RngRate {
                bytes: VIRTIO_RNG_RATE_BYTES,
            },
        },
    }));

    let commandline = opts.tcmalloc_lib_path.as_ref().map(|lib_path| QemuCommandline {
        envs: vec![QemuEnv {
            name: "LD_PRELOAD".to_string(),
            value: lib_path.clone(),
        }],
    });

    let domain = DomainXml {
        kind: caps.domain_type.clone(),
        name: machine.uid.clone(),
        uuid: machine.uid.clone(),
        memory: DomainMemory {
            unit: "Byte".to_string(),
            value: machine.memory_bytes,
        },
        vcpu: DomainVCpu {
            count: machine.cpu_millis,
        },
        os: DomainOs {
            kind: DomainOsType {
                text: "hvm".to_string(),
                arch: "x86_64".to_string(),
                machine: caps.machine_type.clone(),
            },
            firmware: "efi".to_string(),
            boot: DomainOsBoot {
                dev: "hd".to_string(),
            },
        },
        features: DomainFeatures {
            acpi: Marker {},
            apic: Marker {},
        },
        cpu: DomainCpu {
            mode: "host-passthrough".to_string(),
        },
        clock: DomainClock {
            offset: "utc".to_string(),
            timers: vec![
                ClockTimer {
                    name: "rtc".to_string(),
                    tickpolicy: None,
                    mode: None,
                },
                ClockTimer {
                    name: "hpet".to_string(),
                    tickpolicy: Some("catchup".to_string()),
                    mode: None,
                },
                ClockTimer {
                    name: "tsc".to_string(),
                    tickpolicy: Some("catchup".to_string()),
                    mode: Some("paravirt".to_string()),
                },
            ],
        },
        on_poweroff: TextElement("destroy".to_string()),
        on_reboot: TextElement("restart".to_string()),
        on_crash: TextElement("coredump-restart".to_string()),
        sysinfo,
        devices: DomainDevices { contents: devices },
        commandline,
        kernel: image.and_then(|i| i.kernel_path.clone()).map(TextElement),
        initrd: image.and_then(|i| i.initrd_path.clone()).map(TextElement),
        cmdline: image.and_then(|i| i.cmdline.clone()).map(TextElement),
    };

    quick_xml::se::to_string(&domain).map_err(|e| {
        crate::error::ProviderError::transient(machine.uid.clone(), "domain.assemble", e)
    })
}

/// Renders the single `<disk>`/`<interface>`/`<hostdev>` fragment a plugin
/// result would contribute to the domain, for use by the drift
/// reconciler's attach calls and its byte-equality comparison against the
/// observed device (spec §4.G "Reconcile drift").
pub fn volume_device_xml(name: &str, volume: &Volume) -> Result<String> {
    quick_xml::se::to_string(&disk_device_for_volume(name, volume))
        .map_err(|e| crate::error::ProviderError::transient(name.to_string(), "domain.volume_device_xml", e))
}

pub fn nic_device_xml(name: &str, nic: &NetworkInterface) -> Result<String> {
    quick_xml::se::to_string(&device_for_nic(name, nic))
        .map_err(|e| crate::error::ProviderError::transient(name.to_string(), "domain.nic_device_xml", e))
}

fn disk_device_for_volume(name: &str, volume: &Volume) -> DomainDevice {
    let alias = Alias {
        name: format!("ua-volume-{name}"),
    };
    match &volume.backing {
        VolumeBacking::RawFile { path } | VolumeBacking::Qcow2File { path } => {
            DomainDevice::Disk(Disk {
                kind: "file".to_string(),
                device: "disk".to_string(),
                source: DiskSource {
                    file: Some(path.clone()),
                    protocol: None,
                    name: None,
                    hosts: vec![],
                },
                target: DiskTarget {
                    dev: format!("vd{name}"),
                    bus: "virtio".to_string(),
                },
                read_only: None,
                serial: None,
                auth: None,
                alias,
            })
        }
        VolumeBacking::CephDisk {
            name: image_name,
            monitors,
            auth,
            ..
        } => DomainDevice::Disk(Disk {
            kind: "network".to_string(),
            device: "disk".to_string(),
            source: DiskSource {
                file: None,
                protocol: Some("rbd".to_string()),
                name: Some(image_name.clone()),
                hosts: monitors
                    .iter()
                    .map(|m| {
                        let mut parts = m.splitn(2, ':');
                        DiskSourceHost {
                            name: parts.next().unwrap_or_default().to_string(),
                            port: parts.next().map(str::to_string),
                        }
                    })
                    .collect(),
            },
            target: DiskTarget {
                dev: format!("vd{name}"),
                bus: "virtio".to_string(),
            },
            read_only: None,
            serial: None,
            auth: Some(DiskAuth {
                username: auth.user_name.clone(),
                secret: DiskSecret {
                    kind: "ceph".to_string(),
                    usage: format!("{image_name}-secret"),
                },
            }),
            alias,
        }),
    }
}

fn device_for_nic(name: &str, nic: &NetworkInterface) -> DomainDevice {
    let alias = Alias {
        name: format!("{NIC_ALIAS_PREFIX}{name}"),
    };
    match &nic.kind {
        NicKind::HostDevice {
            pci_domain,
            bus,
            slot,
            function,
        } => DomainDevice::HostDev(HostDev {
            mode: "subsystem".to_string(),
            kind: "pci".to_string(),
            managed: "yes".to_string(),
            source: HostDevSource {
                address: PciAddress {
                    domain: format!("0x{pci_domain:04x}"),
                    bus: format!("0x{bus:02x}"),
                    slot: format!("0x{slot:02x}"),
                    function: format!("0x{function:01x}"),
                },
            },
            address: PciAddress {
                domain: "0x0000".to_string(),
                bus: "0x00".to_string(),
                slot: "0x00".to_string(),
                function: "0x0".to_string(),
            },
            alias,
        }),
        NicKind::Isolated => DomainDevice::Interface(NetworkInterfaceXml {
            kind: "user".to_string(),
            source: InterfaceSource {
                user: Some(Marker {}),
                network: None,
            },
            alias,
        }),
        NicKind::ProviderNetwork { network_name } => DomainDevice::Interface(NetworkInterfaceXml {
            kind: "network".to_string(),
            source: InterfaceSource {
                user: None,
                network: Some(InterfaceNetwork {
                    name: network_name.clone(),
                }),
            },
            alias,
        }),
    }
}

// --- XML tree ---

#[derive(Debug, Serialize, Default)]
struct Marker {}

#[derive(Debug, Serialize, Default)]
struct ReadOnlyMarker {}

#[derive(Debug, Serialize)]
struct TextElement(#[serde(rename = "$text")] String);

#[derive(Debug, Serialize)]
#[serde(rename = "domain")]
struct DomainXml {
    #[serde(rename = "@type")]
    kind: String,
    name: String,
    uuid: String,
    memory: DomainMemory,
    vcpu: DomainVCpu,
    os: DomainOs,
    features: DomainFeatures,
    cpu: DomainCpu,
    clock: DomainClock,
    on_poweroff: TextElement,
    on_reboot: TextElement,
    on_crash: TextElement,
    #[serde(skip_serializing_if = "Option::is_none")]
    kernel: Option<TextElement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    initrd: Option<TextElement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cmdline: Option<TextElement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sysinfo: Option<DomainSysinfo>,
    devices: DomainDevices,
    #[serde(skip_serializing_if = "Option::is_none")]
    commandline: Option<QemuCommandline>,
}

#[derive(Debug, Serialize)]
struct DomainMemory {
    #[serde(rename = "@unit")]
    unit: String,
    #[serde(rename = "$text")]
    value: u64,
}

#[derive(Debug, Serialize)]
struct DomainVCpu {
    #[serde(rename = "$text")]
    count: u32,
}

#[derive(Debug, Serialize)]
struct DomainOs {
    #[serde(rename = "type")]
    kind: DomainOsType,
    #[serde(rename = "@firmware")]
    firmware: String,
    boot: DomainOsBoot,
}

#[derive(Debug, Serialize)]
struct DomainOsType {
    #[serde(rename = "$text")]
    text: String,
    #[serde(rename = "@arch")]
    arch: String,
    #[serde(rename = "@machine")]
    machine: String,
}

#[derive(Debug, Serialize)]
struct DomainOsBoot {
    #[serde(rename = "@dev")]
    dev: String,
}

#[derive(Debug, Serialize)]
struct DomainFeatures {
    acpi: Marker,
    apic: Marker,
}

#[derive(Debug, Serialize)]
struct DomainCpu {
    #[serde(rename = "@mode")]
    mode: String,
}

#[derive(Debug, Serialize)]
struct DomainClock {
    #[serde(rename = "@offset")]
    offset: String,
    #[serde(rename = "timer")]
    timers: Vec<ClockTimer>,
}

#[derive(Debug, Serialize)]
struct ClockTimer {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@tickpolicy", skip_serializing_if = "Option::is_none")]
    tickpolicy: Option<String>,
    #[serde(rename = "@mode", skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
}

#[derive(Debug, Serialize)]
struct DomainSysinfo {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "fwcfg")]
    fw_cfg: FwCfgEntry,
}

#[derive(Debug, Serialize)]
struct FwCfgEntry {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@file")]
    file: String,
}

#[derive(Debug, Serialize)]
struct DomainDevices {
    #[serde(rename = "$value")]
    contents: Vec<DomainDevice>,
}

#[derive(Debug, Serialize)]
enum DomainDevice {
    #[serde(rename = "disk")]
    Disk(Disk),
    #[serde(rename = "interface")]
    Interface(NetworkInterfaceXml),
    #[serde(rename = "hostdev")]
    HostDev(HostDev),
    #[serde(rename = "controller")]
    Controller(Controller),
    #[serde(rename = "serial")]
    Serial(Serial),
    #[serde(rename = "console")]
    Console(Console),
    #[serde(rename = "rng")]
    Rng(Rng),
}

#[derive(Debug, Serialize)]
struct Controller {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "@model")]
    model: String,
}

#[derive(Debug, Serialize)]
struct Serial {
    #[serde(rename = "@type")]
    kind: String,
    target: SerialTarget,
}

#[derive(Debug, Serialize, Default)]
struct SerialTarget {}

#[derive(Debug, Serialize)]
struct Console {
    #[serde(rename = "@type")]
    kind: String,
    target: ConsoleTarget,
}

#[derive(Debug, Serialize)]
struct ConsoleTarget {
    #[serde(rename = "@type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct Rng {
    #[serde(rename = "@model")]
    model: String,
    backend: RngBackend,
}

#[derive(Debug, Serialize)]
struct RngBackend {
    #[serde(rename = "@model")]
    model: String,
    rate: RngRate,
}

#[derive(Debug, Serialize)]
struct RngRate {
    #[serde(rename = "@bytes")]
    bytes: u32,
}

#[derive(Debug, Serialize)]
struct Disk {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "@device")]
    device: String,
    source: DiskSource,
    target: DiskTarget,
    #[serde(rename = "readonly", skip_serializing_if = "Option::is_none")]
    read_only: Option<ReadOnlyMarker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    serial: Option<TextElement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<DiskAuth>,
    alias: Alias,
}

#[derive(Debug, Serialize, Default)]
struct DiskSource {
    #[serde(rename = "@file", skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(rename = "@protocol", skip_serializing_if = "Option::is_none")]
    protocol: Option<String>,
    #[serde(rename = "@name", skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "host", skip_serializing_if = "Vec::is_empty", default)]
    hosts: Vec<DiskSourceHost>,
}

#[derive(Debug, Serialize)]
struct DiskSourceHost {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@port", skip_serializing_if = "Option::is_none")]
    port: Option<String>,
}

#[derive(Debug, Serialize)]
struct DiskTarget {
    #[serde(rename = "@dev")]
    dev: String,
    #[serde(rename = "@bus")]
    bus: String,
}

#[derive(Debug, Serialize)]
struct DiskAuth {
    #[serde(rename = "@username")]
    username: String,
    secret: DiskSecret,
}

#[derive(Debug, Serialize)]
struct DiskSecret {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "@usage")]
    usage: String,
}

#[derive(Debug, Serialize)]
struct Alias {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Serialize)]
struct NetworkInterfaceXml {
    #[serde(rename = "@type")]
    kind: String,
    source: InterfaceSource,
    alias: Alias,
}

#[derive(Debug, Serialize)]
struct InterfaceSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<Marker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<InterfaceNetwork>,
}

#[derive(Debug, Serialize)]
struct InterfaceNetwork {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Serialize)]
struct HostDev {
    #[serde(rename = "@mode")]
    mode: String,
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "@managed")]
    managed: String,
    source: HostDevSource,
    address: PciAddress,
    alias: Alias,
}

#[derive(Debug, Serialize)]
struct HostDevSource {
    address: PciAddress,
}

#[derive(Debug, Serialize)]
struct PciAddress {
    #[serde(rename = "@domain")]
    domain: String,
    #[serde(rename = "@bus")]
    bus: String,
    #[serde(rename = "@slot")]
    slot: String,
    #[serde(rename = "@function")]
    function: String,
}

#[derive(Debug, Serialize)]
struct QemuCommandline {
    #[serde(rename = "qemu:env")]
    envs: Vec<QemuEnv>,
}

#[derive(Debug, Serialize)]
struct QemuEnv {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@value")]
    value: String,
}
