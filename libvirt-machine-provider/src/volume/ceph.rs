use std::time::Duration;

use async_trait::async_trait;

use super::{CephAuth, Volume, VolumeBacking, VolumePlugin};
use crate::error::{ProviderError, Result};
use crate::model::{Machine, VolumeSpec, VolumeSpecKind, CEPH_DRIVER, VOLUME_PLUGIN_CEPH};

const GET_SIZE_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens an RBD image just long enough to read its size. Real RBD wire
/// access is out of scope; this trait is the seam a production build
/// would fill in with the `rbd` C bindings or `librados` client.
#[async_trait]
pub trait RbdConnector: Send + Sync {
    async fn image_size(&self, monitors: &[String], pool_image: &str) -> Result<u64>;
}

/// Placeholder wired in by the binary until a real RBD connector (the
/// `rbd`/`librados` bindings) is configured; `get_size` always fails
/// transiently rather than silently returning a bogus size.
pub struct UnsupportedRbdConnector;

#[async_trait]
impl RbdConnector for UnsupportedRbdConnector {
    async fn image_size(&self, _monitors: &[String], pool_image: &str) -> Result<u64> {
        Err(ProviderError::transient(
            pool_image.to_string(),
            "ceph.image_size",
            anyhow::anyhow!("no RBD connector configured"),
        ))
    }
}

pub struct CephPlugin {
    connector: std::sync::Arc<dyn RbdConnector>,
}

impl CephPlugin {
    pub fn new(connector: std::sync::Arc<dyn RbdConnector>) -> Self {
        Self { connector }
    }

    pub async fn get_size(&self, spec: &VolumeSpec) -> Result<u64> {
        let (monitors, image, ..) = parse_connection(spec)?;
        match tokio::time::timeout(GET_SIZE_TIMEOUT, self.connector.image_size(&monitors, &image))
            .await
        {
            Ok(Ok(size)) => Ok(size),
            Ok(Err(e)) => Err(match e {
                ProviderError::Transient { source, .. } => {
                    ProviderError::transient(image.clone(), "ceph.get_size", source)
                }
                other => other,
            }),
            Err(_) => Err(ProviderError::transient(
                image,
                "ceph.get_size",
                anyhow::anyhow!("timed out after {:?}", GET_SIZE_TIMEOUT),
            )),
        }
    }
}

fn parse_connection(spec: &VolumeSpec) -> Result<(Vec<String>, String, String, String)> {
    let VolumeSpecKind::Connection {
        driver,
        handle: _,
        attributes,
        secret_data,
    } = &spec.kind
    else {
        return Err(ProviderError::invalid_spec(
            &spec.name,
            "ceph.parse",
            "not a connection volume",
        ));
    };
    if driver != CEPH_DRIVER {
        return Err(ProviderError::invalid_spec(
            &spec.name,
            "ceph.parse",
            format!("unsupported driver {driver}"),
        ));
    }

    let monitors_raw = attributes
        .get("monitors")
        .ok_or_else(|| ProviderError::invalid_spec(&spec.name, "ceph.parse", "missing monitors"))?;
    let monitors: Vec<String> = monitors_raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if monitors.is_empty() {
        return Err(ProviderError::invalid_spec(
            &spec.name,
            "ceph.parse",
            "monitors must not be empty",
        ));
    }

    let image = attributes
        .get("image")
        .ok_or_else(|| ProviderError::invalid_spec(&spec.name, "ceph.parse", "missing image"))?
        .clone();
    if !image.contains('/') {
        return Err(ProviderError::invalid_spec(
            &spec.name,
            "ceph.parse",
            "image handle must be <pool>/<image>",
        ));
    }

    let user_id = secret_data
        .get("userID")
        .ok_or_else(|| ProviderError::invalid_spec(&spec.name, "ceph.parse", "missing userID"))?
        .clone();
    let user_key = secret_data
        .get("userKey")
        .ok_or_else(|| ProviderError::invalid_spec(&spec.name, "ceph.parse", "missing userKey"))?
        .clone();

    Ok((monitors, image, user_id, user_key))
}

#[async_trait]
impl VolumePlugin for CephPlugin {
    fn name(&self) -> &str {
        VOLUME_PLUGIN_CEPH
    }

    fn can_support(&self, spec: &VolumeSpec) -> bool {
        matches!(&spec.kind, VolumeSpecKind::Connection { driver, .. } if driver == CEPH_DRIVER)
    }

    async fn apply(&self, spec: &VolumeSpec, _machine: &Machine) -> Result<Volume> {
        let (monitors, image, user_id, user_key) = parse_connection(spec)?;
        Ok(Volume {
            handle: image.clone(),
            backing: VolumeBacking::CephDisk {
                name: image,
                monitors,
                auth: CephAuth {
                    user_name: user_id,
                    user_key,
                },
                encryption: None,
            },
        })
    }

    async fn delete(&self, _name: &str, _machine_uid: &str) -> Result<()> {
        // The remote volume outlives the machine; nothing to clean up locally.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn spec(attributes: HashMap<String, String>, secret_data: HashMap<String, String>) -> VolumeSpec {
        VolumeSpec {
            name: "d0".into(),
            provider: VOLUME_PLUGIN_CEPH.into(),
            kind: VolumeSpecKind::Connection {
                driver: CEPH_DRIVER.into(),
                handle: "pool/image".into(),
                attributes,
                secret_data,
            },
        }
    }

    fn valid_attrs() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("monitors".into(), "10.0.0.1:6789,10.0.0.2:6789".into());
        m.insert("image".into(), "rbd/image0".into());
        m
    }

    fn valid_secret() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("userID".into(), "admin".into());
        m.insert("userKey".into(), "secret".into());
        m
    }

    struct FakeConnector;

    #[async_trait]
    impl RbdConnector for FakeConnector {
        async fn image_size(&self, _monitors: &[String], _pool_image: &str) -> Result<u64> {
            Ok(10 * 1024 * 1024 * 1024)
        }
    }

    #[tokio::test]
    async fn apply_produces_ceph_disk() {
        let plugin = CephPlugin::new(std::sync::Arc::new(FakeConnector));
        let s = spec(valid_attrs(), valid_secret());
        let volume = plugin
            .apply(&s, &Machine {
                uid: "m1".into(),
                generation: 0,
                memory_bytes: 0,
                cpu_millis: 0,
                image: None,
                ignition: None,
                volumes: vec![],
                network_interfaces: vec![],
                class: "default".into(),
                finalizers: Default::default(),
                deleted_at: None,
                status: Default::default(),
            })
            .await
            .unwrap();
        match volume.backing {
            VolumeBacking::CephDisk { monitors, .. } => assert_eq!(monitors.len(), 2),
            _ => panic!("expected ceph disk"),
        }
    }

    #[test]
    fn missing_slash_in_image_is_invalid_spec() {
        let mut attrs = valid_attrs();
        attrs.insert("image".into(), "imagewithoutpool".into());
        let s = spec(attrs, valid_secret());
        assert!(matches!(
            parse_connection(&s),
            Err(ProviderError::InvalidSpec { .. })
        ));
    }

    #[test]
    fn empty_monitors_is_invalid_spec() {
        let mut attrs = valid_attrs();
        attrs.insert("monitors".into(), "".into());
        let s = spec(attrs, valid_secret());
        assert!(matches!(
            parse_connection(&s),
            Err(ProviderError::InvalidSpec { .. })
        ));
    }

    #[tokio::test]
    async fn get_size_delegates_to_connector() {
        let plugin = CephPlugin::new(std::sync::Arc::new(FakeConnector));
        let s = spec(valid_attrs(), valid_secret());
        assert_eq!(plugin.get_size(&s).await.unwrap(), 10 * 1024 * 1024 * 1024);
    }
}
