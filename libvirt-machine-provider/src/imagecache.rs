//! Image pulling/caching: out of scope beyond the collaborator interface.

use async_trait::async_trait;

use crate::domain::ImageArtifact;
use crate::error::Result;

#[async_trait]
pub trait ImageCache: Send + Sync {
    /// Resolves an image reference to a kernel/initrd/rootfs/cmdline
    /// artifact set, pulling and caching it under `images/` if absent.
    async fn resolve(&self, image_ref: &str) -> Result<ImageArtifact>;
}

pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeImageCache {
        artifacts: Mutex<HashMap<String, ImageArtifact>>,
    }

    impl FakeImageCache {
        pub fn with_artifact(image_ref: impl Into<String>, artifact: ImageArtifact) -> Self {
            let cache = Self::default();
            cache
                .artifacts
                .lock()
                .unwrap()
                .insert(image_ref.into(), artifact);
            cache
        }
    }

    #[async_trait]
    impl ImageCache for FakeImageCache {
        async fn resolve(&self, image_ref: &str) -> Result<ImageArtifact> {
            self.artifacts
                .lock()
                .unwrap()
                .get(image_ref)
                .cloned()
                .ok_or_else(|| crate::error::ProviderError::not_found(image_ref.to_string(), "imagecache.resolve"))
        }
    }
}
