//! The `Raw` collaborator: creates sparse or copied disk images.
//!
//! A single `CreateOptions{size_bytes?, source_file?}` replaces the
//! arbitrary-depth option structs (`WithSize`, `WithSourceFile`) the
//! original plugin API exposed — exactly one of the two fields is used by
//! any given call site.

use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::{ProviderError, Result};
use crate::paths::{self, FILE_MODE_RW_ALL};

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub size_bytes: Option<u64>,
    pub source_file: Option<std::path::PathBuf>,
}

/// Creates `path` if absent. With `size_bytes`, produces a sparse file of
/// that length (no data written, matching `qemu-img create -f raw`'s
/// hole-punching semantics). With `source_file`, copies that file's bytes
/// in full. Idempotent: if `path` already exists, returns without
/// touching it.
pub async fn create(path: &Path, opts: &CreateOptions) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ProviderError::transient(path.display().to_string(), "raw.create", e))?;
    }

    if let Some(source) = &opts.source_file {
        tokio::fs::copy(source, path)
            .await
            .map_err(|e| ProviderError::transient(path.display().to_string(), "raw.create", e))?;
        return paths::set_file_mode(path, FILE_MODE_RW_ALL).await;
    }

    let size = opts.size_bytes.unwrap_or(0);
    let file = File::create(path)
        .await
        .map_err(|e| ProviderError::transient(path.display().to_string(), "raw.create", e))?;
    file.set_len(size)
        .await
        .map_err(|e| ProviderError::transient(path.display().to_string(), "raw.create", e))?;
    drop(file);
    paths::set_file_mode(path, FILE_MODE_RW_ALL).await
}

pub async fn size_bytes(path: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| ProviderError::transient(path.display().to_string(), "raw.size_bytes", e))?;
    Ok(metadata.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_sparse_file_of_requested_size() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("disk.raw");
        create(
            &path,
            &CreateOptions {
                size_bytes: Some(1024 * 1024),
                source_file: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(size_bytes(&path).await.unwrap(), 1024 * 1024);
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("disk.raw");
        create(
            &path,
            &CreateOptions {
                size_bytes: Some(100),
                source_file: None,
            },
        )
        .await
        .unwrap();
        create(
            &path,
            &CreateOptions {
                size_bytes: Some(999),
                source_file: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(size_bytes(&path).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn copies_source_file() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        tokio::fs::write(&source, b"hello").await.unwrap();
        let dest = tmp.path().join("dest");
        create(
            &dest,
            &CreateOptions {
                size_bytes: None,
                source_file: Some(source),
            },
        )
        .await
        .unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello");
    }
}
