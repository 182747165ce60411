//! Capacity-allocated storage files bound to an identity.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{BinderError, Result};

/// Folder created under the user-chosen directory.
pub const STORAGE_SUBDIR: &str = "HashChat-Storage";
pub const STORAGE_EXTENSION: &str = "hcbdb";
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Capacities (MB) a manually selected file may have.
pub const DEFAULT_ALLOWED_CAPACITIES_MB: [u64; 5] = [500, 700, 1000, 1500, 2000];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StorageUnit {
    pub file_path: PathBuf,
    pub declared_capacity_bytes: u64,
}

impl StorageUnit {
    pub fn new(file_path: impl Into<PathBuf>, declared_capacity_bytes: u64) -> Self {
        Self {
            file_path: file_path.into(),
            declared_capacity_bytes,
        }
    }

    /// Declared capacity rounded to whole megabytes.
    pub fn capacity_mb(&self) -> u64 {
        bytes_to_mb_rounded(self.declared_capacity_bytes)
    }
}

/// Result of checking a unit against the filesystem.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Integrity {
    Valid,
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
}

impl Integrity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Integrity::Valid)
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Integrity::Valid => None,
            Integrity::Missing => Some("MISSING"),
            Integrity::SizeMismatch { .. } => Some("SIZE_MISMATCH"),
        }
    }
}

impl std::fmt::Display for Integrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Integrity::Valid => write!(f, "storage file is valid"),
            Integrity::Missing => write!(f, "storage file is missing"),
            Integrity::SizeMismatch { expected, actual } => {
                write!(f, "storage file size mismatch (expected {} bytes, found {})", expected, actual)
            }
        }
    }
}

pub fn bytes_to_mb_rounded(bytes: u64) -> u64 {
    (bytes + BYTES_PER_MB / 2) / BYTES_PER_MB
}

fn allocation_error(path: &Path, err: std::io::Error) -> BinderError {
    BinderError::Allocation(format!("{}: {}", path.display(), err))
}

/// Create a uniquely named storage file of exactly `capacity_bytes` under
/// `<directory>/HashChat-Storage/`.
pub async fn allocate(directory: &Path, capacity_bytes: u64) -> Result<StorageUnit> {
    match fs::metadata(directory).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(BinderError::Allocation(format!(
                "{}: not a directory",
                directory.display()
            )))
        }
        Err(e) => return Err(allocation_error(directory, e)),
    }

    let storage_dir = directory.join(STORAGE_SUBDIR);
    fs::create_dir_all(&storage_dir)
        .await
        .map_err(|e| allocation_error(&storage_dir, e))?;

    let mut suffix = [0u8; 8];
    OsRng
        .try_fill_bytes(&mut suffix)
        .map_err(|e| BinderError::EntropySource(e.to_string()))?;
    let file_name = format!("blockchain_{}.{}", hex::encode(suffix), STORAGE_EXTENSION);

    allocate_at(&storage_dir.join(file_name), capacity_bytes).await
}

/// (Re)create a storage file at a known path. An existing file is truncated.
pub async fn allocate_at(path: &Path, capacity_bytes: u64) -> Result<StorageUnit> {
    if capacity_bytes == 0 {
        return Err(BinderError::Allocation("capacity must be greater than zero".to_string()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| allocation_error(parent, e))?;
    }

    let file = fs::File::create(path).await.map_err(|e| allocation_error(path, e))?;
    // Extending with set_len zero-fills (sparse where the filesystem supports it)
    if let Err(e) = file.set_len(capacity_bytes).await {
        drop(file);
        return Err(discard_partial(path, e).await);
    }
    if let Err(e) = file.sync_all().await {
        drop(file);
        return Err(discard_partial(path, e).await);
    }

    info!(
        "Storage allocated: {} ({} MB)",
        path.display(),
        bytes_to_mb_rounded(capacity_bytes)
    );
    Ok(StorageUnit::new(path, capacity_bytes))
}

/// Remove a half-created file so a failed allocation leaves nothing behind.
async fn discard_partial(path: &Path, err: std::io::Error) -> BinderError {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!("Could not remove partial storage file {}: {}", path.display(), e);
        }
    }
    allocation_error(path, err)
}

/// Stat the bound file. A missing file is a normal outcome, not an error.
pub async fn verify(unit: &StorageUnit) -> Result<Integrity> {
    let meta = match fs::metadata(&unit.file_path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Storage file not found: {}", unit.file_path.display());
            return Ok(Integrity::Missing);
        }
        Err(e) => return Err(e.into()),
    };

    if !meta.is_file() {
        return Ok(Integrity::Missing);
    }
    if meta.len() != unit.declared_capacity_bytes {
        return Ok(Integrity::SizeMismatch {
            expected: unit.declared_capacity_bytes,
            actual: meta.len(),
        });
    }
    Ok(Integrity::Valid)
}

/// Bind an existing file picked by the user. Its size, rounded to whole MB,
/// must be one of `allowed_capacities_mb`.
pub async fn select_manually(path: &Path, allowed_capacities_mb: &[u64]) -> Result<StorageUnit> {
    let meta = fs::metadata(path).await?;
    if !meta.is_file() {
        return Err(BinderError::InvalidState(format!("{} is not a regular file", path.display())));
    }

    let actual_mb = bytes_to_mb_rounded(meta.len());
    if !allowed_capacities_mb.contains(&actual_mb) {
        warn!("Rejected manual storage file {} ({} MB)", path.display(), actual_mb);
        return Err(BinderError::UnrecognizedCapacity {
            actual_mb,
            allowed: allowed_capacities_mb.to_vec(),
        });
    }

    info!("Storage file selected manually: {} ({} MB)", path.display(), actual_mb);
    Ok(StorageUnit::new(path, meta.len()))
}

/// Unlink a storage file. Already-missing files are fine.
pub async fn release(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => {
            info!("Storage file removed: {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let unit = allocate(dir.path(), 2 * BYTES_PER_MB).await.unwrap();

        assert!(unit.file_path.starts_with(dir.path().join(STORAGE_SUBDIR)));
        let name = unit.file_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("blockchain_") && name.ends_with(".hcbdb"));
        assert_eq!(std::fs::metadata(&unit.file_path).unwrap().len(), 2 * BYTES_PER_MB);
        assert_eq!(verify(&unit).await.unwrap(), Integrity::Valid);
    }

    #[tokio::test]
    async fn test_allocated_file_is_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let unit = allocate(dir.path(), 4096).await.unwrap();
        let data = std::fs::read(&unit.file_path).unwrap();
        assert_eq!(data.len(), 4096);
        assert!(data.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let a = allocate(dir.path(), 1024).await.unwrap();
        let b = allocate(dir.path(), 1024).await.unwrap();
        assert_ne!(a.file_path, b.file_path);
    }

    #[tokio::test]
    async fn test_verify_detects_missing_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let unit = allocate(dir.path(), BYTES_PER_MB).await.unwrap();

        let f = std::fs::OpenOptions::new().write(true).open(&unit.file_path).unwrap();
        f.set_len(10).unwrap();
        drop(f);
        let status = verify(&unit).await.unwrap();
        assert_eq!(status, Integrity::SizeMismatch { expected: BYTES_PER_MB, actual: 10 });
        assert_eq!(status.reason(), Some("SIZE_MISMATCH"));

        std::fs::remove_file(&unit.file_path).unwrap();
        let status = verify(&unit).await.unwrap();
        assert_eq!(status, Integrity::Missing);
        assert_eq!(status.reason(), Some("MISSING"));
    }

    #[tokio::test]
    async fn test_allocate_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let res = allocate(&dir.path().join("nope"), 1024).await;
        assert!(matches!(res, Err(BinderError::Allocation(_))));
    }

    #[tokio::test]
    async fn test_zero_capacity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let res = allocate(dir.path(), 0).await;
        assert!(matches!(res, Err(BinderError::Allocation(_))));
    }

    #[tokio::test]
    async fn test_select_manually_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restored.hcbdb");
        std::fs::File::create(&path).unwrap().set_len(700 * BYTES_PER_MB).unwrap();

        let unit = select_manually(&path, &DEFAULT_ALLOWED_CAPACITIES_MB).await.unwrap();
        assert_eq!(unit.capacity_mb(), 700);
        assert_eq!(verify(&unit).await.unwrap(), Integrity::Valid);

        let odd = dir.path().join("odd.hcbdb");
        std::fs::File::create(&odd).unwrap().set_len(123 * BYTES_PER_MB).unwrap();
        let res = select_manually(&odd, &DEFAULT_ALLOWED_CAPACITIES_MB).await;
        assert!(matches!(res, Err(BinderError::UnrecognizedCapacity { actual_mb: 123, .. })));
    }

    #[tokio::test]
    async fn test_select_manually_rounds_to_megabytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("almost.hcbdb");
        std::fs::File::create(&path)
            .unwrap()
            .set_len(500 * BYTES_PER_MB - 1000)
            .unwrap();

        let unit = select_manually(&path, &DEFAULT_ALLOWED_CAPACITIES_MB).await.unwrap();
        assert_eq!(unit.capacity_mb(), 500);
        assert_eq!(unit.declared_capacity_bytes, 500 * BYTES_PER_MB - 1000);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let unit = allocate(dir.path(), 1024).await.unwrap();
        release(&unit.file_path).await.unwrap();
        release(&unit.file_path).await.unwrap();
        assert_eq!(verify(&unit).await.unwrap(), Integrity::Missing);
    }

    #[tokio::test]
    async fn test_failed_allocation_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.hcbdb");
        std::fs::write(&path, b"half").unwrap();

        let err = discard_partial(&path, std::io::Error::new(ErrorKind::Other, "disk full")).await;
        assert!(matches!(err, BinderError::Allocation(ref m) if m.contains("disk full")));
        assert!(!path.exists());

        // already gone is fine
        let err = discard_partial(&path, std::io::Error::new(ErrorKind::Other, "again")).await;
        assert!(matches!(err, BinderError::Allocation(_)));
    }
}
