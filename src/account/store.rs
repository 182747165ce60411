//! Persisted account record and its on-disk store

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{BinderError, Result};
use crate::storage::StorageUnit;
use crate::vault::EncryptedVault;

/// Everything that survives a restart.
///
/// `vault_password` sits next to the vault it opens, so anyone who can read
/// this record can open the vault.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_capacity_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault: Option<EncryptedVault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl PersistedState {
    /// The bound unit, if both path and capacity are known.
    pub fn storage_unit(&self) -> Option<StorageUnit> {
        match (&self.storage_file_path, self.declared_capacity_bytes) {
            (Some(path), Some(capacity)) => Some(StorageUnit::new(path.clone(), capacity)),
            _ => None,
        }
    }

    pub fn bind(&mut self, unit: &StorageUnit) {
        self.storage_file_path = Some(unit.file_path.clone());
        self.declared_capacity_bytes = Some(unit.declared_capacity_bytes);
    }

    pub fn has_account(&self) -> bool {
        self.vault.is_some() && self.vault_password.is_some()
    }

    pub fn is_empty(&self) -> bool {
        *self == PersistedState::default()
    }

    fn touch(&mut self) {
        self.updated_at = Some(chrono::Utc::now().to_rfc3339());
    }
}

impl std::fmt::Debug for PersistedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedState")
            .field("storage_file_path", &self.storage_file_path)
            .field("declared_capacity_bytes", &self.declared_capacity_bytes)
            .field("has_vault", &self.vault.is_some())
            .field("address", &self.address)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// JSON file holding one [`PersistedState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record. A missing file means first run.
    pub async fn load(&self) -> Result<PersistedState> {
        match fs::read_to_string(&self.path).await {
            Ok(data) => serde_json::from_str(&data).map_err(|e| {
                BinderError::Persistence(format!("{} is corrupted: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state file at {}, starting empty", self.path.display());
                Ok(PersistedState::default())
            }
            Err(e) => Err(BinderError::Persistence(format!("{}: {}", self.path.display(), e))),
        }
    }

    /// Write the record atomically (temp file, then rename).
    pub async fn save(&self, state: &mut PersistedState) -> Result<()> {
        state.touch();
        let json = serde_json::to_string_pretty(state)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| BinderError::Persistence(format!("{}: {}", parent.display(), e)))?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| BinderError::Persistence(format!("{}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| BinderError::Persistence(format!("{}: {}", self.path.display(), e)))?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Persisted state cleared ({})", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BinderError::Persistence(format!("{}: {}", self.path.display(), e))),
        }
    }
}
