//! Account lifecycle controller.
//!
//! Every mutation of the persisted record goes through one async mutex, so
//! allocate/create/login/reset never interleave. The integrity watcher and
//! heartbeat run as separate tasks; loss notifications carry the watcher
//! generation they were armed with and are dropped once it is stale.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use super::store::{PersistedState, StateStore};
use super::types::{AllocationOutcome, CreatedAccount, LifecycleEvent, LifecycleState, LoginOutcome};
use crate::client::ServerNotifier;
use crate::config::BinderConfig;
use crate::crypto::{self, KeyMaterial};
use crate::error::{BinderError, Result};
use crate::storage::{self, Integrity, StorageUnit, BYTES_PER_MB};
use crate::vault::{self, EncryptedVault};
use crate::watcher::{watch_integrity, LostCallback, TaskHandle, WatchMode, WatchOptions};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub allowed_capacities_mb: Vec<u64>,
    pub watch: WatchOptions,
    pub kdf_rounds: u32,
    pub kdf_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &BinderConfig) -> Self {
        Self {
            allowed_capacities_mb: config.storage.allowed_capacities_mb.clone(),
            watch: config.watch_options(),
            kdf_rounds: config.vault.kdf_rounds,
            kdf_timeout: Duration::from_millis(config.vault.kdf_timeout_ms),
            heartbeat_interval: Duration::from_millis(config.server.heartbeat_interval_ms.max(1)),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&BinderConfig::default())
    }
}

struct ControllerState {
    persisted: PersistedState,
    lifecycle: LifecycleState,
    watcher: Option<TaskHandle>,
    /// Bumped whenever the watcher is re-armed or stopped.
    generation: u64,
}

struct Inner {
    state: Mutex<ControllerState>,
    store: StateStore,
    notifier: Arc<dyn ServerNotifier>,
    settings: ControllerSettings,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Inner {
    async fn integrity_lost(&self, generation: u64, status: Integrity) {
        let address = {
            let mut st = self.state.lock().await;
            if st.generation != generation {
                debug!("Dropping stale integrity notification ({})", status);
                return;
            }
            // a one-shot watcher has exited after firing; forget it so the
            // next successful verify re-arms
            if self.settings.watch.mode == WatchMode::OneShot {
                st.watcher.take();
            }
            self.record_loss(&mut st, status, true)
        };

        if let Some(address) = address {
            self.notify_remove(&address).await;
        }
    }

    /// Move the lifecycle after a loss and publish it. Unless `force` is set,
    /// a loss that leaves the state unchanged is treated as already reported.
    /// Returns the address the server should be told about.
    fn record_loss(&self, st: &mut ControllerState, status: Integrity, force: bool) -> Option<String> {
        let previous = st.lifecycle;
        st.lifecycle = previous.after_loss(status);
        if previous == st.lifecycle && !force {
            return None;
        }
        warn!("Storage integrity lost ({}): {} -> {}", status, previous, st.lifecycle);
        let _ = self.events.send(LifecycleEvent::IntegrityLost {
            status,
            state: st.lifecycle,
        });
        st.persisted.address.clone()
    }

    async fn notify_register(&self, address: &str, capacity_bytes: u64) {
        match self.notifier.register(address, capacity_bytes).await {
            Ok(()) => info!("Server updated with user info for {}", address),
            Err(e) => warn!("Failed to register {} ({} bytes) with server: {}", address, capacity_bytes, e),
        }
    }

    async fn notify_remove(&self, address: &str) {
        match self.notifier.remove(address).await {
            Ok(()) => info!("Server notified about storage removal for {}", address),
            Err(e) => warn!("Failed to notify server about storage removal: {}", e),
        }
    }
}

/// Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct AccountController {
    inner: Arc<Inner>,
}

impl AccountController {
    /// Load the persisted record and work out where the lifecycle stands.
    pub async fn open(
        store: StateStore,
        notifier: Arc<dyn ServerNotifier>,
        settings: ControllerSettings,
    ) -> Result<Self> {
        let persisted = store.load().await?;
        let (events, _) = broadcast::channel(32);

        let controller = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ControllerState {
                    persisted,
                    lifecycle: LifecycleState::NoStorage,
                    watcher: None,
                    generation: 0,
                }),
                store,
                notifier,
                settings,
                events,
            }),
        };

        {
            let mut st = controller.inner.state.lock().await;
            if let Some(unit) = st.persisted.storage_unit() {
                match storage::verify(&unit).await {
                    Ok(Integrity::Valid) => {
                        st.lifecycle = if st.persisted.has_account() {
                            LifecycleState::AwaitingAccountChoice
                        } else {
                            LifecycleState::StorageAllocated
                        };
                        controller.arm_watcher(&mut st, unit).await;
                    }
                    Ok(status) => warn!("Bound storage {}: {}", unit.file_path.display(), status),
                    Err(e) => warn!("Could not check bound storage {}: {}", unit.file_path.display(), e),
                }
            }
            info!(
                "Account controller ready: state={}, existing user={}",
                st.lifecycle,
                st.persisted.has_account()
            );
        }

        Ok(controller)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.state.lock().await.lifecycle
    }

    pub async fn storage_unit(&self) -> Option<StorageUnit> {
        self.inner.state.lock().await.persisted.storage_unit()
    }

    pub async fn has_account(&self) -> bool {
        self.inner.state.lock().await.persisted.has_account()
    }

    /// Allocate a fresh storage file of `capacity_mb` under `directory` and
    /// bind it. An existing account is kept; the caller must then choose
    /// between logging in to it and resetting.
    pub async fn allocate(&self, directory: &Path, capacity_mb: u64) -> Result<AllocationOutcome> {
        if capacity_mb == 0 {
            return Err(BinderError::Allocation("capacity must be greater than zero".to_string()));
        }
        let capacity_bytes = capacity_mb
            .checked_mul(BYTES_PER_MB)
            .ok_or_else(|| BinderError::Allocation(format!("capacity of {} MB is too large", capacity_mb)))?;

        let mut st = self.inner.state.lock().await;
        let unit = storage::allocate(directory, capacity_bytes).await?;
        match self.bind_unit(&mut st, unit.clone()).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let _ = storage::release(&unit.file_path).await;
                Err(e)
            }
        }
    }

    /// Bind a file the user picked by hand (recovery path when automatic
    /// verification fails).
    pub async fn select_manually(&self, path: &Path) -> Result<AllocationOutcome> {
        let mut st = self.inner.state.lock().await;
        let unit = storage::select_manually(path, &self.inner.settings.allowed_capacities_mb).await?;
        self.bind_unit(&mut st, unit).await
    }

    /// Check the bound file now. A valid result re-arms a stopped watcher.
    pub async fn verify(&self) -> Result<Integrity> {
        let mut st = self.inner.state.lock().await;
        let unit = match st.persisted.storage_unit() {
            Some(unit) => unit,
            None => return Ok(Integrity::Missing),
        };

        let status = storage::verify(&unit).await?;
        if status.is_valid() {
            if st.lifecycle == LifecycleState::NoStorage {
                st.lifecycle = if st.persisted.has_account() {
                    LifecycleState::AwaitingAccountChoice
                } else {
                    LifecycleState::StorageAllocated
                };
            }
            let running = st.watcher.as_ref().map(|w| !w.is_finished()).unwrap_or(false);
            if !running {
                self.arm_watcher(&mut st, unit).await;
            }
        } else {
            // a live watcher means this loss has not been reported yet; any
            // handler it already spawned goes stale once we disarm
            let unreported = st.watcher.is_some();
            Self::disarm(&mut st).await;
            if let Some(address) = self.inner.record_loss(&mut st, status, unreported) {
                drop(st);
                self.inner.notify_remove(&address).await;
            }
        }
        Ok(status)
    }

    /// Re-send the registration for the current account, reporting failure
    /// to the caller instead of only logging it.
    pub async fn update_server(&self) -> Result<()> {
        let (address, capacity_bytes) = {
            let st = self.inner.state.lock().await;
            let address = st.persisted.address.clone().ok_or(BinderError::NoAccount)?;
            let unit = st.persisted.storage_unit().ok_or_else(storage_not_found)?;
            (address, unit.declared_capacity_bytes)
        };
        self.inner.notifier.register(&address, capacity_bytes).await?;
        info!("Distributed storage updated for {} ({} bytes)", address, capacity_bytes);
        Ok(())
    }

    /// Tell the server this address no longer provides storage, without
    /// touching local state.
    pub async fn remove_storage(&self) -> Result<()> {
        let address = self
            .inner
            .state
            .lock()
            .await
            .persisted
            .address
            .clone()
            .ok_or(BinderError::NoAccount)?;
        self.inner.notifier.remove(&address).await?;
        info!("Server notified about storage removal for {}", address);
        Ok(())
    }

    /// Generate a new identity, seal it and bind it to the current storage.
    pub async fn create_account(&self) -> Result<CreatedAccount> {
        let mut st = self.inner.state.lock().await;
        match st.lifecycle {
            LifecycleState::StorageAllocated | LifecycleState::AwaitingAccountChoice => {}
            other => {
                return Err(BinderError::InvalidState(format!(
                    "cannot create an account while {}",
                    other
                )))
            }
        }
        if st.persisted.has_account() || st.persisted.address.is_some() {
            return Err(BinderError::AccountExists);
        }

        let unit = st.persisted.storage_unit().ok_or_else(storage_not_found)?;
        if !storage::verify(&unit).await?.is_valid() {
            return Err(storage_not_found());
        }

        let keys = crypto::generate_identity()?;
        let password = vault::generate_password()?;
        let sealed = self.seal(keys.clone(), password.clone()).await?;

        self.persist_identity(&mut st, sealed, password, &keys.address).await?;
        st.lifecycle = LifecycleState::Active;
        self.arm_watcher(&mut st, unit.clone()).await;
        let _ = self.inner.events.send(LifecycleEvent::AccountActive {
            address: keys.address.clone(),
        });
        info!("New account created: {}", keys.address);
        drop(st);

        self.inner.notify_register(&keys.address, unit.declared_capacity_bytes).await;
        Ok(CreatedAccount {
            address: keys.address,
            phrase: keys.phrase,
        })
    }

    /// Log in by re-entering a recovery phrase.
    ///
    /// With an existing vault the phrase must reproduce the stored address.
    /// A missing storage file is recreated at its declared capacity.
    pub async fn login_with_phrase(&self, phrase: &str) -> Result<LoginOutcome> {
        let derived = crypto::derive_identity(phrase)?;

        let mut st = self.inner.state.lock().await;
        let unit = st.persisted.storage_unit().ok_or_else(|| {
            BinderError::Allocation(
                "Cannot recreate storage file. Storage size unknown. Please allocate storage first.".to_string(),
            )
        })?;

        let password = match (st.persisted.vault.clone(), st.persisted.vault_password.clone()) {
            (Some(sealed), Some(password)) => {
                let stored: KeyMaterial = self.open_vault(sealed, password.clone()).await?;
                if stored.address != derived.address {
                    warn!("Login rejected: phrase does not match the stored identity");
                    return Err(BinderError::IdentityMismatch);
                }
                password
            }
            _ => {
                if let Some(address) = &st.persisted.address {
                    if *address != derived.address {
                        return Err(BinderError::IdentityMismatch);
                    }
                }
                vault::generate_password()?
            }
        };

        let storage_recreated = match storage::verify(&unit).await? {
            Integrity::Valid => false,
            Integrity::Missing => {
                info!(
                    "Storage file missing, recreating {} MB at {}",
                    unit.capacity_mb(),
                    unit.file_path.display()
                );
                Self::disarm(&mut st).await;
                storage::allocate_at(&unit.file_path, unit.declared_capacity_bytes).await?;
                self.arm_watcher(&mut st, unit.clone()).await;
                true
            }
            status => {
                return Err(BinderError::InvalidState(format!(
                    "{}; reallocate storage or reset the account",
                    status
                )))
            }
        };

        // Re-seal so the stored vault always reflects the latest derivation
        let sealed = self.seal(derived.clone(), password.clone()).await?;
        self.persist_identity(&mut st, sealed, password, &derived.address).await?;
        st.lifecycle = LifecycleState::Active;
        self.arm_watcher(&mut st, unit.clone()).await;
        let _ = self.inner.events.send(LifecycleEvent::AccountActive {
            address: derived.address.clone(),
        });
        info!("Logged in as {}", derived.address);
        drop(st);

        self.inner.notify_register(&derived.address, unit.declared_capacity_bytes).await;
        Ok(LoginOutcome {
            address: derived.address,
            storage_recreated,
        })
    }

    /// The recovery phrase for display, or `None` when no account exists.
    pub async fn get_recovery_phrase(&self) -> Result<Option<String>> {
        let st = self.inner.state.lock().await;
        let (sealed, password) = match (&st.persisted.vault, &st.persisted.vault_password) {
            (Some(sealed), Some(password)) => (sealed.clone(), password.clone()),
            _ => return Ok(None),
        };
        if st.lifecycle != LifecycleState::Active {
            return Err(BinderError::InvalidState(
                "Log in with your recovery phrase first".to_string(),
            ));
        }
        drop(st);

        let keys: KeyMaterial = self.open_vault(sealed, password).await?;
        Ok(Some(keys.phrase))
    }

    pub async fn get_address(&self) -> Option<String> {
        self.inner.state.lock().await.persisted.address.clone()
    }

    /// Destroy the account: stop the watcher, clear persisted state, unlink
    /// the storage file and tell the server. Only the state clear can fail.
    pub async fn reset(&self) -> Result<()> {
        let mut st = self.inner.state.lock().await;
        Self::disarm(&mut st).await;

        if let Err(e) = self.inner.store.clear().await {
            error!("Reset aborted, persisted state could not be cleared: {}", e);
            if let (Some(unit), true) = (st.persisted.storage_unit(), st.lifecycle.has_storage()) {
                self.arm_watcher(&mut st, unit).await;
            }
            return Err(e);
        }

        let previous = std::mem::take(&mut st.persisted);
        if let Some(path) = &previous.storage_file_path {
            if let Err(e) = storage::release(path).await {
                warn!("Could not remove storage file {}: {}", path.display(), e);
            }
        }
        st.lifecycle = LifecycleState::NoStorage;
        let _ = self.inner.events.send(LifecycleEvent::AccountReset);
        info!("Account reset");
        drop(st);

        if let Some(address) = previous.address {
            self.inner.notify_remove(&address).await;
        }
        Ok(())
    }

    /// Periodic liveness ping for the persisted address.
    pub fn start_heartbeat(&self) -> TaskHandle {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        TaskHandle::spawn_periodic(self.inner.settings.heartbeat_interval, move |_stop| {
            let weak = weak.clone();
            async move {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return false,
                };
                let address = inner.state.lock().await.persisted.address.clone();
                match address {
                    Some(address) => match inner.notifier.heartbeat(&address).await {
                        Ok(()) => debug!("Heartbeat sent for {}", address),
                        Err(e) => warn!("Failed to send heartbeat: {}", e),
                    },
                    None => debug!("No address found for heartbeat"),
                }
                true
            }
        })
    }

    /// Stop background monitoring (used on process exit).
    pub async fn shutdown(&self) {
        let mut st = self.inner.state.lock().await;
        Self::disarm(&mut st).await;
    }

    async fn bind_unit(&self, st: &mut ControllerState, unit: StorageUnit) -> Result<AllocationOutcome> {
        let previous = st.persisted.clone();
        st.persisted.bind(&unit);
        if let Err(e) = self.inner.store.save(&mut st.persisted).await {
            st.persisted = previous;
            return Err(e);
        }

        let existing_user = st.persisted.has_account();
        st.lifecycle = if existing_user {
            LifecycleState::AwaitingAccountChoice
        } else {
            LifecycleState::StorageAllocated
        };
        self.arm_watcher(st, unit.clone()).await;

        info!(
            "Storage bound: {} ({} MB), existing user: {}",
            unit.file_path.display(),
            unit.capacity_mb(),
            existing_user
        );
        let _ = self.inner.events.send(LifecycleEvent::StorageAllocated {
            path: unit.file_path.clone(),
            capacity_bytes: unit.declared_capacity_bytes,
            existing_user,
        });
        Ok(AllocationOutcome { unit, existing_user })
    }

    async fn persist_identity(
        &self,
        st: &mut ControllerState,
        sealed: EncryptedVault,
        password: String,
        address: &str,
    ) -> Result<()> {
        let previous = st.persisted.clone();
        st.persisted.vault = Some(sealed);
        st.persisted.vault_password = Some(password);
        st.persisted.address = Some(address.to_string());
        if let Err(e) = self.inner.store.save(&mut st.persisted).await {
            st.persisted = previous;
            return Err(e);
        }
        Ok(())
    }

    async fn seal(&self, keys: KeyMaterial, password: String) -> Result<EncryptedVault> {
        let settings = &self.inner.settings;
        vault::seal_in_background(keys, password, settings.kdf_rounds, settings.kdf_timeout).await
    }

    async fn open_vault(&self, sealed: EncryptedVault, password: String) -> Result<KeyMaterial> {
        vault::open_in_background(sealed, password, self.inner.settings.kdf_timeout).await
    }

    async fn arm_watcher(&self, st: &mut ControllerState, unit: StorageUnit) {
        Self::disarm(st).await;
        let generation = st.generation;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let on_lost: LostCallback = Arc::new(move |status: Integrity| {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move {
                    inner.integrity_lost(generation, status).await;
                });
            }
        });
        st.watcher = Some(watch_integrity(unit, self.inner.settings.watch.clone(), on_lost));
    }

    async fn disarm(st: &mut ControllerState) {
        st.generation += 1;
        if let Some(watcher) = st.watcher.take() {
            watcher.stop().await;
        }
    }
}

fn storage_not_found() -> BinderError {
    BinderError::InvalidState("Storage file not found. Please allocate storage first.".to_string())
}
