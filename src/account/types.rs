//! Lifecycle states, events and operation outcomes

use serde::Serialize;
use std::path::PathBuf;

use crate::storage::{Integrity, StorageUnit};

/// Where the account lifecycle currently stands.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    NoStorage,
    StorageAllocated,
    /// Storage is bound and an account already exists; the user must log in
    /// with its phrase or reset.
    AwaitingAccountChoice,
    Active,
}

impl LifecycleState {
    pub fn has_storage(&self) -> bool {
        !matches!(self, LifecycleState::NoStorage)
    }

    /// State after integrity loss.
    pub fn after_loss(self, status: Integrity) -> LifecycleState {
        match status {
            Integrity::Valid => self,
            Integrity::Missing => LifecycleState::NoStorage,
            // stale file: storage is still known, account must be re-confirmed
            Integrity::SizeMismatch { .. } => match self {
                LifecycleState::Active => LifecycleState::StorageAllocated,
                other => other,
            },
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::NoStorage => write!(f, "no storage"),
            LifecycleState::StorageAllocated => write!(f, "storage allocated"),
            LifecycleState::AwaitingAccountChoice => write!(f, "awaiting account choice"),
            LifecycleState::Active => write!(f, "active"),
        }
    }
}

/// Pushed to subscribers as the lifecycle moves.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StorageAllocated {
        path: PathBuf,
        capacity_bytes: u64,
        existing_user: bool,
    },
    AccountActive {
        address: String,
    },
    IntegrityLost {
        status: Integrity,
        state: LifecycleState,
    },
    AccountReset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationOutcome {
    pub unit: StorageUnit,
    pub existing_user: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedAccount {
    pub address: String,
    pub phrase: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginOutcome {
    pub address: String,
    pub storage_recreated: bool,
}
