//! In-memory notifier double for controller tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::ServerNotifier;
use crate::error::{BinderError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Register { address: String, capacity_bytes: u64 },
    Heartbeat { address: String },
    Remove { address: String },
}

#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<Call>>,
    offline: AtomicBool,
}

impl RecordingNotifier {
    /// A notifier whose every call fails as if the server were down.
    pub fn offline() -> Self {
        let n = Self::default();
        n.offline.store(true, Ordering::SeqCst);
        n
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.offline.load(Ordering::SeqCst) {
            return Err(BinderError::Server("Cannot reach server. Please try again later.".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ServerNotifier for RecordingNotifier {
    async fn register(&self, address: &str, capacity_bytes: u64) -> Result<()> {
        self.record(Call::Register {
            address: address.to_string(),
            capacity_bytes,
        })
    }

    async fn heartbeat(&self, address: &str) -> Result<()> {
        self.record(Call::Heartbeat { address: address.to_string() })
    }

    async fn remove(&self, address: &str) -> Result<()> {
        self.record(Call::Remove { address: address.to_string() })
    }
}
