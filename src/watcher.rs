//! Background integrity checks for a bound storage file.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::storage::{self, Integrity, StorageUnit};

/// Whether the watcher reports a loss once, or on every failing tick.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    #[default]
    OneShot,
    Repeating,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub interval: Duration,
    /// Invalid results are ignored for this long after arming.
    pub grace: Duration,
    pub mode: WatchMode,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
            grace: Duration::from_millis(2000),
            mode: WatchMode::OneShot,
        }
    }
}

pub type LostCallback = Arc<dyn Fn(Integrity) + Send + Sync>;

/// Stop handle for a periodic background task.
///
/// `stop()` returns only once the task has exited. Dropping the handle
/// aborts the task.
pub struct TaskHandle {
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Run `tick` every `interval` until stopped or until it returns `false`.
    pub fn spawn_periodic<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() fires immediately; the first real check is one period out
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
                if !tick(stop_rx.clone()).await {
                    break;
                }
            }
        });
        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Periodically verify `unit`, calling `on_lost` when it stops being valid.
///
/// In [`WatchMode::OneShot`] the watcher fires once and exits; re-arm by
/// calling this again after the next successful verify/allocate.
pub fn watch_integrity(unit: StorageUnit, options: WatchOptions, on_lost: LostCallback) -> TaskHandle {
    let armed_at = Instant::now();
    let WatchOptions { interval, grace, mode } = options;
    debug!("Integrity watcher armed for {}", unit.file_path.display());

    TaskHandle::spawn_periodic(interval, move |stop_rx| {
        let unit = unit.clone();
        let on_lost = on_lost.clone();
        async move {
            match storage::verify(&unit).await {
                Ok(Integrity::Valid) => true,
                Ok(status) => {
                    if armed_at.elapsed() < grace {
                        debug!("Ignoring {} during grace window", status);
                        return true;
                    }
                    if *stop_rx.borrow() {
                        return false;
                    }
                    warn!("Storage integrity lost for {}: {}", unit.file_path.display(), status);
                    on_lost(status);
                    mode == WatchMode::Repeating
                }
                Err(e) => {
                    warn!("Integrity check failed for {}: {}", unit.file_path.display(), e);
                    true
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fast(mode: WatchMode, grace: Duration) -> WatchOptions {
        WatchOptions {
            interval: Duration::from_millis(20),
            grace,
            mode,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, LostCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let cb: LostCallback = Arc::new(move |_status: Integrity| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, cb)
    }

    #[tokio::test]
    async fn test_one_shot_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let unit = storage::allocate(dir.path(), 1024).await.unwrap();

        let seen: Arc<Mutex<Vec<Integrity>>> = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let watcher = watch_integrity(
            unit.clone(),
            fast(WatchMode::OneShot, Duration::ZERO),
            Arc::new(move |status: Integrity| s.lock().unwrap().push(status)),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(seen.lock().unwrap().is_empty());

        std::fs::remove_file(&unit.file_path).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*seen.lock().unwrap(), vec![Integrity::Missing]);
        assert!(watcher.is_finished());
    }

    #[tokio::test]
    async fn test_repeating_keeps_firing() {
        let dir = tempfile::tempdir().unwrap();
        let unit = storage::allocate(dir.path(), 1024).await.unwrap();
        let (count, cb) = counter();
        let watcher = watch_integrity(unit.clone(), fast(WatchMode::Repeating, Duration::ZERO), cb);

        std::fs::remove_file(&unit.file_path).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);
        assert!(!watcher.is_finished());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_no_callbacks_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let unit = storage::allocate(dir.path(), 1024).await.unwrap();
        let (count, cb) = counter();
        let watcher = watch_integrity(unit.clone(), fast(WatchMode::Repeating, Duration::ZERO), cb);

        watcher.stop().await;
        std::fs::remove_file(&unit.file_path).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_grace_window_suppresses() {
        let dir = tempfile::tempdir().unwrap();
        let unit = storage::allocate(dir.path(), 1024).await.unwrap();
        let (count, cb) = counter();
        let watcher = watch_integrity(unit.clone(), fast(WatchMode::OneShot, Duration::from_secs(30)), cb);

        std::fs::remove_file(&unit.file_path).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!watcher.is_finished());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_size_change_reported() {
        let dir = tempfile::tempdir().unwrap();
        let unit = storage::allocate(dir.path(), 1024).await.unwrap();
        let seen: Arc<Mutex<Vec<Integrity>>> = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _watcher = watch_integrity(
            unit.clone(),
            fast(WatchMode::OneShot, Duration::ZERO),
            Arc::new(move |status: Integrity| s.lock().unwrap().push(status)),
        );

        let f = std::fs::OpenOptions::new().write(true).open(&unit.file_path).unwrap();
        f.set_len(2048).unwrap();
        drop(f);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Integrity::SizeMismatch { expected: 1024, actual: 2048 }]
        );
    }
}
