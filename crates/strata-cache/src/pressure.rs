//! Memory-pressure notifications
//!
//! Caches subscribe to a broadcast channel. The host application can forward its own
//! low-memory signal through [`MemoryPressureNotifier::notify`], or run a
//! [`MemoryPressureWatcher`] that polls available system memory.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::config::PressureSettings;

const CHANNEL_CAPACITY: usize = 16;

/// Severity of a memory-pressure event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Warning,
    Critical,
}

/// Broadcasts memory-pressure events to subscribed caches
#[derive(Debug, Clone)]
pub struct MemoryPressureNotifier {
    sender: broadcast::Sender<MemoryPressure>,
}

impl MemoryPressureNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemoryPressure> {
        self.sender.subscribe()
    }

    /// Send `level` to every subscriber, returning how many received it
    pub fn notify(&self, level: MemoryPressure) -> usize {
        match self.sender.send(level) {
            Ok(receivers) => {
                debug!(?level, receivers, "Broadcast memory pressure");
                receivers
            }
            Err(_) => 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryPressureNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify available memory against the configured threshold
///
/// Below the threshold is a warning, below half of it critical.
pub fn classify_available(
    available_bytes: u64,
    total_bytes: u64,
    low_memory_fraction: f64,
) -> Option<MemoryPressure> {
    if total_bytes == 0 {
        return None;
    }
    let fraction = available_bytes as f64 / total_bytes as f64;
    if fraction < low_memory_fraction / 2.0 {
        Some(MemoryPressure::Critical)
    } else if fraction < low_memory_fraction {
        Some(MemoryPressure::Warning)
    } else {
        None
    }
}

/// Polls system memory and notifies when it runs low
pub struct MemoryPressureWatcher {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl MemoryPressureWatcher {
    /// Start polling on the current Tokio runtime
    pub fn start(settings: &PressureSettings, notifier: Arc<MemoryPressureNotifier>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let poll_interval = settings.poll_interval();
        let low_memory_fraction = settings.low_memory_fraction;

        let handle = tokio::spawn(async move {
            let mut system = System::new();
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        system.refresh_memory();
                        let level = classify_available(
                            system.available_memory(),
                            system.total_memory(),
                            low_memory_fraction,
                        );
                        if let Some(level) = level {
                            warn!(
                                ?level,
                                available = system.available_memory(),
                                "System memory is low"
                            );
                            notifier.notify(level);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Memory pressure watcher stopped");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop polling and wait for the task to finish
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_available() {
        assert_eq!(classify_available(50, 100, 0.1), None);
        assert_eq!(
            classify_available(8, 100, 0.1),
            Some(MemoryPressure::Warning)
        );
        assert_eq!(
            classify_available(2, 100, 0.1),
            Some(MemoryPressure::Critical)
        );
        assert_eq!(classify_available(0, 0, 0.1), None);
    }

    #[tokio::test]
    async fn test_notify_reaches_subscribers() {
        let notifier = MemoryPressureNotifier::new();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        assert_eq!(notifier.notify(MemoryPressure::Warning), 2);
        assert_eq!(first.recv().await.unwrap(), MemoryPressure::Warning);
        assert_eq!(second.recv().await.unwrap(), MemoryPressure::Warning);
    }

    #[test]
    fn test_notify_without_subscribers() {
        let notifier = MemoryPressureNotifier::new();
        assert_eq!(notifier.notify(MemoryPressure::Critical), 0);
    }

    #[tokio::test]
    async fn test_watcher_stops() {
        let notifier = Arc::new(MemoryPressureNotifier::new());
        let settings = PressureSettings {
            poll_interval_secs: 1,
            // Never trips
            low_memory_fraction: 0.0,
        };
        let watcher = MemoryPressureWatcher::start(&settings, notifier);
        watcher.stop().await;
    }
}
