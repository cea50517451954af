//! Disk-backed blob store with expiration metadata
//!
//! Each key is stored as two files in the cache directory: the raw payload under the
//! key itself and a JSON sidecar `<key>.meta` holding the expiry time. All file I/O for
//! a directory runs on a single worker task fed by a bounded queue, so operations
//! issued by one caller are applied in the order they were issued.
//!
//! The store is best-effort. Write failures are logged and dropped, read failures and
//! unreadable metadata count as misses.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    fs,
    sync::{
        mpsc::{self, error::SendTimeoutError},
        oneshot,
    },
};
use tracing::{debug, info, warn};

use crate::{
    config::DiskSettings,
    error::{validate_key, Result},
    monitor::PerformanceMonitor,
};

const META_SUFFIX: &str = ".meta";
const TEMP_PREFIX: &str = ".tmp-";

/// Sidecar metadata written next to every payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskMetadata {
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a size-driven cleanup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub removed_entries: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

#[derive(Debug)]
enum DiskCommand {
    Store {
        key: String,
        bytes: Vec<u8>,
        expires_at: DateTime<Utc>,
    },
    Retrieve {
        key: String,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Remove {
        key: String,
    },
    CurrentSize {
        reply: oneshot::Sender<u64>,
    },
    Cleanup {
        target_bytes: u64,
        reply: oneshot::Sender<CleanupReport>,
    },
    CleanupExpired {
        reply: oneshot::Sender<usize>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a cache directory and its writer task
///
/// Cloning the handle shares the same worker. The worker stops once every handle is
/// dropped and the queue has drained.
#[derive(Debug, Clone)]
pub struct DiskBackedStore {
    directory: PathBuf,
    budget_bytes: u64,
    enqueue_timeout: Duration,
    sender: mpsc::Sender<DiskCommand>,
    monitor: Arc<PerformanceMonitor>,
}

impl DiskBackedStore {
    /// Start a store for `directory`
    ///
    /// Must be called from within a Tokio runtime. The directory is created on the
    /// first write.
    pub fn open(
        directory: impl Into<PathBuf>,
        budget_bytes: u64,
        settings: &DiskSettings,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        let (store, receiver) = Self::detached(directory, budget_bytes, settings, monitor);
        let worker = DiskWorker {
            directory: store.directory.clone(),
            budget_bytes,
            cleanup_ratio: settings.cleanup_ratio,
            monitor: store.monitor.clone(),
            tracked_bytes: None,
        };
        tokio::spawn(worker.run(receiver));
        store
    }

    fn detached(
        directory: impl Into<PathBuf>,
        budget_bytes: u64,
        settings: &DiskSettings,
        monitor: Arc<PerformanceMonitor>,
    ) -> (Self, mpsc::Receiver<DiskCommand>) {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let store = Self {
            directory: directory.into(),
            budget_bytes,
            enqueue_timeout: settings.enqueue_timeout(),
            sender,
            monitor,
        };
        (store, receiver)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Queue `bytes` for `key`, expiring after `ttl`
    ///
    /// Resolves once the write is queued, not once it hits the disk. If the queue stays
    /// full for longer than the configured timeout the write is dropped.
    pub async fn store(&self, key: &str, bytes: Vec<u8>, ttl: Duration) -> Result<()> {
        validate_key(key)?;
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let command = DiskCommand::Store {
            key: key.to_string(),
            bytes,
            expires_at,
        };

        match self.sender.send_timeout(command, self.enqueue_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(key = %key, "Disk write queue full, dropping write");
                self.monitor.record_dropped_write();
            }
            Err(SendTimeoutError::Closed(_)) => {
                warn!(key = %key, "Disk worker stopped, dropping write");
                self.monitor.record_dropped_write();
            }
        }
        Ok(())
    }

    /// Read `key`, returning `None` when absent, expired or unreadable
    pub async fn retrieve(&self, key: &str) -> Option<Vec<u8>> {
        if let Err(err) = validate_key(key) {
            debug!(error = %err, "Rejecting disk lookup");
            return None;
        }
        self.request(|reply| DiskCommand::Retrieve {
            key: key.to_string(),
            reply,
        })
        .await
        .flatten()
    }

    /// Queue removal of `key`
    pub async fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let command = DiskCommand::Remove {
            key: key.to_string(),
        };
        if self
            .sender
            .send_timeout(command, self.enqueue_timeout)
            .await
            .is_err()
        {
            warn!(key = %key, "Disk queue unavailable, dropping removal");
        }
        Ok(())
    }

    /// Total bytes of payload and metadata files in the directory
    pub async fn current_size(&self) -> u64 {
        self.request(|reply| DiskCommand::CurrentSize { reply })
            .await
            .unwrap_or(0)
    }

    /// Delete oldest-modified entries until the directory holds at most `target_bytes`
    pub async fn cleanup(&self, target_bytes: u64) -> CleanupReport {
        self.request(|reply| DiskCommand::Cleanup {
            target_bytes,
            reply,
        })
        .await
        .unwrap_or_default()
    }

    /// Delete every expired or unreadable entry, returning how many were removed
    pub async fn cleanup_expired(&self) -> usize {
        self.request(|reply| DiskCommand::CleanupExpired { reply })
            .await
            .unwrap_or(0)
    }

    /// Remove the whole cache directory
    pub async fn clear(&self) {
        self.request(|reply| DiskCommand::Clear { reply }).await;
    }

    /// Wait until every command queued before this call has been applied
    pub async fn flush(&self) {
        self.request(|reply| DiskCommand::Flush { reply }).await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DiskCommand,
    ) -> Option<T> {
        let (reply, response) = oneshot::channel();
        if self.sender.send(build(reply)).await.is_err() {
            warn!(directory = %self.directory.display(), "Disk worker is not running");
            return None;
        }
        response.await.ok()
    }
}

/// One key's files as found on disk
#[derive(Debug)]
struct DiskEntryFiles {
    key: String,
    bytes: u64,
    modified: SystemTime,
    has_payload: bool,
    has_meta: bool,
}

impl DiskEntryFiles {
    fn new(key: String, modified: SystemTime) -> Self {
        Self {
            key,
            bytes: 0,
            modified,
            has_payload: false,
            has_meta: false,
        }
    }
}

/// Cache entries plus leftovers of interrupted writes
#[derive(Debug, Default)]
struct DirectoryListing {
    entries: Vec<DiskEntryFiles>,
    temp_files: Vec<PathBuf>,
}

struct DiskWorker {
    directory: PathBuf,
    budget_bytes: u64,
    cleanup_ratio: f64,
    monitor: Arc<PerformanceMonitor>,
    /// Bytes in the directory, `None` until first measured
    tracked_bytes: Option<u64>,
}

impl DiskWorker {
    async fn run(mut self, mut receiver: mpsc::Receiver<DiskCommand>) {
        debug!(directory = %self.directory.display(), "Disk worker started");
        while let Some(command) = receiver.recv().await {
            self.handle(command).await;
        }
        debug!(directory = %self.directory.display(), "Disk worker stopped");
    }

    async fn handle(&mut self, command: DiskCommand) {
        match command {
            DiskCommand::Store {
                key,
                bytes,
                expires_at,
            } => {
                let previous = self.entry_bytes(&key).await;
                match self.write_entry(&key, &bytes, expires_at).await {
                    Ok(written) => {
                        if let Some(size) = &mut self.tracked_bytes {
                            *size = size.saturating_sub(previous) + written;
                        }
                        self.enforce_budget().await;
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "Failed to write cache entry");
                        self.tracked_bytes = None;
                    }
                }
            }
            DiskCommand::Retrieve { key, reply } => {
                let bytes = self.read_entry(&key).await;
                if bytes.is_some() {
                    self.monitor.record_disk_hit();
                } else {
                    self.monitor.record_disk_miss();
                }
                let _ = reply.send(bytes);
            }
            DiskCommand::Remove { key } => {
                self.remove_entry(&key).await;
            }
            DiskCommand::CurrentSize { reply } => {
                let size = self.total_size().await;
                self.tracked_bytes = Some(size);
                let _ = reply.send(size);
            }
            DiskCommand::Cleanup {
                target_bytes,
                reply,
            } => {
                let report = self.shrink_to(target_bytes).await;
                let _ = reply.send(report);
            }
            DiskCommand::CleanupExpired { reply } => {
                let removed = self.sweep_expired().await;
                let _ = reply.send(removed);
            }
            DiskCommand::Clear { reply } => {
                self.tracked_bytes = match fs::remove_dir_all(&self.directory).await {
                    Ok(()) => {
                        info!(directory = %self.directory.display(), "Cleared disk cache");
                        Some(0)
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => Some(0),
                    Err(err) => {
                        warn!(error = %err, "Failed to clear disk cache");
                        None
                    }
                };
                let _ = reply.send(());
            }
            DiskCommand::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.directory.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{}{}", key, META_SUFFIX))
    }

    fn forget(&mut self, bytes: u64) {
        if let Some(size) = &mut self.tracked_bytes {
            *size = size.saturating_sub(bytes);
        }
    }

    /// Current size of `key`'s files, zero when absent
    async fn entry_bytes(&self, key: &str) -> u64 {
        file_len(&self.payload_path(key)).await + file_len(&self.meta_path(key)).await
    }

    /// Write payload and metadata, returning the bytes now on disk for `key`
    async fn write_entry(
        &self,
        key: &str,
        bytes: &[u8],
        expires_at: DateTime<Utc>,
    ) -> std::io::Result<u64> {
        fs::create_dir_all(&self.directory).await?;

        let metadata = serde_json::to_vec(&DiskMetadata { expires_at })?;
        fs::write(self.meta_path(key), &metadata).await?;

        let temp_path = self.directory.join(format!("{}{}", TEMP_PREFIX, key));
        let written: std::io::Result<()> = async {
            fs::write(&temp_path, bytes).await?;
            fs::rename(&temp_path, self.payload_path(key)).await
        }
        .await;
        if let Err(err) = written {
            remove_quietly(&temp_path).await;
            return Err(err);
        }

        debug!(key = %key, bytes = bytes.len(), "Wrote cache entry");
        Ok((metadata.len() + bytes.len()) as u64)
    }

    async fn read_entry(&mut self, key: &str) -> Option<Vec<u8>> {
        let raw_meta = match fs::read(self.meta_path(key)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let freed = remove_quietly(&self.payload_path(key)).await;
                self.forget(freed);
                return None;
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Failed to read cache metadata");
                return None;
            }
        };

        let metadata: DiskMetadata = match serde_json::from_slice(&raw_meta) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(key = %key, error = %err, "Corrupt cache metadata, discarding entry");
                self.remove_entry(key).await;
                return None;
            }
        };

        if Utc::now() > metadata.expires_at {
            debug!(key = %key, "Cache entry expired");
            self.remove_entry(key).await;
            return None;
        }

        match fs::read(self.payload_path(key)).await {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let freed = remove_quietly(&self.meta_path(key)).await;
                self.forget(freed);
                None
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Failed to read cache entry");
                None
            }
        }
    }

    async fn remove_entry(&mut self, key: &str) -> u64 {
        let freed = remove_quietly(&self.payload_path(key)).await
            + remove_quietly(&self.meta_path(key)).await;
        self.forget(freed);
        freed
    }

    async fn list_entries(&self) -> DirectoryListing {
        let mut reader = match fs::read_dir(&self.directory).await {
            Ok(reader) => reader,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    warn!(error = %err, "Failed to list cache directory");
                }
                return DirectoryListing::default();
            }
        };

        let mut entries: HashMap<String, DiskEntryFiles> = HashMap::new();
        let mut temp_files = Vec::new();
        loop {
            let dir_entry = match reader.next_entry().await {
                Ok(Some(dir_entry)) => dir_entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "Failed to read cache directory entry");
                    break;
                }
            };
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                temp_files.push(dir_entry.path());
                continue;
            }
            if name.starts_with('.') {
                continue;
            }
            let metadata = match dir_entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };

            let (key, is_meta) = match name.strip_suffix(META_SUFFIX) {
                Some(stem) => (stem.to_string(), true),
                None => (name, false),
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

            let entry = entries
                .entry(key)
                .or_insert_with_key(|key| DiskEntryFiles::new(key.clone(), modified));
            entry.bytes += metadata.len();
            if is_meta {
                entry.has_meta = true;
            } else {
                entry.has_payload = true;
                entry.modified = modified;
            }
        }
        DirectoryListing {
            entries: entries.into_values().collect(),
            temp_files,
        }
    }

    async fn total_size(&self) -> u64 {
        self.list_entries()
            .await
            .entries
            .iter()
            .map(|entry| entry.bytes)
            .sum()
    }

    async fn enforce_budget(&mut self) {
        let size = match self.tracked_bytes {
            Some(size) => size,
            None => {
                let size = self.total_size().await;
                self.tracked_bytes = Some(size);
                size
            }
        };
        if size > self.budget_bytes {
            let target = (self.budget_bytes as f64 * self.cleanup_ratio) as u64;
            let report = self.shrink_to(target).await;
            info!(
                directory = %self.directory.display(),
                removed = report.removed_entries,
                freed_bytes = report.freed_bytes,
                "Disk cache over budget, cleaned up"
            );
        }
    }

    async fn shrink_to(&mut self, target_bytes: u64) -> CleanupReport {
        let mut entries = self.list_entries().await.entries;
        // Orphans first, then oldest payloads
        entries.sort_by_key(|entry| (entry.has_payload && entry.has_meta, entry.modified));

        let mut remaining: u64 = entries.iter().map(|entry| entry.bytes).sum();
        let mut report = CleanupReport::default();
        for entry in entries {
            if remaining <= target_bytes {
                break;
            }
            self.remove_entry(&entry.key).await;
            remaining -= entry.bytes;
            report.removed_entries += 1;
            report.freed_bytes += entry.bytes;
        }
        report.remaining_bytes = remaining;
        self.tracked_bytes = Some(remaining);
        report
    }

    async fn sweep_expired(&mut self) -> usize {
        let now = Utc::now();
        let listing = self.list_entries().await;
        for temp_path in &listing.temp_files {
            remove_quietly(temp_path).await;
        }

        let mut removed = 0;
        for entry in listing.entries {
            let expired = if !(entry.has_payload && entry.has_meta) {
                true
            } else {
                match fs::read(self.meta_path(&entry.key)).await {
                    Ok(raw) => match serde_json::from_slice::<DiskMetadata>(&raw) {
                        Ok(metadata) => now > metadata.expires_at,
                        Err(_) => true,
                    },
                    Err(_) => true,
                }
            };
            if expired {
                self.remove_entry(&entry.key).await;
                removed += 1;
            }
        }
        if removed > 0 || !listing.temp_files.is_empty() {
            debug!(
                removed,
                temp_files = listing.temp_files.len(),
                "Removed expired disk entries"
            );
        }
        removed
    }
}

async fn file_len(path: &Path) -> u64 {
    fs::metadata(path)
        .await
        .map(|metadata| metadata.len())
        .unwrap_or(0)
}

/// Delete `path`, returning the bytes freed
async fn remove_quietly(path: &Path) -> u64 {
    let bytes = file_len(path).await;
    match fs::remove_file(path).await {
        Ok(()) => bytes,
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "Failed to remove cache file");
            }
            0
        }
    }
}
