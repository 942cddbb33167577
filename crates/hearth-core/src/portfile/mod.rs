//! Port file discovery for the build daemon.
//!
//! A port file is a 16-byte record advertising the loopback port and cookie of
//! the running build server. Clients poll it to find a server; servers write it
//! after binding and re-read it to notice they have been replaced.
//!
//! # Locking
//!
//! Access to the record is guarded by a two-level lock:
//!
//! - **In-process**: a one-permit `Semaphore`, so two tasks in the same process
//!   never race each other for the OS lock.
//! - **Cross-process**: an exclusive advisory lock (`fs2`) on the file itself,
//!   taken on a blocking thread.
//!
//! The permit is taken if and only if this process holds the OS lock. Both are
//! released together when the [`PortFileLock`] guard is released or dropped.
//!
//! # Stop marker
//!
//! A sibling `<path>.stop` file asks the server to shut down. It is consumed by
//! the first caller of [`PortFile::take_stop_request`] that observes it.

mod lock;
mod record;

pub use lock::PortFileLock;
pub use record::{random_cookie, PortRecord};

use crate::config::{PortFileConfig, PortFileTimings};
use crate::{HearthError, Result};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

/// Values observed by, and written by, this process.
#[derive(Debug, Default)]
struct RecordState {
    last_read: Option<PortRecord>,
    mine: Option<PortRecord>,
}

/// Handle to a port file shared by a build server and its clients.
#[derive(Debug)]
pub struct PortFile {
    path: PathBuf,
    stop_path: PathBuf,
    timings: PortFileTimings,
    permits: Semaphore,
    /// Mirrors OS lock ownership; only changes while the permit is taken.
    lock_held: AtomicBool,
    wakeup: Notify,
    state: Mutex<RecordState>,
}

impl PortFile {
    /// Create a handle for the port file at `path` with default timings.
    ///
    /// Nothing is touched on disk until the first [`PortFile::lock`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_timings(path, PortFileTimings::default())
    }

    pub fn with_timings(path: impl Into<PathBuf>, timings: PortFileTimings) -> Self {
        let path = path.into();
        let stop_path = stop_path_for(&path);
        Self {
            path,
            stop_path,
            timings,
            permits: Semaphore::new(1),
            lock_held: AtomicBool::new(false),
            wakeup: Notify::new(),
            state: Mutex::new(RecordState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stop_path(&self) -> &Path {
        &self.stop_path
    }

    pub fn timings(&self) -> &PortFileTimings {
        &self.timings
    }

    /// Acquire exclusive access to the record.
    ///
    /// Waits for the in-process permit, then for the OS advisory lock. The
    /// backing file (and its parent directory) is created if missing.
    ///
    /// # Errors
    ///
    /// - [`HearthError::Interrupted`] if [`PortFile::interrupt`] fires while
    ///   waiting for the permit
    /// - [`HearthError::Closed`] after [`PortFile::close`] or [`PortFile::delete`]
    /// - [`HearthError::Lock`] if the file cannot be opened or locked
    pub async fn lock(&self) -> Result<PortFileLock<'_>> {
        let permit = tokio::select! {
            acquired = self.permits.acquire() => acquired.map_err(|_| HearthError::Closed)?,
            _ = self.wakeup.notified() => {
                debug!(path = %self.path.display(), "Port file lock wait interrupted");
                return Err(HearthError::Interrupted);
            }
        };
        debug_assert!(
            !self.lock_held.load(Ordering::SeqCst),
            "in-process permit granted while the OS lock is still held"
        );

        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || open_and_lock(&path))
            .await
            .map_err(|e| HearthError::Other(format!("Port file lock task failed: {}", e)))?
            .map_err(|source| HearthError::Lock {
                path: self.path.clone(),
                source,
            })?;

        self.lock_held.store(true, Ordering::SeqCst);
        debug!(path = %self.path.display(), "Acquired port file lock");

        Ok(PortFileLock::new(self, file, permit))
    }

    /// Wake every task currently waiting in [`PortFile::lock`].
    ///
    /// Waiters get [`HearthError::Interrupted`]; [`PortFile::record_still_mine`]
    /// swallows it and waits again.
    pub fn interrupt(&self) {
        self.wakeup.notify_waiters();
    }

    /// Refuse all further lock attempts with [`HearthError::Closed`].
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Lock-free check that the backing file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Consume a pending stop request.
    ///
    /// Returns `true` at most once per stop marker. Failing to delete the
    /// marker for any reason other than it already being gone is ignored.
    pub fn take_stop_request(&self) -> bool {
        if !self.stop_path.exists() {
            return false;
        }
        match std::fs::remove_file(&self.stop_path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                debug!(
                    path = %self.stop_path.display(),
                    error = %e,
                    "Could not remove stop marker"
                );
                true
            }
        }
    }

    /// Create the stop marker for the port file at `port_file`.
    ///
    /// Returns the marker path.
    pub fn request_stop(port_file: impl AsRef<Path>) -> Result<PathBuf> {
        let stop_path = stop_path_for(port_file.as_ref());
        File::create(&stop_path).map_err(|e| HearthError::io_with_path(e, &stop_path))?;
        info!(path = %stop_path.display(), "Requested build server stop");
        Ok(stop_path)
    }

    /// Lock, read the record, and release.
    pub async fn read_current(&self) -> Result<Option<PortRecord>> {
        let mut lock = self.lock().await?;
        let record = lock.read_record();
        lock.release();
        Ok(record)
    }

    /// Poll until a valid record appears or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`HearthError::Timeout`] carrying the elapsed wait, or any hard lock error.
    pub async fn wait_for_valid_record(&self, timeout: Duration) -> Result<PortRecord> {
        let start = Instant::now();
        loop {
            if self.exists() {
                match self.read_current().await {
                    Ok(Some(record)) => {
                        debug!(
                            port = record.port,
                            elapsed = ?start.elapsed(),
                            "Found valid port file"
                        );
                        return Ok(record);
                    }
                    Ok(None) | Err(HearthError::Interrupted) => {}
                    Err(e) => return Err(e),
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(HearthError::Timeout { elapsed });
            }
            tokio::time::sleep(self.timings.poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// Check whether the record still holds the values this process wrote.
    ///
    /// Returns `false` if another server overwrote or removed the record, if
    /// nothing was ever written by this handle, or if the port file has been
    /// closed because the process is shutting down.
    pub async fn record_still_mine(&self) -> Result<bool> {
        let Some(mine) = self.mine() else {
            return Ok(false);
        };

        let Some(mut lock) = self.lock_for_check().await? else {
            debug!(path = %self.path.display(), "Port file closed during ownership check");
            return Ok(false);
        };
        let current = lock.read_record();
        lock.release();
        Ok(current == Some(mine))
    }

    /// Delete the backing file if it still holds the record this process wrote.
    ///
    /// The ownership check and the removal share one lock hold, so a server
    /// that takes the file over concurrently keeps its record. Where a locked
    /// file cannot be removed, falls back to [`PortFile::delete`] after
    /// releasing. The handle is closed on every path.
    ///
    /// Returns whether the file was ours.
    pub async fn delete_if_mine(&self) -> Result<bool> {
        let result = self.remove_if_mine().await;
        self.close();
        result
    }

    async fn remove_if_mine(&self) -> Result<bool> {
        let Some(mine) = self.mine() else {
            return Ok(false);
        };
        if !self.exists() {
            return Ok(false);
        }
        let Some(mut lock) = self.lock_for_check().await? else {
            return Ok(false);
        };

        if lock.read_record() != Some(mine) {
            return Ok(false);
        }
        let removed = lock.remove_file();
        lock.release();

        match removed {
            Ok(()) => {
                info!(path = %self.path.display(), "Deleted port file");
                tokio::time::sleep(self.timings.delete_grace).await;
                Ok(true)
            }
            Err(e) => {
                debug!(error = %e, "Port file busy, retrying delete without the lock");
                self.delete().await.map(|()| true)
            }
        }
    }

    /// Lock, retrying interrupted waits.
    ///
    /// `None` once the handle is closed.
    async fn lock_for_check(&self) -> Result<Option<PortFileLock<'_>>> {
        loop {
            match self.lock().await {
                Ok(lock) => return Ok(Some(lock)),
                Err(HearthError::Interrupted) => continue,
                Err(HearthError::Closed) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove the backing file.
    ///
    /// Closes the handle first, so later [`PortFile::lock`] calls fail with
    /// [`HearthError::Closed`]. Retries while the file is still visible, then
    /// waits briefly for late readers.
    pub async fn delete(&self) -> Result<()> {
        self.close();

        let attempts = self.timings.delete_attempts.max(1);
        for attempt in 1..=attempts {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!(
                    path = %self.path.display(),
                    attempt,
                    error = %e,
                    "Port file delete failed"
                ),
            }

            if !self.exists() {
                info!(path = %self.path.display(), "Deleted port file");
                tokio::time::sleep(self.timings.delete_grace).await;
                return Ok(());
            }

            if attempt < attempts {
                tokio::time::sleep(self.timings.delete_retry_interval).await;
            }
        }

        warn!(path = %self.path.display(), attempts, "Port file still present after delete");
        Err(HearthError::Delete {
            path: self.path.clone(),
            attempts,
        })
    }

    /// Record read by the most recent [`PortFileLock::read_record`].
    pub fn last_read(&self) -> Option<PortRecord> {
        self.state().last_read
    }

    /// Record written by the most recent [`PortFileLock::write_record`].
    pub fn mine(&self) -> Option<PortRecord> {
        self.state().mine
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn stop_path_for(path: &Path) -> PathBuf {
    let mut stop: OsString = path.as_os_str().to_owned();
    stop.push(PortFileConfig::STOP_SUFFIX);
    PathBuf::from(stop)
}

fn open_and_lock(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Don't truncate: another process may be mid-read of a valid record.
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    FileExt::lock_exclusive(&file)?;
    Ok(file)
}
