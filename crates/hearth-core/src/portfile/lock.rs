//! Exclusive access guard for the port record.

use super::{PortFile, PortRecord};
use crate::config::PortFileConfig;
use crate::{HearthError, Result};
use fs2::FileExt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::Ordering;
use tokio::sync::SemaphorePermit;
use tracing::{debug, warn};

/// Held while this process owns both the in-process permit and the OS lock.
///
/// Record reads and writes are only reachable through the guard. Releasing
/// (explicitly or by drop) unlocks the file before returning the permit.
#[derive(Debug)]
pub struct PortFileLock<'a> {
    port_file: &'a PortFile,
    file: File,
    permit: Option<SemaphorePermit<'a>>,
}

impl<'a> PortFileLock<'a> {
    pub(super) fn new(port_file: &'a PortFile, file: File, permit: SemaphorePermit<'a>) -> Self {
        let lock = Self {
            port_file,
            file,
            permit: Some(permit),
        };
        lock.debug_assert_held();
        lock
    }

    /// Read the 16-byte record.
    ///
    /// Short files, I/O errors and a wrong magic number all yield `None`.
    pub fn read_record(&mut self) -> Option<PortRecord> {
        self.debug_assert_held();

        let record = match self.read_raw() {
            Ok(bytes) => PortRecord::decode(&bytes),
            Err(e) => {
                debug!(
                    path = %self.port_file.path.display(),
                    error = %e,
                    "Failed to read port file, treating as empty"
                );
                None
            }
        };

        self.port_file.state().last_read = record;
        record
    }

    /// Overwrite the record from offset zero and remember it as ours.
    pub fn write_record(&mut self, record: PortRecord) -> Result<()> {
        self.debug_assert_held();
        let path = &self.port_file.path;

        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| HearthError::io_with_path(e, path))?;
        self.file
            .write_all(&record.encode())
            .map_err(|e| HearthError::io_with_path(e, path))?;
        self.file
            .set_len(PortFileConfig::RECORD_LEN as u64)
            .map_err(|e| HearthError::io_with_path(e, path))?;
        self.file
            .sync_data()
            .map_err(|e| HearthError::io_with_path(e, path))?;

        self.port_file.state().mine = Some(record);
        debug!(
            path = %path.display(),
            port = record.port,
            "Wrote port file"
        );
        Ok(())
    }

    /// Unlink the backing file while the lock is still held.
    ///
    /// A file that is already gone counts as removed. Fails on platforms
    /// that refuse to delete a file with an open handle.
    pub fn remove_file(&mut self) -> Result<()> {
        self.debug_assert_held();
        let path = &self.port_file.path;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HearthError::io_with_path(e, path)),
        }
    }

    /// Release the OS lock and the in-process permit.
    pub fn release(self) {
        // Drop does the work.
    }

    fn read_raw(&mut self) -> std::io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(PortFileConfig::RECORD_LEN);
        (&mut self.file)
            .take(PortFileConfig::RECORD_LEN as u64)
            .read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn debug_assert_held(&self) {
        debug_assert_eq!(self.port_file.permits.available_permits(), 0);
        debug_assert!(self.port_file.lock_held.load(Ordering::SeqCst));
    }
}

impl Drop for PortFileLock<'_> {
    fn drop(&mut self) {
        self.debug_assert_held();

        // OS lock goes before the permit.
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(
                path = %self.port_file.path.display(),
                error = %e,
                "Failed to unlock port file"
            );
        }
        self.port_file.lock_held.store(false, Ordering::SeqCst);
        drop(self.permit.take());
        debug!(path = %self.port_file.path.display(), "Released port file lock");
    }
}
