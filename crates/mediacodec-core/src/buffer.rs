//! Shared memory buffers nameable across process boundaries.
//!
//! The allocating side owns the backing file and unlinks it when its last
//! `SharedBuffer` clone drops. The importing side opens the file by name
//! and keeps its own descriptor, so an import stays valid for as long as
//! the importer holds it.

use crate::error::{CodecError, Result};
use crate::platform;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempPath;
use tracing::debug;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// Transferable description of a shared region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMemoryHandle {
    /// Allocation identity; changes whenever a slot is reallocated.
    pub id: u64,
    /// Backing file path.
    pub name: String,
    pub capacity: u32,
}

struct Region {
    id: u64,
    file: File,
    path: PathBuf,
    capacity: usize,
    // Present only on the allocating side
    owned: Option<TempPath>,
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.owned.is_some() {
            debug!("Unlinking shared region {} at {}", self.id, self.path.display());
        }
    }
}

/// A reference-counted shared memory region.
#[derive(Clone)]
pub struct SharedBuffer {
    region: Arc<Region>,
}

impl SharedBuffer {
    /// Allocate a zero-filled region of `capacity` bytes in `dir`.
    pub fn allocate(dir: &Path, capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(CodecError::invalid_value(format!(
                "invalid shared buffer capacity {}",
                capacity
            )));
        }
        let named = tempfile::Builder::new()
            .prefix("mediacodec-")
            .tempfile_in(dir)
            .map_err(|e| CodecError::no_memory(format!("shared buffer allocation: {}", e)))?;
        let (file, temp_path) = named.into_parts();
        file.set_len(capacity as u64)
            .map_err(|e| CodecError::no_memory(format!("shared buffer resize: {}", e)))?;

        let id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
        let path = temp_path.to_path_buf();
        Ok(Self {
            region: Arc::new(Region {
                id,
                file,
                path,
                capacity,
                owned: Some(temp_path),
            }),
        })
    }

    /// Map a region allocated elsewhere.
    pub fn open(handle: &SharedMemoryHandle) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&handle.name)
            .map_err(|e| CodecError::no_memory(format!("open {}: {}", handle.name, e)))?;
        let actual = file.metadata()?.len();
        if actual < u64::from(handle.capacity) {
            return Err(CodecError::protocol(format!(
                "shared region {} is {} bytes, handle claims {}",
                handle.name, actual, handle.capacity
            )));
        }
        Ok(Self {
            region: Arc::new(Region {
                id: handle.id,
                file,
                path: PathBuf::from(&handle.name),
                capacity: handle.capacity as usize,
                owned: None,
            }),
        })
    }

    pub fn handle(&self) -> SharedMemoryHandle {
        SharedMemoryHandle {
            id: self.region.id,
            name: self.region.path.to_string_lossy().into_owned(),
            capacity: self.region.capacity as u32,
        }
    }

    pub fn id(&self) -> u64 {
        self.region.id
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        platform::write_all_at(&self.region.file, data, offset as u64)?;
        Ok(())
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut buf = vec![0u8; len];
        platform::read_exact_at(&self.region.file, &mut buf, offset as u64)?;
        Ok(buf)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.region.capacity => Ok(()),
            _ => Err(CodecError::invalid_value(format!(
                "range {}+{} outside shared buffer of {} bytes",
                offset, len, self.region.capacity
            ))),
        }
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("id", &self.region.id)
            .field("capacity", &self.region.capacity)
            .field("owned", &self.region.owned.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = SharedBuffer::allocate(dir.path(), 64).unwrap();
        buffer.write_at(8, b"payload").unwrap();
        assert_eq!(buffer.read_at(8, 7).unwrap(), b"payload");
        assert_eq!(buffer.capacity(), 64);
    }

    #[test]
    fn test_import_sees_owner_writes() {
        let dir = tempfile::tempdir().unwrap();
        let owner = SharedBuffer::allocate(dir.path(), 32).unwrap();
        let imported = SharedBuffer::open(&owner.handle()).unwrap();

        imported.write_at(0, b"from client").unwrap();
        assert_eq!(owner.read_at(0, 11).unwrap(), b"from client");
        assert_eq!(imported.id(), owner.id());
    }

    #[test]
    fn test_out_of_range_access_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = SharedBuffer::allocate(dir.path(), 16).unwrap();
        assert!(buffer.write_at(10, &[0u8; 7]).is_err());
        assert!(buffer.read_at(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_allocations_have_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let a = SharedBuffer::allocate(dir.path(), 16).unwrap();
        let b = SharedBuffer::allocate(dir.path(), 16).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_owner_drop_unlinks_file() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = SharedBuffer::allocate(dir.path(), 16).unwrap();
        let path = PathBuf::from(buffer.handle().name);
        assert!(path.exists());
        drop(buffer);
        assert!(!path.exists());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SharedBuffer::allocate(dir.path(), 0).is_err());
    }
}
