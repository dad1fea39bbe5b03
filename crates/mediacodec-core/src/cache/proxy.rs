//! Client-side half of the buffer cache.

use super::{CacheFlag, Direction};
use crate::buffer::SharedBuffer;
use crate::error::{CodecError, Result};
use crate::ipc::parcel::ParcelReader;
use crate::types::BufferIndex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Imported buffers keyed by index.
#[derive(Debug)]
pub struct ProxyBufferCache {
    direction: Direction,
    entries: HashMap<BufferIndex, SharedBuffer>,
}

impl ProxyBufferCache {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            entries: HashMap::new(),
        }
    }

    /// Apply the cache flag from a reply and resolve the buffer for `index`.
    ///
    /// A `Hit` for an index that never received an `Update` is a protocol
    /// violation and is reported as `CacheMiss`.
    pub fn read_from_parcel(
        &mut self,
        index: BufferIndex,
        reader: &mut ParcelReader,
    ) -> Result<SharedBuffer> {
        let flag = CacheFlag::from_u8(reader.read_u8()?)?;
        debug!("{} buffer {}: {:?}", self.direction, index, flag);

        match flag {
            CacheFlag::Hit => self.entries.get(&index).cloned().ok_or_else(|| {
                warn!("{} cache hit for unknown index {}", self.direction, index);
                CodecError::CacheMiss { index }
            }),
            CacheFlag::Update => {
                let handle = reader.read_shm_handle()?;
                let buffer = SharedBuffer::open(&handle)?;
                self.entries.insert(index, buffer.clone());
                Ok(buffer)
            }
            CacheFlag::Invalidate => {
                self.entries.remove(&index);
                Err(CodecError::invalid_value(format!(
                    "{} buffer {} is not available",
                    self.direction, index
                )))
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
