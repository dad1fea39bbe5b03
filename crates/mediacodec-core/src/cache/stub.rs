//! Server-side half of the buffer cache.

use super::{CacheFlag, Direction};
use crate::buffer::SharedBuffer;
use crate::ipc::parcel::Parcel;
use crate::types::BufferIndex;
use std::collections::HashMap;
use tracing::debug;

/// Remembers which allocation the proxy last received for each index.
#[derive(Debug)]
pub struct StubBufferCache {
    direction: Direction,
    sent: HashMap<BufferIndex, u64>,
}

impl StubBufferCache {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            sent: HashMap::new(),
        }
    }

    /// Append the cache flag, and the handle when needed, for `buffer` at `index`.
    pub fn write_to_parcel(
        &mut self,
        index: BufferIndex,
        buffer: Option<&SharedBuffer>,
        parcel: &mut Parcel,
    ) -> CacheFlag {
        let flag = match buffer {
            None => {
                self.sent.remove(&index);
                CacheFlag::Invalidate
            }
            Some(buffer) if self.sent.get(&index) == Some(&buffer.id()) => CacheFlag::Hit,
            Some(buffer) => {
                self.sent.insert(index, buffer.id());
                CacheFlag::Update
            }
        };

        parcel.write_u8(flag.as_u8());
        if let (CacheFlag::Update, Some(buffer)) = (flag, buffer) {
            parcel.write_shm_handle(&buffer.handle());
        }
        debug!("{} buffer {}: {:?}", self.direction, index, flag);
        flag
    }

    pub fn clear(&mut self) {
        self.sent.clear();
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}
