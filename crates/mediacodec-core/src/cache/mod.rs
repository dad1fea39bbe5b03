//! Buffer handle caches mirrored across the process boundary.
//!
//! The stub decides, per `get_*_buffer` reply, whether the proxy's cached
//! handle for an index is still valid (`Hit`), must be replaced (`Update`),
//! or is gone (`Invalidate`). Handles cross the boundary only on `Update`.
//!
//! ```text
//! reply: [i32 status][u8 flag][handle, only when flag == UPDATE]
//! ```

mod proxy;
mod stub;

pub use proxy::ProxyBufferCache;
pub use stub::StubBufferCache;

use crate::error::{CodecError, Result};

/// Per-reply cache synchronization flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFlag {
    Hit = 1,
    Update = 2,
    Invalidate = 3,
}

impl CacheFlag {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(CacheFlag::Hit),
            2 => Ok(CacheFlag::Update),
            3 => Ok(CacheFlag::Invalidate),
            other => Err(CodecError::protocol(format!("unknown cache flag {}", other))),
        }
    }
}

/// Which buffer set a cache mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SharedBuffer;
    use crate::ipc::parcel::{Parcel, ParcelReader};

    #[test]
    fn test_flag_wire_values() {
        assert_eq!(CacheFlag::Hit.as_u8(), 1);
        assert_eq!(CacheFlag::Update.as_u8(), 2);
        assert_eq!(CacheFlag::Invalidate.as_u8(), 3);
        assert!(CacheFlag::from_u8(0).is_err());
    }

    /// Drive both caches through one reply.
    fn exchange(
        stub: &mut StubBufferCache,
        proxy: &mut ProxyBufferCache,
        index: u32,
        buffer: Option<&SharedBuffer>,
    ) -> (CacheFlag, Result<SharedBuffer>) {
        let mut parcel = Parcel::new();
        let flag = stub.write_to_parcel(index, buffer, &mut parcel);
        let mut reader = ParcelReader::new(parcel.freeze());
        (flag, proxy.read_from_parcel(index, &mut reader))
    }

    #[test]
    fn test_first_use_updates_then_hits() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = SharedBuffer::allocate(dir.path(), 64).unwrap();
        let mut stub = StubBufferCache::new(Direction::Input);
        let mut proxy = ProxyBufferCache::new(Direction::Input);

        let (flag, got) = exchange(&mut stub, &mut proxy, 0, Some(&buffer));
        assert_eq!(flag, CacheFlag::Update);
        assert_eq!(got.unwrap().id(), buffer.id());

        let (flag, got) = exchange(&mut stub, &mut proxy, 0, Some(&buffer));
        assert_eq!(flag, CacheFlag::Hit);
        assert_eq!(got.unwrap().id(), buffer.id());
    }

    #[test]
    fn test_reallocation_sends_update() {
        let dir = tempfile::tempdir().unwrap();
        let first = SharedBuffer::allocate(dir.path(), 64).unwrap();
        let second = SharedBuffer::allocate(dir.path(), 128).unwrap();
        let mut stub = StubBufferCache::new(Direction::Output);
        let mut proxy = ProxyBufferCache::new(Direction::Output);

        exchange(&mut stub, &mut proxy, 2, Some(&first));
        let (flag, got) = exchange(&mut stub, &mut proxy, 2, Some(&second));
        assert_eq!(flag, CacheFlag::Update);
        assert_eq!(got.unwrap().capacity(), 128);
    }

    #[test]
    fn test_missing_buffer_invalidates_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = SharedBuffer::allocate(dir.path(), 64).unwrap();
        let mut stub = StubBufferCache::new(Direction::Output);
        let mut proxy = ProxyBufferCache::new(Direction::Output);

        exchange(&mut stub, &mut proxy, 1, Some(&buffer));
        let (flag, got) = exchange(&mut stub, &mut proxy, 1, None);
        assert_eq!(flag, CacheFlag::Invalidate);
        assert_eq!(
            got.unwrap_err().kind(),
            crate::error::ErrorKind::InvalidValue
        );
        assert!(proxy.is_empty());
        assert!(stub.is_empty());
    }

    #[test]
    fn test_cleared_stub_revalidates_with_update() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = SharedBuffer::allocate(dir.path(), 64).unwrap();
        let mut stub = StubBufferCache::new(Direction::Input);
        let mut proxy = ProxyBufferCache::new(Direction::Input);

        exchange(&mut stub, &mut proxy, 0, Some(&buffer));
        stub.clear();
        let (flag, _) = exchange(&mut stub, &mut proxy, 0, Some(&buffer));
        assert_eq!(flag, CacheFlag::Update);
    }

    #[test]
    fn test_hit_after_proxy_clear_is_cache_miss() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = SharedBuffer::allocate(dir.path(), 64).unwrap();
        let mut stub = StubBufferCache::new(Direction::Input);
        let mut proxy = ProxyBufferCache::new(Direction::Input);

        exchange(&mut stub, &mut proxy, 4, Some(&buffer));
        proxy.clear();
        let (flag, got) = exchange(&mut stub, &mut proxy, 4, Some(&buffer));
        assert_eq!(flag, CacheFlag::Hit);
        assert!(matches!(got, Err(CodecError::CacheMiss { index: 4 })));
    }
}
