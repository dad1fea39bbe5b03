//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here rather than being
//! scattered through the codec modules.
//!
//! - `shm` - shared memory backing directory and positional file I/O

pub mod shm;

pub use shm::{default_shm_dir, read_exact_at, write_all_at};
