//! Centralized configuration for the codec service.
//!
//! Protocol limits are constants; engine tuning is a serde struct that the
//! host process may load from disk.

use crate::platform;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Transport-level limits and identity tokens.
pub struct IpcConfig;

impl IpcConfig {
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_CONNECTIONS: usize = 64;

    /// Token leading every request parcel.
    pub const SERVICE_DESCRIPTOR: &'static str = "mediacodec.CodecService";
    /// Token leading every listener event parcel.
    pub const LISTENER_DESCRIPTOR: &'static str = "mediacodec.CodecListener";
}

/// Format processing limits.
pub struct FormatConfig;

impl FormatConfig {
    pub const MAX_VIDEO_WIDTH: i32 = 8000;
    pub const MAX_VIDEO_HEIGHT: i32 = 5000;
    pub const MAX_CHANNEL_COUNT: i32 = 8;
}

/// Tunable pipeline engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound for a blocking graph state change.
    pub state_change_timeout_ms: u64,
    /// Number of input buffers the byte-buffer source allocates.
    pub input_buffer_count: u32,
    /// Minimum size of each input buffer in bytes.
    pub input_buffer_size: usize,
    /// Cap on the byte-buffer sink's output arena.
    pub max_output_buffers: u32,
    /// Capacity of the engine-to-dispatcher event queue.
    pub event_queue_capacity: usize,
    /// Directory for shared memory backing files.
    pub shm_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_change_timeout_ms: 3000,
            input_buffer_count: 5,
            input_buffer_size: 30000,
            max_output_buffers: 16,
            event_queue_capacity: 256,
            shm_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn state_change_timeout(&self) -> Duration {
        Duration::from_millis(self.state_change_timeout_ms)
    }

    /// Resolve the shared memory directory.
    pub fn shm_dir(&self) -> PathBuf {
        self.shm_dir
            .clone()
            .unwrap_or_else(platform::default_shm_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.input_buffer_count, 5);
        assert_eq!(config.input_buffer_size, 30000);
        assert_eq!(config.state_change_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_engine_config_partial_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"input_buffer_count": 8}"#).unwrap();
        assert_eq!(config.input_buffer_count, 8);
        assert_eq!(config.max_output_buffers, 16);
    }

    #[test]
    fn test_explicit_shm_dir_wins() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            shm_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(config.shm_dir(), dir.path());
    }
}
