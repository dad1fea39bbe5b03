//! Core value types shared by the client, transport, and server.

use crate::error::{CodecError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Index of a buffer slot within one direction of a session.
pub type BufferIndex = u32;

/// Index reported with the end-of-stream output notification. Never names a buffer.
pub const EOS_BUFFER_INDEX: BufferIndex = u32::MAX;

/// Codec role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    VideoEncoder,
    VideoDecoder,
    AudioEncoder,
    AudioDecoder,
}

impl CodecKind {
    pub fn is_encoder(self) -> bool {
        matches!(self, CodecKind::VideoEncoder | CodecKind::AudioEncoder)
    }

    pub fn is_video(self) -> bool {
        matches!(self, CodecKind::VideoEncoder | CodecKind::VideoDecoder)
    }

    pub fn to_wire(self) -> i32 {
        match self {
            CodecKind::VideoEncoder => 0,
            CodecKind::VideoDecoder => 1,
            CodecKind::AudioEncoder => 2,
            CodecKind::AudioDecoder => 3,
        }
    }

    pub fn from_wire(value: i32) -> Result<Self> {
        match value {
            0 => Ok(CodecKind::VideoEncoder),
            1 => Ok(CodecKind::VideoDecoder),
            2 => Ok(CodecKind::AudioEncoder),
            3 => Ok(CodecKind::AudioDecoder),
            other => Err(CodecError::invalid_value(format!(
                "unknown codec kind {}",
                other
            ))),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::VideoEncoder => write!(f, "video encoder"),
            CodecKind::VideoDecoder => write!(f, "video decoder"),
            CodecKind::AudioEncoder => write!(f, "audio encoder"),
            CodecKind::AudioDecoder => write!(f, "audio decoder"),
        }
    }
}

/// Valid payload within a shared buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferInfo {
    pub presentation_time_us: i64,
    pub size: i32,
    pub offset: i32,
}

impl BufferInfo {
    pub fn new(presentation_time_us: i64, size: i32, offset: i32) -> Self {
        Self {
            presentation_time_us,
            size,
            offset,
        }
    }

    /// Check the payload range against a buffer capacity.
    pub fn validate(&self, capacity: usize) -> Result<()> {
        if self.size < 0 || self.offset < 0 {
            return Err(CodecError::invalid_value(format!(
                "negative buffer range (offset {}, size {})",
                self.offset, self.size
            )));
        }
        let end = self.offset as usize + self.size as usize;
        if end > capacity {
            return Err(CodecError::invalid_value(format!(
                "buffer range {}..{} exceeds capacity {}",
                self.offset, end, capacity
            )));
        }
        Ok(())
    }
}

/// Bitset of per-buffer flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferFlag(u32);

impl BufferFlag {
    pub const NONE: BufferFlag = BufferFlag(0);
    pub const EOS: BufferFlag = BufferFlag(1 << 0);
    pub const SYNC_FRAME: BufferFlag = BufferFlag(1 << 1);
    pub const PARTIAL_FRAME: BufferFlag = BufferFlag(1 << 2);
    pub const CODEC_DATA: BufferFlag = BufferFlag(1 << 3);

    const ALL: u32 = 0b1111;

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, rejecting unknown flags.
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::ALL != 0 {
            return Err(CodecError::invalid_value(format!(
                "unknown buffer flag bits {:#x}",
                bits
            )));
        }
        Ok(BufferFlag(bits))
    }

    pub fn contains(self, other: BufferFlag) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn without(self, other: BufferFlag) -> BufferFlag {
        BufferFlag(self.0 & !other.0)
    }
}

impl BitOr for BufferFlag {
    type Output = BufferFlag;

    fn bitor(self, rhs: BufferFlag) -> BufferFlag {
        BufferFlag(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlag {
    fn bitor_assign(&mut self, rhs: BufferFlag) {
        self.0 |= rhs.0;
    }
}

/// Codec lifecycle state, owned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecState {
    Uninitialized,
    Initialized,
    Configured,
    Prepared,
    Running,
    Flushed,
    EndOfStream,
    Error,
}

impl fmt::Display for CodecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecState::Uninitialized => write!(f, "Uninitialized"),
            CodecState::Initialized => write!(f, "Initialized"),
            CodecState::Configured => write!(f, "Configured"),
            CodecState::Prepared => write!(f, "Prepared"),
            CodecState::Running => write!(f, "Running"),
            CodecState::Flushed => write!(f, "Flushed"),
            CodecState::EndOfStream => write!(f, "EndOfStream"),
            CodecState::Error => write!(f, "Error"),
        }
    }
}

/// Opaque reference to a display or capture surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceHandle(pub u64);

impl fmt::Display for SurfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}
