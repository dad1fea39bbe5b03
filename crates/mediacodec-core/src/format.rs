//! Key/value format descriptions used for configuration, parameters, and
//! output format notifications.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known format keys.
pub mod keys {
    pub const MIME: &str = "mime";
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const PIXEL_FORMAT: &str = "pixel_format";
    pub const FRAME_RATE: &str = "frame_rate";
    pub const BITRATE: &str = "bitrate";
    pub const VIDEO_ENCODE_BITRATE_MODE: &str = "video_encode_bitrate_mode";
    pub const CODEC_PROFILE: &str = "codec_profile";
    pub const I_FRAME_INTERVAL: &str = "i_frame_interval";
    pub const CHANNEL_COUNT: &str = "channel_count";
    pub const SAMPLE_RATE: &str = "sample_rate";
    pub const AUDIO_RAW_FORMAT: &str = "audio_raw_format";
    pub const MAX_INPUT_SIZE: &str = "max_input_size";
    pub const CROP_LEFT: &str = "crop_left";
    pub const CROP_TOP: &str = "crop_top";
    pub const CROP_RIGHT: &str = "crop_right";
    pub const CROP_BOTTOM: &str = "crop_bottom";
}

/// A single format value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FormatValue {
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl FormatValue {
    /// Wire tag for the variant.
    pub fn tag(&self) -> u8 {
        match self {
            FormatValue::Int32(_) => 1,
            FormatValue::Int64(_) => 2,
            FormatValue::Float(_) => 3,
            FormatValue::Double(_) => 4,
            FormatValue::String(_) => 5,
            FormatValue::Bytes(_) => 6,
        }
    }
}

impl fmt::Display for FormatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatValue::Int32(v) => write!(f, "{}", v),
            FormatValue::Int64(v) => write!(f, "{}", v),
            FormatValue::Float(v) => write!(f, "{}", v),
            FormatValue::Double(v) => write!(f, "{}", v),
            FormatValue::String(v) => write!(f, "{:?}", v),
            FormatValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// Ordered, flat mapping from case-sensitive key to value. Last write wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Format {
    entries: BTreeMap<String, FormatValue>,
}

impl Format {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: FormatValue) -> &mut Self {
        self.entries.insert(key.into(), value);
        self
    }

    pub fn set_i32(&mut self, key: impl Into<String>, value: i32) -> &mut Self {
        self.set(key, FormatValue::Int32(value))
    }

    pub fn set_i64(&mut self, key: impl Into<String>, value: i64) -> &mut Self {
        self.set(key, FormatValue::Int64(value))
    }

    pub fn set_f64(&mut self, key: impl Into<String>, value: f64) -> &mut Self {
        self.set(key, FormatValue::Double(value))
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.set(key, FormatValue::String(value.into()))
    }

    pub fn set_bytes(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.set(key, FormatValue::Bytes(value))
    }

    pub fn get(&self, key: &str) -> Option<&FormatValue> {
        self.entries.get(key)
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.entries.get(key)? {
            FormatValue::Int32(v) => Some(*v),
            FormatValue::Int64(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.entries.get(key)? {
            FormatValue::Int32(v) => Some(i64::from(*v)),
            FormatValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.entries.get(key)? {
            FormatValue::Float(v) => Some(f64::from(*v)),
            FormatValue::Double(v) => Some(*v),
            FormatValue::Int32(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key)? {
            FormatValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<FormatValue> {
        self.entries.remove(key)
    }

    /// Copy every entry of `other` over this format.
    pub fn merge(&mut self, other: &Format) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FormatValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        write!(f, "}}")
    }
}
