//! Format validation and port negotiation per codec role.
//!
//! Turns a caller's configuration `Format` into the capabilities of the
//! codec node's input and output ports.

use super::registry::CodecDescriptor;
use crate::config::FormatConfig;
use crate::error::{CodecError, Result};
use crate::format::{keys, Format, FormatValue};
use crate::types::CodecKind;

pub const RAW_AUDIO_MIME: &str = "audio/raw";
pub const RAW_VIDEO_MIME: &str = "video/raw";

/// Negotiated configuration of one side of the codec node.
#[derive(Debug, Clone, PartialEq)]
pub struct PortConfig {
    pub caps: Format,
    /// Minimum buffer size in bytes, 0 when the role has no opinion.
    pub buffer_size: usize,
    pub needs_codec_data: bool,
    pub needs_parser: bool,
}

impl PortConfig {
    fn new(caps: Format, buffer_size: usize) -> Self {
        Self {
            caps,
            buffer_size,
            needs_codec_data: false,
            needs_parser: false,
        }
    }
}

/// Input and output port configuration for a codec.
#[derive(Debug, Clone, PartialEq)]
pub struct PortPair {
    pub input: PortConfig,
    pub output: PortConfig,
}

/// Raw pixel layouts understood by the video processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuvi420,
    Nv12,
    Nv21,
    Rgba,
}

impl PixelFormat {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(PixelFormat::Yuvi420),
            2 => Some(PixelFormat::Nv12),
            3 => Some(PixelFormat::Nv21),
            5 => Some(PixelFormat::Rgba),
            _ => None,
        }
    }

    /// Bytes needed for one frame.
    pub fn frame_size(self, width: i32, height: i32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Yuvi420 | PixelFormat::Nv12 | PixelFormat::Nv21 => pixels * 3 / 2,
            PixelFormat::Rgba => pixels * 4,
        }
    }
}

/// Validates configuration for one codec role.
#[derive(Debug, Clone)]
pub struct FormatProcessor {
    kind: CodecKind,
    mime: String,
    needs_codec_data: bool,
    needs_parser: bool,
}

impl FormatProcessor {
    pub fn new(descriptor: &CodecDescriptor) -> Self {
        Self {
            kind: descriptor.kind,
            mime: descriptor.mime.clone(),
            needs_codec_data: descriptor.needs_codec_data,
            needs_parser: descriptor.needs_parser,
        }
    }

    pub fn process(&self, format: &Format) -> Result<PortPair> {
        let mut ports = match self.kind {
            CodecKind::AudioDecoder => self.audio_decoder(format)?,
            CodecKind::AudioEncoder => self.audio_encoder(format)?,
            CodecKind::VideoDecoder => self.video_decoder(format)?,
            CodecKind::VideoEncoder => self.video_encoder(format)?,
        };
        ports.input.needs_codec_data = self.needs_codec_data;
        ports.input.needs_parser = self.needs_parser;
        if let Some(max_input) = format.get_i32(keys::MAX_INPUT_SIZE) {
            if max_input <= 0 {
                return Err(CodecError::invalid_value("max_input_size must be positive"));
            }
            ports.input.buffer_size = ports.input.buffer_size.max(max_input as usize);
        }
        Ok(ports)
    }

    fn audio_decoder(&self, format: &Format) -> Result<PortPair> {
        let audio = AudioParams::parse(format)?;

        let mut input = Format::new();
        input.set_string(keys::MIME, &self.mime);
        audio.write_to(&mut input);
        copy_optional(format, &mut input, &[keys::BITRATE]);

        let mut output = Format::new();
        output.set_string(keys::MIME, RAW_AUDIO_MIME);
        audio.write_to(&mut output);
        output.set_i32(keys::AUDIO_RAW_FORMAT, audio.raw_format);

        Ok(PortPair {
            input: PortConfig::new(input, 0),
            output: PortConfig::new(output, 0),
        })
    }

    fn audio_encoder(&self, format: &Format) -> Result<PortPair> {
        let audio = AudioParams::parse(format)?;

        let mut input = Format::new();
        input.set_string(keys::MIME, RAW_AUDIO_MIME);
        audio.write_to(&mut input);
        input.set_i32(keys::AUDIO_RAW_FORMAT, audio.raw_format);

        let mut output = Format::new();
        output.set_string(keys::MIME, &self.mime);
        audio.write_to(&mut output);
        copy_optional(format, &mut output, &[keys::BITRATE]);

        Ok(PortPair {
            input: PortConfig::new(input, 0),
            output: PortConfig::new(output, 0),
        })
    }

    fn video_decoder(&self, format: &Format) -> Result<PortPair> {
        let video = VideoParams::parse(format)?;

        let mut input = Format::new();
        input.set_string(keys::MIME, &self.mime);
        input.set_i32(keys::WIDTH, video.width);
        input.set_i32(keys::HEIGHT, video.height);
        copy_optional(format, &mut input, &[keys::FRAME_RATE]);

        let mut output = Format::new();
        output.set_string(keys::MIME, RAW_VIDEO_MIME);
        video.write_to(&mut output);

        Ok(PortPair {
            input: PortConfig::new(input, video.frame_size() / 2),
            output: PortConfig::new(output, video.frame_size()),
        })
    }

    fn video_encoder(&self, format: &Format) -> Result<PortPair> {
        let video = VideoParams::parse(format)?;
        let frame_rate = format
            .get_f64(keys::FRAME_RATE)
            .ok_or_else(|| missing(keys::FRAME_RATE))?;
        if frame_rate <= 0.0 {
            return Err(CodecError::invalid_value(format!(
                "frame_rate must be positive, got {}",
                frame_rate
            )));
        }

        let mut input = Format::new();
        input.set_string(keys::MIME, RAW_VIDEO_MIME);
        video.write_to(&mut input);
        input.set_f64(keys::FRAME_RATE, frame_rate);

        let mut output = Format::new();
        output.set_string(keys::MIME, &self.mime);
        output.set_i32(keys::WIDTH, video.width);
        output.set_i32(keys::HEIGHT, video.height);
        output.set_f64(keys::FRAME_RATE, frame_rate);
        copy_optional(
            format,
            &mut output,
            &[
                keys::VIDEO_ENCODE_BITRATE_MODE,
                keys::CODEC_PROFILE,
                keys::I_FRAME_INTERVAL,
                keys::BITRATE,
            ],
        );

        Ok(PortPair {
            input: PortConfig::new(input, video.frame_size()),
            output: PortConfig::new(output, video.frame_size() / 2),
        })
    }
}

struct AudioParams {
    channel_count: i32,
    sample_rate: i32,
    raw_format: i32,
}

impl AudioParams {
    fn parse(format: &Format) -> Result<Self> {
        let channel_count = require_i32(format, keys::CHANNEL_COUNT)?;
        let sample_rate = require_i32(format, keys::SAMPLE_RATE)?;
        let raw_format = require_i32(format, keys::AUDIO_RAW_FORMAT)?;

        if !(1..=FormatConfig::MAX_CHANNEL_COUNT).contains(&channel_count) {
            return Err(CodecError::invalid_value(format!(
                "channel_count {} outside 1..={}",
                channel_count,
                FormatConfig::MAX_CHANNEL_COUNT
            )));
        }
        if sample_rate <= 0 {
            return Err(CodecError::invalid_value(format!(
                "sample_rate must be positive, got {}",
                sample_rate
            )));
        }
        Ok(Self {
            channel_count,
            sample_rate,
            raw_format,
        })
    }

    fn write_to(&self, caps: &mut Format) {
        caps.set_i32(keys::CHANNEL_COUNT, self.channel_count);
        caps.set_i32(keys::SAMPLE_RATE, self.sample_rate);
    }
}

struct VideoParams {
    width: i32,
    height: i32,
    pixel_format: i32,
    layout: PixelFormat,
}

impl VideoParams {
    fn parse(format: &Format) -> Result<Self> {
        let width = require_i32(format, keys::WIDTH)?;
        let height = require_i32(format, keys::HEIGHT)?;
        let pixel_format = require_i32(format, keys::PIXEL_FORMAT)?;

        if width <= 0 || width >= FormatConfig::MAX_VIDEO_WIDTH {
            return Err(CodecError::invalid_value(format!(
                "width {} outside 1..{}",
                width,
                FormatConfig::MAX_VIDEO_WIDTH
            )));
        }
        if height <= 0 || height >= FormatConfig::MAX_VIDEO_HEIGHT {
            return Err(CodecError::invalid_value(format!(
                "height {} outside 1..{}",
                height,
                FormatConfig::MAX_VIDEO_HEIGHT
            )));
        }
        let layout = PixelFormat::from_i32(pixel_format).ok_or_else(|| {
            CodecError::invalid_value(format!("unsupported pixel_format {}", pixel_format))
        })?;
        Ok(Self {
            width,
            height,
            pixel_format,
            layout,
        })
    }

    fn frame_size(&self) -> usize {
        self.layout.frame_size(self.width, self.height)
    }

    fn write_to(&self, caps: &mut Format) {
        caps.set_i32(keys::WIDTH, self.width);
        caps.set_i32(keys::HEIGHT, self.height);
        caps.set_i32(keys::PIXEL_FORMAT, self.pixel_format);
    }
}

fn missing(key: &str) -> CodecError {
    CodecError::invalid_value(format!("missing mandatory key {}", key))
}

fn require_i32(format: &Format, key: &str) -> Result<i32> {
    match format.get(key) {
        None => Err(missing(key)),
        Some(_) => format.get_i32(key).ok_or_else(|| {
            CodecError::invalid_value(format!("key {} must be an integer", key))
        }),
    }
}

fn copy_optional(from: &Format, to: &mut Format, optional: &[&str]) {
    for key in optional {
        if let Some(value) = from.get(key) {
            to.set(*key, FormatValue::clone(value));
        }
    }
}
