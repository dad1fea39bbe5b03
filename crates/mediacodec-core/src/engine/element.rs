//! The generic codec node at the center of the graph.

use super::processor::PortConfig;
use crate::error::ErrorKind;
use crate::format::Format;
use crate::types::BufferFlag;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

/// One unit of media flowing through the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub data: Bytes,
    pub pts_us: i64,
    pub flags: BufferFlag,
}

/// What an element produces for the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementOutput {
    Sample(Sample),
    /// Mid-stream renegotiation; keys merge into the output format.
    FormatChanged(Format),
}

/// Where inside the graph a failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    Core,
    Library,
    Resource,
    Stream,
}

impl ErrorDomain {
    /// Collapse a graph error domain onto the caller-visible taxonomy.
    pub fn to_error_kind(self) -> ErrorKind {
        match self {
            ErrorDomain::Core => ErrorKind::Unknown,
            ErrorDomain::Library => ErrorKind::Unsupported,
            ErrorDomain::Resource => ErrorKind::InvalidValue,
            ErrorDomain::Stream => ErrorKind::Io,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{domain:?} error: {message}")]
pub struct ElementError {
    pub domain: ErrorDomain,
    pub message: String,
}

impl ElementError {
    pub fn new(domain: ErrorDomain, message: impl Into<String>) -> Self {
        Self {
            domain,
            message: message.into(),
        }
    }
}

/// A processing node: decoder, encoder, or anything shaped like one.
///
/// Runs on the graph thread only; never called concurrently.
pub trait CodecElement: Send {
    fn name(&self) -> &str;

    fn configure(&mut self, input: &PortConfig, output: &PortConfig) -> Result<(), ElementError>;

    fn set_codec_data(&mut self, _data: Bytes) -> Result<(), ElementError> {
        Ok(())
    }

    fn process(&mut self, sample: Sample) -> Result<Vec<ElementOutput>, ElementError>;

    /// Emit anything still buffered at end of stream.
    fn drain(&mut self) -> Result<Vec<ElementOutput>, ElementError> {
        Ok(Vec::new())
    }

    fn flush(&mut self) {}

    fn set_parameter(&mut self, _params: &Format) -> Result<(), ElementError> {
        Ok(())
    }
}

/// Forwards every sample unchanged.
pub struct PassthroughElement {
    name: String,
    configured: bool,
    codec_data: Option<Bytes>,
    frames: u64,
}

impl PassthroughElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            configured: false,
            codec_data: None,
            frames: 0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl CodecElement for PassthroughElement {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, input: &PortConfig, output: &PortConfig) -> Result<(), ElementError> {
        debug!(
            "{}: negotiated {} -> {}",
            self.name, input.caps, output.caps
        );
        self.configured = true;
        Ok(())
    }

    fn set_codec_data(&mut self, data: Bytes) -> Result<(), ElementError> {
        debug!("{}: {} bytes of codec data", self.name, data.len());
        self.codec_data = Some(data);
        Ok(())
    }

    fn process(&mut self, sample: Sample) -> Result<Vec<ElementOutput>, ElementError> {
        if !self.configured {
            return Err(ElementError::new(ErrorDomain::Core, "element not negotiated"));
        }
        self.frames += 1;
        Ok(vec![ElementOutput::Sample(Sample {
            flags: sample
                .flags
                .without(BufferFlag::EOS)
                .without(BufferFlag::CODEC_DATA),
            ..sample
        })])
    }

    fn flush(&mut self) {
        debug!("{}: flushed after {} frames", self.name, self.frames);
    }
}
