//! Capability lookup: which codec implementations exist and how to build them.

use super::element::{CodecElement, PassthroughElement};
use crate::error::{CodecError, Result};
use crate::types::CodecKind;
use std::fmt;
use std::sync::Arc;

pub type ElementFactory = Arc<dyn Fn() -> Box<dyn CodecElement> + Send + Sync>;

/// One registered codec implementation.
#[derive(Clone)]
pub struct CodecDescriptor {
    pub name: String,
    pub mime: String,
    pub kind: CodecKind,
    pub hardware: bool,
    /// First input buffer must carry codec configuration data.
    pub needs_codec_data: bool,
    /// Input must be parsed into frames before decoding.
    pub needs_parser: bool,
    factory: ElementFactory,
}

impl CodecDescriptor {
    pub fn new(
        name: impl Into<String>,
        mime: impl Into<String>,
        kind: CodecKind,
        factory: ElementFactory,
    ) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            kind,
            hardware: false,
            needs_codec_data: false,
            needs_parser: false,
            factory,
        }
    }

    pub fn hardware(mut self, hardware: bool) -> Self {
        self.hardware = hardware;
        self
    }

    pub fn needs_codec_data(mut self, needs: bool) -> Self {
        self.needs_codec_data = needs;
        self
    }

    pub fn needs_parser(mut self, needs: bool) -> Self {
        self.needs_parser = needs;
        self
    }

    pub fn create_element(&self) -> Box<dyn CodecElement> {
        (self.factory)()
    }
}

impl fmt::Debug for CodecDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecDescriptor")
            .field("name", &self.name)
            .field("mime", &self.mime)
            .field("kind", &self.kind)
            .field("hardware", &self.hardware)
            .finish()
    }
}

const VIDEO_MIMES: &[(&str, &str)] = &[
    ("video/3gpp", "h263"),
    ("video/avc", "h264"),
    ("video/hevc", "h265"),
    ("video/mpeg2", "mpeg2"),
    ("video/mp4v-es", "mpeg4"),
];

const AUDIO_MIMES: &[(&str, &str)] = &[
    ("audio/vorbis", "vorbis"),
    ("audio/mpeg", "mp3"),
    ("audio/mp4a-latm", "aac"),
    ("audio/flac", "flac"),
];

/// Table of available codecs, passed explicitly to each server.
#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    descriptors: Vec<CodecDescriptor>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Software passthrough codecs for every supported MIME type.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (mime, short) in VIDEO_MIMES {
            registry.register_passthrough(mime, short, CodecKind::VideoDecoder);
            registry.register_passthrough(mime, short, CodecKind::VideoEncoder);
        }
        for (mime, short) in AUDIO_MIMES {
            registry.register_passthrough(mime, short, CodecKind::AudioDecoder);
            registry.register_passthrough(mime, short, CodecKind::AudioEncoder);
        }
        registry
    }

    fn register_passthrough(&mut self, mime: &str, short: &str, kind: CodecKind) {
        let role = if kind.is_encoder() { "enc" } else { "dec" };
        let name = format!("soft.{}.{}", short, role);
        let element_name = name.clone();
        let factory: ElementFactory =
            Arc::new(move || Box::new(PassthroughElement::new(element_name.clone())));
        let decoder = !kind.is_encoder();
        self.register(
            CodecDescriptor::new(name, mime, kind, factory)
                .needs_codec_data(decoder && mime == "audio/vorbis")
                .needs_parser(decoder && mime == "audio/flac"),
        );
    }

    pub fn register(&mut self, descriptor: CodecDescriptor) {
        self.descriptors.push(descriptor);
    }

    /// Select an implementation by MIME type or exact name.
    ///
    /// MIME lookups prefer hardware implementations.
    pub fn find(&self, kind: CodecKind, by_mime: bool, name: &str) -> Result<&CodecDescriptor> {
        let mut candidates = self.descriptors.iter().filter(|d| {
            d.kind == kind && if by_mime { d.mime == name } else { d.name == name }
        });
        let found = if by_mime {
            let all: Vec<_> = candidates.collect();
            all.iter()
                .find(|d| d.hardware)
                .or_else(|| all.first())
                .copied()
        } else {
            candidates.next()
        };
        found.ok_or_else(|| {
            CodecError::unsupported(format!(
                "no {} registered for {} {}",
                kind,
                if by_mime { "mime" } else { "name" },
                name
            ))
        })
    }

    pub fn descriptors(&self) -> &[CodecDescriptor] {
        &self.descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_mime_table() {
        let registry = CodecRegistry::with_defaults();
        for mime in ["video/avc", "video/hevc", "audio/mp4a-latm", "audio/flac"] {
            let kind = if mime.starts_with("video") {
                CodecKind::VideoDecoder
            } else {
                CodecKind::AudioDecoder
            };
            assert!(registry.find(kind, true, mime).is_ok(), "{}", mime);
        }
        assert_eq!(registry.descriptors().len(), 18);
    }

    #[test]
    fn test_find_by_name() {
        let registry = CodecRegistry::with_defaults();
        let d = registry
            .find(CodecKind::AudioDecoder, false, "soft.aac.dec")
            .unwrap();
        assert_eq!(d.mime, "audio/mp4a-latm");
        assert!(registry
            .find(CodecKind::AudioEncoder, false, "soft.aac.dec")
            .is_err());
    }

    #[test]
    fn test_mime_lookup_prefers_hardware() {
        let mut registry = CodecRegistry::with_defaults();
        let factory: ElementFactory = Arc::new(|| Box::new(PassthroughElement::new("hw")));
        registry.register(
            CodecDescriptor::new("hw.h264.dec", "video/avc", CodecKind::VideoDecoder, factory)
                .hardware(true),
        );
        let d = registry
            .find(CodecKind::VideoDecoder, true, "video/avc")
            .unwrap();
        assert_eq!(d.name, "hw.h264.dec");
    }

    #[test]
    fn test_unknown_mime_unsupported() {
        let registry = CodecRegistry::with_defaults();
        let err = registry
            .find(CodecKind::AudioDecoder, true, "audio/opus")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);
    }

    #[test]
    fn test_vorbis_decoder_needs_codec_data() {
        let registry = CodecRegistry::with_defaults();
        let d = registry
            .find(CodecKind::AudioDecoder, true, "audio/vorbis")
            .unwrap();
        assert!(d.needs_codec_data);
        let e = registry
            .find(CodecKind::AudioEncoder, true, "audio/vorbis")
            .unwrap();
        assert!(!e.needs_codec_data);
    }
}
