//! Pipeline engine: a codec element wrapped in a small streaming graph.
//!
//! The engine translates codec lifecycle calls into graph operations:
//!
//! - **init**: look up the implementation and spawn the graph thread
//! - **prepare**: attach source and sink adapters, then wait for READY
//! - **start**: flush first when an end of stream is pending, then wait for PLAYING
//! - **stop**: wait for READY, then flush
//! - **flush**: reset both adapters and broadcast flush through the graph
//!
//! All state waits are bounded by `EngineConfig::state_change_timeout_ms`.

pub mod element;
pub mod events;
pub mod graph;
pub mod processor;
pub mod registry;
pub mod sink;
pub mod source;
pub mod surface;

pub use element::{CodecElement, ElementError, ElementOutput, ErrorDomain, PassthroughElement, Sample};
pub use events::{EngineEvent, EventEmitter};
pub use graph::{GraphState, StateWaiter};
pub use processor::{FormatProcessor, PortConfig, PortPair};
pub use registry::{CodecDescriptor, CodecRegistry, ElementFactory};
pub use surface::{
    CropRect, InMemoryInputSurface, InMemoryOutputSurface, InMemorySurfaceProvider,
    InputSurface, OutputSurface, RenderedFrame, SurfaceProvider,
};

use crate::buffer::SharedBuffer;
use crate::config::EngineConfig;
use crate::error::{CodecError, Result};
use crate::format::Format;
use crate::types::{BufferFlag, BufferIndex, BufferInfo, CodecKind, SurfaceHandle};
use graph::Graph;
use sink::{ByteBufferSink, Sink, SurfaceSink};
use source::{ByteBufferSource, Source, SurfaceSource};
use std::sync::Arc;
use tracing::{debug, info};

/// One codec instance and the graph that runs it.
pub struct PipelineEngine {
    kind: CodecKind,
    codec_name: String,
    config: EngineConfig,
    surfaces: Arc<dyn SurfaceProvider>,
    processor: FormatProcessor,
    graph: Graph,
    emitter: EventEmitter,
    ports: Option<PortPair>,
    input_surface: Option<Arc<dyn InputSurface>>,
    output_surface: Option<Arc<dyn OutputSurface>>,
    source: Option<Arc<Source>>,
    sink: Option<Arc<Sink>>,
    started: bool,
    flush_at_start: bool,
    flush_count: u64,
}

impl PipelineEngine {
    /// Select an implementation and build the graph skeleton.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        kind: CodecKind,
        by_mime: bool,
        name: &str,
        registry: &CodecRegistry,
        config: EngineConfig,
        surfaces: Arc<dyn SurfaceProvider>,
        waiter: Arc<StateWaiter>,
        emitter: EventEmitter,
    ) -> Result<Self> {
        let descriptor = registry.find(kind, by_mime, name)?;
        let graph = Graph::spawn(descriptor.create_element(), waiter, emitter.clone())?;
        info!(
            "Selected {} for {} ({})",
            descriptor.name,
            name,
            if descriptor.hardware { "hardware" } else { "software" }
        );

        Ok(Self {
            kind,
            codec_name: descriptor.name.clone(),
            config,
            surfaces,
            processor: FormatProcessor::new(descriptor),
            graph,
            emitter,
            ports: None,
            input_surface: None,
            output_surface: None,
            source: None,
            sink: None,
            started: false,
            flush_at_start: false,
            flush_count: 0,
        })
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn configure(&mut self, format: &Format) -> Result<()> {
        let ports = self.processor.process(format)?;
        debug!(
            "{} configured: in {} / out {}",
            self.codec_name, ports.input.caps, ports.output.caps
        );
        self.ports = Some(ports);
        Ok(())
    }

    fn ports(&self, operation: &str) -> Result<&PortPair> {
        self.ports
            .as_ref()
            .ok_or_else(|| CodecError::not_permitted(operation, "unconfigured engine"))
    }

    pub fn create_input_surface(&mut self) -> Result<SurfaceHandle> {
        if self.kind != CodecKind::VideoEncoder {
            return Err(CodecError::not_permitted("create_input_surface", self.kind));
        }
        let caps = self.ports("create_input_surface")?.input.caps.clone();
        let (handle, surface) = self.surfaces.create_input_surface(&caps)?;
        self.input_surface = Some(surface);
        Ok(handle)
    }

    pub fn set_output_surface(&mut self, handle: SurfaceHandle) -> Result<()> {
        if self.kind != CodecKind::VideoDecoder {
            return Err(CodecError::not_permitted("set_output_surface", self.kind));
        }
        self.ports("set_output_surface")?;
        self.output_surface = Some(self.surfaces.output_surface(handle)?);
        Ok(())
    }

    /// Attach adapters and bring the graph to READY.
    pub fn prepare(&mut self) -> Result<()> {
        let ports = self.ports("prepare")?.clone();
        let dir = self.config.shm_dir();

        let source = match &self.input_surface {
            Some(surface) => Source::Surface(SurfaceSource::new(surface.clone(), self.graph.feeder())),
            None => Source::ByteBuffer(ByteBufferSource::new(
                &dir,
                self.config.input_buffer_count,
                ports.input.buffer_size.max(self.config.input_buffer_size),
                ports.input.needs_codec_data,
                self.graph.feeder(),
                self.emitter.clone(),
            )?),
        };
        let sink = match &self.output_surface {
            Some(surface) => Sink::Surface(SurfaceSink::new(
                ports.output.caps.clone(),
                surface.clone(),
                self.config.max_output_buffers,
                self.emitter.clone(),
            )),
            None => Sink::ByteBuffer(ByteBufferSink::new(
                ports.output.caps.clone(),
                dir,
                ports.output.buffer_size,
                self.config.max_output_buffers,
                self.emitter.clone(),
            )),
        };

        let source = Arc::new(source);
        let sink = Arc::new(sink);
        self.graph.link(source.clone(), sink.clone(), ports)?;
        if let Err(e) = self
            .graph
            .set_state(GraphState::Ready, self.config.state_change_timeout())
        {
            source.release();
            return Err(e);
        }
        self.source = Some(source);
        self.sink = Some(sink);
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.flush_at_start {
            debug!("{}: flushing before restart", self.codec_name);
            self.flush()?;
            self.flush_at_start = false;
        }
        self.graph
            .set_state(GraphState::Playing, self.config.state_change_timeout())?;
        self.started = true;
        if let Some(source) = &self.source {
            source.start();
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.graph
            .set_state(GraphState::Ready, self.config.state_change_timeout())?;
        self.started = false;
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        let epoch = self.graph.begin_flush();
        if let Some(source) = &self.source {
            source.flush();
        }
        if let Some(sink) = &self.sink {
            sink.flush();
        }
        self.graph.send_flush_events()?;
        self.flush_count += 1;
        debug!("{}: flushed, epoch {}", self.codec_name, epoch);
        Ok(())
    }

    /// End of stream from a surface-fed encoder.
    pub fn notify_eos(&mut self) -> Result<()> {
        self.graph.send_eos()?;
        self.flush_at_start = true;
        Ok(())
    }

    pub fn get_input_buffer(&self, index: BufferIndex) -> Result<Option<SharedBuffer>> {
        self.source("get_input_buffer")?.get_input_buffer(index)
    }

    pub fn queue_input_buffer(
        &mut self,
        index: BufferIndex,
        info: BufferInfo,
        flag: BufferFlag,
    ) -> Result<()> {
        self.source("queue_input_buffer")?
            .queue_input_buffer(index, info, flag)?;
        if flag.contains(BufferFlag::EOS) {
            self.graph.send_eos()?;
            self.flush_at_start = true;
        }
        Ok(())
    }

    pub fn get_output_buffer(&self, index: BufferIndex) -> Result<Option<SharedBuffer>> {
        self.sink("get_output_buffer")?.get_output_buffer(index)
    }

    pub fn release_output_buffer(&self, index: BufferIndex, render: bool) -> Result<()> {
        self.sink("release_output_buffer")?
            .release_output_buffer(index, render)
    }

    pub fn get_output_format(&self) -> Format {
        match (&self.sink, &self.ports) {
            (Some(sink), _) => sink.output_format(),
            (None, Some(ports)) => ports.output.caps.clone(),
            (None, None) => Format::new(),
        }
    }

    pub fn set_parameter(&mut self, params: &Format) -> Result<()> {
        if let Some(ports) = self.ports.as_mut() {
            ports.output.caps.merge(params);
        }
        if let Some(source) = &self.source {
            source.set_parameter(params);
        }
        if let Some(sink) = &self.sink {
            sink.set_parameter(params);
        }
        self.graph.set_parameter(params.clone())
    }

    /// Whether the next start will flush first.
    pub fn pending_flush(&self) -> bool {
        self.flush_at_start
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    /// Stop if running and tear down the graph and its adapters.
    pub fn release(&mut self) {
        if let Err(e) = self.stop() {
            debug!("{}: stop during release failed: {}", self.codec_name, e);
        }
        if let Some(source) = self.source.take() {
            source.release();
        }
        self.sink = None;
        self.graph.shutdown();
        info!("{} released", self.codec_name);
    }

    fn source(&self, operation: &str) -> Result<&Source> {
        self.source
            .as_deref()
            .ok_or_else(|| CodecError::not_permitted(operation, "unprepared engine"))
    }

    fn sink(&self, operation: &str) -> Result<&Sink> {
        self.sink
            .as_deref()
            .ok_or_else(|| CodecError::not_permitted(operation, "unprepared engine"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::keys;
    use crate::service::CodecEvent;
    use std::sync::mpsc::Receiver;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: PipelineEngine,
        rx: Receiver<EngineEvent>,
    }

    fn fixture(kind: CodecKind, mime: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            shm_dir: Some(dir.path().to_path_buf()),
            input_buffer_count: 2,
            input_buffer_size: 64,
            ..EngineConfig::default()
        };
        let (emitter, rx) = EventEmitter::channel(256);
        let engine = PipelineEngine::init(
            kind,
            true,
            mime,
            &CodecRegistry::with_defaults(),
            config,
            Arc::new(InMemorySurfaceProvider::new()),
            Arc::new(StateWaiter::new()),
            emitter,
        )
        .unwrap();
        Fixture {
            _dir: dir,
            engine,
            rx,
        }
    }

    fn audio_format() -> Format {
        let mut format = Format::new();
        format
            .set_i32(keys::CHANNEL_COUNT, 2)
            .set_i32(keys::SAMPLE_RATE, 44100)
            .set_i32(keys::AUDIO_RAW_FORMAT, 1);
        format
    }

    fn next_output(rx: &Receiver<EngineEvent>) -> (BufferIndex, BufferInfo, BufferFlag) {
        loop {
            let event = rx.recv_timeout(Duration::from_secs(5)).unwrap().event;
            if let CodecEvent::OutputBufferAvailable { index, info, flag } = event {
                return (index, info, flag);
            }
        }
    }

    #[test]
    fn test_unknown_mime_is_unsupported() {
        let (emitter, _rx) = EventEmitter::channel(8);
        let result = PipelineEngine::init(
            CodecKind::AudioDecoder,
            true,
            "audio/unknown",
            &CodecRegistry::with_defaults(),
            EngineConfig::default(),
            Arc::new(InMemorySurfaceProvider::new()),
            Arc::new(StateWaiter::new()),
            emitter,
        );
        assert_eq!(
            result.err().map(|e| e.kind()),
            Some(crate::error::ErrorKind::Unsupported)
        );
    }

    #[test]
    fn test_decode_round_trip() {
        let mut f = fixture(CodecKind::AudioDecoder, "audio/mp4a-latm");
        f.engine.configure(&audio_format()).unwrap();
        f.engine.prepare().unwrap();
        f.engine.start().unwrap();

        let input = f.engine.get_input_buffer(0).unwrap().unwrap();
        input.write_at(0, b"aac-frame").unwrap();
        f.engine
            .queue_input_buffer(0, BufferInfo::new(1000, 9, 0), BufferFlag::NONE)
            .unwrap();

        let (index, info, _) = next_output(&f.rx);
        assert_eq!(info.size, 9);
        assert_eq!(info.presentation_time_us, 1000);
        let output = f.engine.get_output_buffer(index).unwrap().unwrap();
        assert_eq!(output.read_at(0, 9).unwrap(), b"aac-frame".to_vec());
        f.engine.release_output_buffer(index, false).unwrap();

        f.engine.stop().unwrap();
        f.engine.release();
    }

    #[test]
    fn test_eos_arms_flush_for_next_start() {
        let mut f = fixture(CodecKind::AudioDecoder, "audio/mpeg");
        f.engine.configure(&audio_format()).unwrap();
        f.engine.prepare().unwrap();
        f.engine.start().unwrap();

        f.engine.get_input_buffer(1).unwrap();
        f.engine
            .queue_input_buffer(1, BufferInfo::new(0, 0, 0), BufferFlag::EOS)
            .unwrap();
        assert!(f.engine.pending_flush());

        let (index, _, flag) = next_output(&f.rx);
        assert_eq!(index, crate::types::EOS_BUFFER_INDEX);
        assert!(flag.contains(BufferFlag::EOS));

        let before = f.engine.flush_count();
        f.engine.start().unwrap();
        assert_eq!(f.engine.flush_count(), before + 1);
        assert!(!f.engine.pending_flush());
        f.engine.release();
    }

    #[test]
    fn test_data_queued_with_eos_precedes_it() {
        let mut f = fixture(CodecKind::AudioDecoder, "audio/mpeg");
        f.engine.configure(&audio_format()).unwrap();
        f.engine.prepare().unwrap();
        f.engine.start().unwrap();

        let first = f.engine.get_input_buffer(0).unwrap().unwrap();
        first.write_at(0, b"one").unwrap();
        f.engine
            .queue_input_buffer(0, BufferInfo::new(10, 3, 0), BufferFlag::NONE)
            .unwrap();
        let last = f.engine.get_input_buffer(1).unwrap().unwrap();
        last.write_at(0, b"last").unwrap();
        f.engine
            .queue_input_buffer(1, BufferInfo::new(20, 4, 0), BufferFlag::EOS)
            .unwrap();

        let (a, a_info, a_flag) = next_output(&f.rx);
        let (b, b_info, b_flag) = next_output(&f.rx);
        let (eos, _, eos_flag) = next_output(&f.rx);
        assert_ne!(a, crate::types::EOS_BUFFER_INDEX);
        assert_ne!(b, crate::types::EOS_BUFFER_INDEX);
        assert!(!a_flag.contains(BufferFlag::EOS));
        assert!(!b_flag.contains(BufferFlag::EOS));
        assert_eq!(a_info.presentation_time_us, 10);
        assert_eq!(b_info.presentation_time_us, 20);
        assert_eq!(eos, crate::types::EOS_BUFFER_INDEX);
        assert!(eos_flag.contains(BufferFlag::EOS));

        let output = f.engine.get_output_buffer(b).unwrap().unwrap();
        assert_eq!(
            output
                .read_at(b_info.offset as usize, b_info.size as usize)
                .unwrap(),
            b"last".to_vec()
        );
        f.engine.release();
    }

    #[test]
    fn test_surface_only_for_matching_role() {
        let mut f = fixture(CodecKind::AudioEncoder, "audio/flac");
        f.engine.configure(&audio_format()).unwrap();
        assert!(f.engine.create_input_surface().is_err());
        assert!(f.engine.set_output_surface(SurfaceHandle(1)).is_err());
        f.engine.release();
    }

    #[test]
    fn test_set_parameter_visible_in_output_format() {
        let mut f = fixture(CodecKind::AudioEncoder, "audio/mp4a-latm");
        f.engine.configure(&audio_format()).unwrap();
        f.engine.prepare().unwrap();

        let mut params = Format::new();
        params.set_i32(keys::BITRATE, 128_000);
        f.engine.set_parameter(&params).unwrap();
        assert_eq!(
            f.engine.get_output_format().get_i32(keys::BITRATE),
            Some(128_000)
        );
        f.engine.release();
    }
}
