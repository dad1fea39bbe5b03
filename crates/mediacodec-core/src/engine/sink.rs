//! Output adapters: where media leaves the graph.

use super::element::{ElementOutput, Sample};
use super::events::EventEmitter;
use super::source::Owner;
use super::surface::{CropRect, OutputSurface};
use crate::buffer::SharedBuffer;
use crate::error::{CodecError, Result};
use crate::format::Format;
use crate::service::CodecEvent;
use crate::types::{BufferFlag, BufferIndex, BufferInfo, EOS_BUFFER_INDEX};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Output side of the graph, chosen at prepare time.
pub enum Sink {
    ByteBuffer(ByteBufferSink),
    Surface(SurfaceSink),
}

impl Sink {
    /// Called from the graph thread for every element output.
    pub fn render(&self, output: ElementOutput) -> Result<()> {
        match output {
            ElementOutput::FormatChanged(format) => {
                self.core().renegotiate(&format);
                Ok(())
            }
            ElementOutput::Sample(sample) => match self {
                Sink::ByteBuffer(sink) => sink.render(sample),
                Sink::Surface(sink) => sink.render(sample),
            },
        }
    }

    pub fn render_eos(&self) {
        self.core().emitter.emit(CodecEvent::OutputBufferAvailable {
            index: EOS_BUFFER_INDEX,
            info: BufferInfo::default(),
            flag: BufferFlag::EOS,
        });
    }

    pub fn get_output_buffer(&self, index: BufferIndex) -> Result<Option<SharedBuffer>> {
        match self {
            Sink::ByteBuffer(sink) => Ok(sink.get_output_buffer(index)),
            Sink::Surface(_) => Err(CodecError::not_permitted(
                "get_output_buffer",
                "surface output",
            )),
        }
    }

    pub fn release_output_buffer(&self, index: BufferIndex, render: bool) -> Result<()> {
        match self {
            Sink::ByteBuffer(sink) => sink.release_output_buffer(index),
            Sink::Surface(sink) => sink.release_output_buffer(index, render),
        }
    }

    pub fn flush(&self) {
        self.core().reset_first_frame();
        match self {
            Sink::ByteBuffer(sink) => sink.flush(),
            Sink::Surface(sink) => sink.flush(),
        }
    }

    pub fn output_format(&self) -> Format {
        self.core().format()
    }

    pub fn set_parameter(&self, params: &Format) {
        self.core().merge(params);
        if let Sink::Surface(sink) = self {
            sink.set_parameter(params);
        }
    }

    fn core(&self) -> &SinkCore {
        match self {
            Sink::ByteBuffer(sink) => &sink.core,
            Sink::Surface(sink) => &sink.core,
        }
    }
}

struct FormatState {
    format: Format,
    first_frame: bool,
}

/// Output format bookkeeping shared by both sinks.
struct SinkCore {
    state: Mutex<FormatState>,
    emitter: EventEmitter,
}

impl SinkCore {
    fn new(format: Format, emitter: EventEmitter) -> Self {
        Self {
            state: Mutex::new(FormatState {
                format,
                first_frame: true,
            }),
            emitter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FormatState> {
        self.state.lock().expect("sink format lock poisoned")
    }

    /// Report the output format ahead of the first frame.
    fn before_frame(&self) {
        let announce = {
            let mut state = self.lock();
            if state.first_frame {
                state.first_frame = false;
                Some(state.format.clone())
            } else {
                None
            }
        };
        if let Some(format) = announce {
            self.emitter.emit(CodecEvent::OutputFormatChanged(format));
        }
    }

    fn renegotiate(&self, update: &Format) {
        let format = {
            let mut state = self.lock();
            state.format.merge(update);
            state.first_frame = false;
            state.format.clone()
        };
        debug!("Output renegotiated to {}", format);
        self.emitter.emit(CodecEvent::OutputFormatChanged(format));
    }

    fn reset_first_frame(&self) {
        self.lock().first_frame = true;
    }

    fn merge(&self, params: &Format) {
        self.lock().format.merge(params);
    }

    fn format(&self) -> Format {
        self.lock().format.clone()
    }
}

struct OutputSlot {
    buffer: SharedBuffer,
    owner: Owner,
}

/// Copies output into an arena of shared buffers keyed by index.
///
/// Slot ownership: `Downstream` is free for the graph, `Engine` is filled
/// and announced, `Client` has been handed to the caller.
pub struct ByteBufferSink {
    core: SinkCore,
    slots: Mutex<Vec<OutputSlot>>,
    dir: PathBuf,
    buffer_size: usize,
    max_buffers: u32,
}

impl ByteBufferSink {
    pub fn new(
        format: Format,
        dir: PathBuf,
        buffer_size: usize,
        max_buffers: u32,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            core: SinkCore::new(format, emitter),
            slots: Mutex::new(Vec::new()),
            dir,
            buffer_size: buffer_size.max(1),
            max_buffers,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OutputSlot>> {
        self.slots.lock().expect("output arena lock poisoned")
    }

    fn render(&self, sample: Sample) -> Result<()> {
        self.core.before_frame();
        let len = sample.data.len();

        let index = {
            let mut slots = self.lock();
            let free = slots
                .iter()
                .position(|s| s.owner == Owner::Downstream && s.buffer.capacity() >= len)
                .or_else(|| slots.iter().position(|s| s.owner == Owner::Downstream));

            let index = match free {
                Some(index) => {
                    if slots[index].buffer.capacity() < len {
                        slots[index].buffer =
                            SharedBuffer::allocate(&self.dir, len.max(self.buffer_size))?;
                        debug!("Output buffer {} reallocated for {} bytes", index, len);
                    }
                    index
                }
                None if slots.len() < self.max_buffers as usize => {
                    slots.push(OutputSlot {
                        buffer: SharedBuffer::allocate(&self.dir, len.max(self.buffer_size))?,
                        owner: Owner::Downstream,
                    });
                    slots.len() - 1
                }
                None => {
                    return Err(CodecError::no_memory(format!(
                        "all {} output buffers are in use",
                        self.max_buffers
                    )))
                }
            };

            if len > 0 {
                slots[index].buffer.write_at(0, &sample.data)?;
            }
            slots[index].owner = Owner::Engine;
            index as BufferIndex
        };

        self.core.emitter.emit(CodecEvent::OutputBufferAvailable {
            index,
            info: BufferInfo::new(sample.pts_us, len as i32, 0),
            flag: sample.flags,
        });
        Ok(())
    }

    fn get_output_buffer(&self, index: BufferIndex) -> Option<SharedBuffer> {
        let mut slots = self.lock();
        let slot = slots.get_mut(index as usize)?;
        match slot.owner {
            Owner::Engine | Owner::Client => {
                slot.owner = Owner::Client;
                Some(slot.buffer.clone())
            }
            Owner::Downstream => None,
        }
    }

    fn release_output_buffer(&self, index: BufferIndex) -> Result<()> {
        let mut slots = self.lock();
        match slots.get_mut(index as usize) {
            Some(slot) if slot.owner != Owner::Downstream => {
                slot.owner = Owner::Downstream;
                Ok(())
            }
            _ => Err(CodecError::invalid_value(format!(
                "output buffer {} is not pending release",
                index
            ))),
        }
    }

    fn flush(&self) {
        for slot in self.lock().iter_mut() {
            slot.owner = Owner::Downstream;
        }
    }

    pub fn owner(&self, index: BufferIndex) -> Option<Owner> {
        self.lock().get(index as usize).map(|slot| slot.owner)
    }
}

struct PendingFrame {
    data: Bytes,
    pts_us: i64,
}

/// Holds decoded frames until the caller decides to render or drop them.
pub struct SurfaceSink {
    core: SinkCore,
    surface: Arc<dyn OutputSurface>,
    frames: Mutex<Vec<Option<PendingFrame>>>,
    crop: Mutex<Option<CropRect>>,
    max_buffers: u32,
}

impl SurfaceSink {
    pub fn new(
        format: Format,
        surface: Arc<dyn OutputSurface>,
        max_buffers: u32,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            core: SinkCore::new(format, emitter),
            surface,
            frames: Mutex::new(Vec::new()),
            crop: Mutex::new(None),
            max_buffers,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<PendingFrame>>> {
        self.frames.lock().expect("surface frame lock poisoned")
    }

    fn render(&self, sample: Sample) -> Result<()> {
        self.core.before_frame();
        let size = sample.data.len();
        let pending = PendingFrame {
            data: sample.data,
            pts_us: sample.pts_us,
        };

        let index = {
            let mut frames = self.lock();
            match frames.iter().position(Option::is_none) {
                Some(index) => {
                    frames[index] = Some(pending);
                    index
                }
                None if frames.len() < self.max_buffers as usize => {
                    frames.push(Some(pending));
                    frames.len() - 1
                }
                None => {
                    return Err(CodecError::no_memory(format!(
                        "all {} surface slots are pending",
                        self.max_buffers
                    )))
                }
            }
        };

        self.core.emitter.emit(CodecEvent::OutputBufferAvailable {
            index: index as BufferIndex,
            info: BufferInfo::new(sample.pts_us, size as i32, 0),
            flag: sample.flags,
        });
        Ok(())
    }

    fn release_output_buffer(&self, index: BufferIndex, render: bool) -> Result<()> {
        let frame = self
            .lock()
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or_else(|| {
                CodecError::invalid_value(format!("no pending frame at index {}", index))
            })?;
        if render {
            self.surface.render(&frame.data, frame.pts_us)?;
        }
        Ok(())
    }

    fn flush(&self) {
        for frame in self.lock().iter_mut() {
            frame.take();
        }
    }

    fn set_parameter(&self, params: &Format) {
        let mut crop = self.crop.lock().expect("surface crop lock poisoned");
        if let Some(rect) = CropRect::from_format(params, *crop) {
            *crop = Some(rect);
            self.surface.set_crop(rect);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::EngineEvent;
    use crate::engine::surface::InMemoryOutputSurface;
    use crate::format::keys;
    use std::sync::mpsc::Receiver;

    fn sample(len: usize, pts_us: i64) -> ElementOutput {
        ElementOutput::Sample(Sample {
            data: Bytes::from(vec![7u8; len]),
            pts_us,
            flags: BufferFlag::NONE,
        })
    }

    fn byte_sink(dir: &tempfile::TempDir, max: u32) -> (Sink, Receiver<EngineEvent>) {
        let (emitter, rx) = EventEmitter::channel(64);
        let mut format = Format::new();
        format.set_i32(keys::SAMPLE_RATE, 48000);
        let sink = ByteBufferSink::new(format, dir.path().to_path_buf(), 16, max, emitter);
        (Sink::ByteBuffer(sink), rx)
    }

    #[test]
    fn test_first_frame_announces_format() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, rx) = byte_sink(&dir, 4);
        sink.render(sample(8, 1000)).unwrap();
        sink.render(sample(8, 2000)).unwrap();

        let events: Vec<_> = rx.try_iter().map(|e| e.event).collect();
        assert!(matches!(events[0], CodecEvent::OutputFormatChanged(_)));
        assert_eq!(
            events[1],
            CodecEvent::OutputBufferAvailable {
                index: 0,
                info: BufferInfo::new(1000, 8, 0),
                flag: BufferFlag::NONE,
            }
        );
        assert!(matches!(
            events[2],
            CodecEvent::OutputBufferAvailable { index: 1, .. }
        ));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_released_slot_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _rx) = byte_sink(&dir, 4);
        sink.render(sample(8, 0)).unwrap();
        let first = sink.get_output_buffer(0).unwrap().unwrap();
        assert_eq!(first.read_at(0, 8).unwrap(), vec![7u8; 8]);
        sink.release_output_buffer(0, false).unwrap();

        sink.render(sample(8, 1)).unwrap();
        let again = sink.get_output_buffer(0).unwrap().unwrap();
        assert_eq!(again.id(), first.id());
    }

    #[test]
    fn test_large_frame_reallocates_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _rx) = byte_sink(&dir, 1);
        sink.render(sample(8, 0)).unwrap();
        let small = sink.get_output_buffer(0).unwrap().unwrap();
        sink.release_output_buffer(0, false).unwrap();

        sink.render(sample(64, 1)).unwrap();
        let large = sink.get_output_buffer(0).unwrap().unwrap();
        assert_ne!(large.id(), small.id());
        assert_eq!(large.capacity(), 64);
    }

    #[test]
    fn test_arena_limit_reports_no_memory() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _rx) = byte_sink(&dir, 1);
        sink.render(sample(4, 0)).unwrap();
        let err = sink.render(sample(4, 1)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoMemory);
    }

    #[test]
    fn test_release_requires_filled_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _rx) = byte_sink(&dir, 4);
        assert!(sink.release_output_buffer(0, false).is_err());
        sink.render(sample(4, 0)).unwrap();
        sink.flush();
        assert!(sink.get_output_buffer(0).unwrap().is_none());
        assert!(sink.release_output_buffer(0, false).is_err());
    }

    #[test]
    fn test_eos_uses_sentinel_index() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, rx) = byte_sink(&dir, 4);
        sink.render_eos();
        assert_eq!(
            rx.try_recv().unwrap().event,
            CodecEvent::OutputBufferAvailable {
                index: EOS_BUFFER_INDEX,
                info: BufferInfo::default(),
                flag: BufferFlag::EOS,
            }
        );
    }

    #[test]
    fn test_renegotiation_merges_format() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, rx) = byte_sink(&dir, 4);
        let mut update = Format::new();
        update.set_i32(keys::CHANNEL_COUNT, 6);
        sink.render(ElementOutput::FormatChanged(update)).unwrap();

        let format = sink.output_format();
        assert_eq!(format.get_i32(keys::SAMPLE_RATE), Some(48000));
        assert_eq!(format.get_i32(keys::CHANNEL_COUNT), Some(6));
        assert!(matches!(
            rx.try_recv().unwrap().event,
            CodecEvent::OutputFormatChanged(_)
        ));
    }

    #[test]
    fn test_surface_sink_renders_on_request() {
        let (emitter, _rx) = EventEmitter::channel(64);
        let surface = Arc::new(InMemoryOutputSurface::default());
        let sink = Sink::Surface(SurfaceSink::new(
            Format::new(),
            surface.clone(),
            4,
            emitter,
        ));

        sink.render(sample(32, 100)).unwrap();
        sink.render(sample(32, 200)).unwrap();
        assert!(sink.get_output_buffer(0).is_err());

        let mut crop = Format::new();
        crop.set_i32(keys::CROP_BOTTOM, 15);
        sink.set_parameter(&crop);

        sink.release_output_buffer(0, true).unwrap();
        sink.release_output_buffer(1, false).unwrap();
        assert!(sink.release_output_buffer(1, true).is_err());

        let rendered = surface.rendered();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].pts_us, 100);
        assert_eq!(rendered[0].crop.map(|c| c.bottom), Some(15));
        assert_eq!(sink.output_format().get_i32(keys::CROP_BOTTOM), Some(15));
    }
}
