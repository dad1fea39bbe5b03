//! Input adapters: where media enters the graph.
//!
//! The byte-buffer source owns an arena of shared buffers keyed by index.
//! Each slot is owned by exactly one party at a time:
//!
//! ```text
//! Engine --get_input_buffer--> Client --queue_input_buffer--> Downstream
//!   ^                                                             |
//!   +---------------- consumed by the graph (or flush) -----------+
//! ```

use super::element::Sample;
use super::events::EventEmitter;
use super::graph::GraphFeeder;
use super::surface::InputSurface;
use crate::buffer::SharedBuffer;
use crate::error::{CodecError, Result};
use crate::format::Format;
use crate::service::CodecEvent;
use crate::types::{BufferFlag, BufferIndex, BufferInfo};
use bytes::Bytes;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Current holder of a buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Available for the engine to hand out or fill.
    Engine,
    /// Lent to the caller.
    Client,
    /// Queued in the graph.
    Downstream,
}

/// Input side of the graph, chosen at prepare time.
pub enum Source {
    ByteBuffer(ByteBufferSource),
    Surface(SurfaceSource),
}

impl Source {
    /// Announce every available input slot.
    pub fn start(&self) {
        if let Source::ByteBuffer(source) = self {
            source.announce_available();
        }
    }

    pub fn flush(&self) {
        if let Source::ByteBuffer(source) = self {
            source.flush();
        }
    }

    pub fn get_input_buffer(&self, index: BufferIndex) -> Result<Option<SharedBuffer>> {
        match self {
            Source::ByteBuffer(source) => Ok(source.get_input_buffer(index)),
            Source::Surface(_) => Err(CodecError::not_permitted(
                "get_input_buffer",
                "surface input",
            )),
        }
    }

    pub fn queue_input_buffer(
        &self,
        index: BufferIndex,
        info: BufferInfo,
        flag: BufferFlag,
    ) -> Result<()> {
        match self {
            Source::ByteBuffer(source) => source.queue_input_buffer(index, info, flag),
            Source::Surface(_) => Err(CodecError::not_permitted(
                "queue_input_buffer",
                "surface input",
            )),
        }
    }

    /// Called from the graph thread once a queued buffer has been processed.
    pub fn input_consumed(&self, index: BufferIndex, epoch: u64) {
        if let Source::ByteBuffer(source) = self {
            source.input_consumed(index, epoch);
        }
    }

    pub fn set_parameter(&self, params: &Format) {
        if let Source::Surface(source) = self {
            source.set_parameter(params);
        }
    }

    pub fn release(&self) {
        if let Source::Surface(source) = self {
            source.surface.disconnect();
        }
    }
}

struct InputSlot {
    buffer: SharedBuffer,
    owner: Owner,
}

struct ByteSourceState {
    slots: Vec<InputSlot>,
    codec_data_seen: bool,
}

/// Buffer-queue input.
pub struct ByteBufferSource {
    state: Mutex<ByteSourceState>,
    feeder: GraphFeeder,
    emitter: EventEmitter,
    needs_codec_data: bool,
}

impl ByteBufferSource {
    pub fn new(
        dir: &Path,
        count: u32,
        buffer_size: usize,
        needs_codec_data: bool,
        feeder: GraphFeeder,
        emitter: EventEmitter,
    ) -> Result<Self> {
        let slots = (0..count)
            .map(|_| {
                Ok(InputSlot {
                    buffer: SharedBuffer::allocate(dir, buffer_size)?,
                    owner: Owner::Engine,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("Input arena: {} buffers of {} bytes", count, buffer_size);

        Ok(Self {
            state: Mutex::new(ByteSourceState {
                slots,
                codec_data_seen: false,
            }),
            feeder,
            emitter,
            needs_codec_data,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ByteSourceState> {
        self.state.lock().expect("input arena lock poisoned")
    }

    fn announce_available(&self) {
        let available: Vec<BufferIndex> = self
            .lock()
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.owner == Owner::Engine)
            .map(|(index, _)| index as BufferIndex)
            .collect();
        for index in available {
            self.emitter.emit(CodecEvent::InputBufferAvailable(index));
        }
    }

    fn flush(&self) {
        for slot in self.lock().slots.iter_mut() {
            slot.owner = Owner::Engine;
        }
    }

    /// Lend a slot to the caller. `None` when the slot is not available.
    fn get_input_buffer(&self, index: BufferIndex) -> Option<SharedBuffer> {
        let mut state = self.lock();
        let slot = state.slots.get_mut(index as usize)?;
        match slot.owner {
            Owner::Engine | Owner::Client => {
                slot.owner = Owner::Client;
                Some(slot.buffer.clone())
            }
            Owner::Downstream => {
                debug!("Input buffer {} still queued", index);
                None
            }
        }
    }

    fn queue_input_buffer(&self, index: BufferIndex, info: BufferInfo, flag: BufferFlag) -> Result<()> {
        let mut state = self.lock();
        let needs_codec_data = self.needs_codec_data && !state.codec_data_seen;
        let slot = state
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| CodecError::invalid_value(format!("no input buffer {}", index)))?;
        if slot.owner != Owner::Client {
            return Err(CodecError::invalid_value(format!(
                "input buffer {} is not held by the caller",
                index
            )));
        }
        info.validate(slot.buffer.capacity())?;

        let is_codec_data = flag.contains(BufferFlag::CODEC_DATA);
        if needs_codec_data && !is_codec_data {
            return Err(CodecError::invalid_value(
                "first input buffer must carry codec data",
            ));
        }

        let data = if info.size > 0 {
            Bytes::from(slot.buffer.read_at(info.offset as usize, info.size as usize)?)
        } else {
            Bytes::new()
        };

        if is_codec_data {
            self.feeder.push_codec_data(data)?;
            slot.owner = Owner::Engine;
            state.codec_data_seen = true;
            drop(state);
            self.emitter.emit(CodecEvent::InputBufferAvailable(index));
            return Ok(());
        }

        if data.is_empty() {
            // An empty buffer only carries flags
            slot.owner = Owner::Engine;
            drop(state);
            self.emitter.emit(CodecEvent::InputBufferAvailable(index));
            return Ok(());
        }

        slot.owner = Owner::Downstream;
        self.feeder.push(
            Sample {
                data,
                pts_us: info.presentation_time_us,
                flags: flag.without(BufferFlag::EOS),
            },
            Some(index),
        )
    }

    fn input_consumed(&self, index: BufferIndex, epoch: u64) {
        if epoch != self.feeder.epoch() {
            return;
        }
        {
            let mut state = self.lock();
            match state.slots.get_mut(index as usize) {
                Some(slot) if slot.owner == Owner::Downstream => slot.owner = Owner::Engine,
                _ => {
                    warn!("Consumed input buffer {} was not queued", index);
                    return;
                }
            }
        }
        self.emitter.emit(CodecEvent::InputBufferAvailable(index));
    }

    pub fn owner(&self, index: BufferIndex) -> Option<Owner> {
        self.lock().slots.get(index as usize).map(|slot| slot.owner)
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Surface input: frames are pushed straight into the graph by the producer.
pub struct SurfaceSource {
    surface: Arc<dyn InputSurface>,
}

impl SurfaceSource {
    pub fn new(surface: Arc<dyn InputSurface>, feeder: GraphFeeder) -> Self {
        surface.connect(feeder);
        Self { surface }
    }

    fn set_parameter(&self, params: &Format) {
        self.surface.set_parameter(params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::element::PassthroughElement;
    use crate::engine::graph::{Graph, StateWaiter};
    use std::sync::mpsc::Receiver;

    use crate::engine::events::EngineEvent;

    struct Fixture {
        _dir: tempfile::TempDir,
        _graph: Graph,
        source: ByteBufferSource,
        rx: Receiver<EngineEvent>,
    }

    fn fixture(needs_codec_data: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (emitter, rx) = EventEmitter::channel(64);
        let graph = Graph::spawn(
            Box::new(PassthroughElement::new("src-test")),
            Arc::new(StateWaiter::new()),
            emitter.clone(),
        )
        .unwrap();
        let source =
            ByteBufferSource::new(dir.path(), 3, 64, needs_codec_data, graph.feeder(), emitter)
                .unwrap();
        Fixture {
            _dir: dir,
            _graph: graph,
            source,
            rx,
        }
    }

    #[test]
    fn test_start_announces_every_slot() {
        let f = fixture(false);
        Source::ByteBuffer(f.source).start();
        let indices: Vec<_> = f.rx.try_iter().map(|e| e.event).collect();
        assert_eq!(
            indices,
            vec![
                CodecEvent::InputBufferAvailable(0),
                CodecEvent::InputBufferAvailable(1),
                CodecEvent::InputBufferAvailable(2),
            ]
        );
    }

    #[test]
    fn test_ownership_cycle() {
        let f = fixture(false);
        let buffer = f.source.get_input_buffer(1).unwrap();
        assert_eq!(f.source.owner(1), Some(Owner::Client));

        buffer.write_at(0, b"frame").unwrap();
        f.source
            .queue_input_buffer(1, BufferInfo::new(0, 5, 0), BufferFlag::NONE)
            .unwrap();
        assert_eq!(f.source.owner(1), Some(Owner::Downstream));
        assert!(f.source.get_input_buffer(1).is_none());

        f.source.flush();
        assert_eq!(f.source.owner(1), Some(Owner::Engine));
    }

    #[test]
    fn test_queue_requires_client_ownership() {
        let f = fixture(false);
        let err = f
            .source
            .queue_input_buffer(0, BufferInfo::new(0, 1, 0), BufferFlag::NONE)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn test_queue_rejects_range_past_capacity() {
        let f = fixture(false);
        f.source.get_input_buffer(0).unwrap();
        assert!(f
            .source
            .queue_input_buffer(0, BufferInfo::new(0, 60, 10), BufferFlag::NONE)
            .is_err());
        assert_eq!(f.source.owner(0), Some(Owner::Client));
    }

    #[test]
    fn test_codec_data_required_first() {
        let f = fixture(true);
        f.source.get_input_buffer(0).unwrap();
        assert!(f
            .source
            .queue_input_buffer(0, BufferInfo::new(0, 4, 0), BufferFlag::NONE)
            .is_err());

        f.source
            .queue_input_buffer(0, BufferInfo::new(0, 4, 0), BufferFlag::CODEC_DATA)
            .unwrap();
        assert_eq!(f.source.owner(0), Some(Owner::Engine));
        assert_eq!(
            f.rx.try_recv().unwrap().event,
            CodecEvent::InputBufferAvailable(0)
        );

        f.source.get_input_buffer(0).unwrap();
        f.source
            .queue_input_buffer(0, BufferInfo::new(0, 4, 0), BufferFlag::NONE)
            .unwrap();
    }

    #[test]
    fn test_flag_only_buffer_returns_slot() {
        let f = fixture(false);
        f.source.get_input_buffer(0).unwrap();
        f.source
            .queue_input_buffer(0, BufferInfo::new(0, 0, 0), BufferFlag::SYNC_FRAME)
            .unwrap();
        assert_eq!(f.source.owner(0), Some(Owner::Engine));
        assert_eq!(
            f.rx.try_recv().unwrap().event,
            CodecEvent::InputBufferAvailable(0)
        );

        // The slot can be lent out again
        assert!(f.source.get_input_buffer(0).is_some());
    }

    #[test]
    fn test_stale_consumption_ignored() {
        let f = fixture(false);
        f.source.get_input_buffer(2).unwrap();
        f.source
            .queue_input_buffer(2, BufferInfo::new(0, 2, 0), BufferFlag::NONE)
            .unwrap();
        // Epoch 0 is current; a notification tagged 5 predates nothing we know of
        f.source.input_consumed(2, 5);
        assert_eq!(f.source.owner(2), Some(Owner::Downstream));
        f.source.input_consumed(2, 0);
        assert_eq!(f.source.owner(2), Some(Owner::Engine));
    }
}
