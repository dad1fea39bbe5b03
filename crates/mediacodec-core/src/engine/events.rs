//! Engine-to-server event channel.
//!
//! Everything the engine raises (from the graph thread or the control
//! thread) goes through one bounded channel into the server's dispatcher,
//! which preserves emission order.

use crate::service::CodecEvent;
use std::sync::mpsc::{self, Receiver, SyncSender};
use tracing::debug;

/// An event tagged with the engine instance that raised it.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub generation: u64,
    pub event: CodecEvent,
}

/// Sending side handed to the graph and its adapters.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: SyncSender<EngineEvent>,
    generation: u64,
}

impl EventEmitter {
    pub fn new(tx: SyncSender<EngineEvent>, generation: u64) -> Self {
        Self { tx, generation }
    }

    /// Bounded channel plus an emitter for generation 0.
    pub fn channel(capacity: usize) -> (Self, Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        (Self::new(tx, 0), rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Blocks while the queue is full.
    pub fn emit(&self, event: CodecEvent) {
        let event = EngineEvent {
            generation: self.generation,
            event,
        };
        if let Err(mpsc::SendError(dropped)) = self.tx.send(event) {
            debug!("Event receiver gone, dropping {:?}", dropped.event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_tags_generation() {
        let (tx, rx) = mpsc::sync_channel(4);
        let emitter = EventEmitter::new(tx, 7);
        emitter.emit(CodecEvent::InputBufferAvailable(3));
        let received = rx.recv().unwrap();
        assert_eq!(received.generation, 7);
        assert_eq!(received.event, CodecEvent::InputBufferAvailable(3));
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_silent() {
        let (emitter, rx) = EventEmitter::channel(1);
        drop(rx);
        emitter.emit(CodecEvent::InputBufferAvailable(0));
    }
}
