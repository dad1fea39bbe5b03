//! The element graph and its execution thread.
//!
//! The graph runs on a dedicated thread fed by a command queue. State
//! changes are asynchronous: the control side sends a command, then blocks
//! on a [`StateWaiter`] until the graph's bus reports the new state, the
//! transition fails, the wait is aborted, or the timeout elapses.
//!
//! Buffers carry the flush epoch they were queued in. A flush bumps the
//! epoch, so anything queued before it is discarded by the graph thread
//! instead of reaching the sink.

use super::element::{CodecElement, ElementOutput, Sample};
use super::events::EventEmitter;
use super::processor::PortPair;
use super::sink::Sink;
use super::source::Source;
use crate::error::{CodecError, ErrorKind, Result};
use crate::format::Format;
use crate::service::CodecEvent;
use crate::types::BufferIndex;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Graph-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Null,
    Ready,
    Playing,
}

impl std::fmt::Display for GraphState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphState::Null => write!(f, "NULL"),
            GraphState::Ready => write!(f, "READY"),
            GraphState::Playing => write!(f, "PLAYING"),
        }
    }
}

#[derive(Debug)]
struct WaitState {
    current: GraphState,
    failure: Option<String>,
    aborted: bool,
}

/// Condition variable the control thread blocks on during state changes.
#[derive(Debug)]
pub struct StateWaiter {
    state: Mutex<WaitState>,
    changed: Condvar,
}

impl Default for StateWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl StateWaiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WaitState {
                current: GraphState::Null,
                failure: None,
                aborted: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WaitState> {
        self.state.lock().expect("state waiter lock poisoned")
    }

    pub fn current(&self) -> GraphState {
        self.lock().current
    }

    pub fn notify_state(&self, state: GraphState) {
        self.lock().current = state;
        self.changed.notify_all();
    }

    pub fn notify_failure(&self, message: impl Into<String>) {
        self.lock().failure = Some(message.into());
        self.changed.notify_all();
    }

    /// Wake every waiter with a forced failure. Sticky until `reset`.
    pub fn abort(&self) {
        self.lock().aborted = true;
        self.changed.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Prepare for a fresh graph.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.current = GraphState::Null;
        state.failure = None;
        state.aborted = false;
    }

    fn begin_transition(&self) {
        self.lock().failure = None;
    }

    /// Block until the graph reports `target`.
    pub fn wait_for(&self, target: GraphState, timeout: Duration) -> Result<()> {
        let guard = self.lock();
        let (mut guard, result) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| {
                s.current != target && s.failure.is_none() && !s.aborted
            })
            .expect("state waiter lock poisoned");

        if guard.aborted {
            return Err(CodecError::not_permitted("state change", "aborted"));
        }
        if let Some(message) = guard.failure.take() {
            return Err(CodecError::Unknown(format!(
                "transition to {} failed: {}",
                target, message
            )));
        }
        if result.timed_out() && guard.current != target {
            return Err(CodecError::Timeout(timeout));
        }
        Ok(())
    }
}

pub(crate) enum GraphCommand {
    Link {
        source: Arc<Source>,
        sink: Arc<Sink>,
        ports: PortPair,
    },
    SetState(GraphState),
    Buffer {
        sample: Sample,
        origin: Option<BufferIndex>,
        epoch: u64,
    },
    CodecData(Bytes),
    Eos {
        epoch: u64,
    },
    FlushStart,
    FlushStop,
    SetParameter(Format),
    Shutdown,
}

fn graph_gone() -> CodecError {
    CodecError::Unknown("graph thread stopped".to_string())
}

/// Handle for pushing media into the graph from a source adapter.
#[derive(Clone)]
pub struct GraphFeeder {
    commands: Sender<GraphCommand>,
    epoch: Arc<AtomicU64>,
}

impl GraphFeeder {
    pub fn push(&self, sample: Sample, origin: Option<BufferIndex>) -> Result<()> {
        let epoch = self.epoch();
        self.commands
            .send(GraphCommand::Buffer {
                sample,
                origin,
                epoch,
            })
            .map_err(|_| graph_gone())
    }

    pub fn push_codec_data(&self, data: Bytes) -> Result<()> {
        self.commands
            .send(GraphCommand::CodecData(data))
            .map_err(|_| graph_gone())
    }

    pub fn push_eos(&self) -> Result<()> {
        let epoch = self.epoch();
        self.commands
            .send(GraphCommand::Eos { epoch })
            .map_err(|_| graph_gone())
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for GraphFeeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphFeeder")
            .field("epoch", &self.epoch())
            .finish()
    }
}

/// Messages the graph thread raises about itself.
#[derive(Debug)]
enum BusMessage {
    StateChanged { old: GraphState, new: GraphState },
    TransitionFailed(String),
    Error { kind: ErrorKind, message: String },
}

/// Control-side handle to a running graph.
pub struct Graph {
    name: String,
    commands: Sender<GraphCommand>,
    waiter: Arc<StateWaiter>,
    epoch: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl Graph {
    /// Spawn the execution thread around `element`.
    pub fn spawn(
        element: Box<dyn CodecElement>,
        waiter: Arc<StateWaiter>,
        emitter: EventEmitter,
    ) -> Result<Self> {
        let name = element.name().to_string();
        let (commands, rx) = mpsc::channel();
        let epoch = Arc::new(AtomicU64::new(0));

        let worker = GraphWorker {
            element,
            waiter: waiter.clone(),
            emitter,
            epoch: epoch.clone(),
            state: GraphState::Null,
            source: None,
            sink: None,
            link_error: None,
            flushing: false,
        };
        let handle = std::thread::Builder::new()
            .name(format!("graph-{}", name))
            .spawn(move || worker.run(rx))?;

        debug!("Graph {} spawned", name);
        Ok(Self {
            name,
            commands,
            waiter,
            epoch,
            worker: Some(handle),
        })
    }

    fn send(&self, command: GraphCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| graph_gone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach the adapters and negotiate ports on the codec node.
    pub fn link(&self, source: Arc<Source>, sink: Arc<Sink>, ports: PortPair) -> Result<()> {
        self.send(GraphCommand::Link {
            source,
            sink,
            ports,
        })
    }

    /// Request `target` and block until the graph reaches it.
    pub fn set_state(&self, target: GraphState, timeout: Duration) -> Result<()> {
        self.waiter.begin_transition();
        self.send(GraphCommand::SetState(target))?;
        self.waiter.wait_for(target, timeout)
    }

    pub fn state(&self) -> GraphState {
        self.waiter.current()
    }

    pub fn feeder(&self) -> GraphFeeder {
        GraphFeeder {
            commands: self.commands.clone(),
            epoch: self.epoch.clone(),
        }
    }

    /// Invalidate everything queued so far. Returns the new epoch.
    pub fn begin_flush(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Broadcast flush-start and flush-stop through the graph.
    pub fn send_flush_events(&self) -> Result<()> {
        self.send(GraphCommand::FlushStart)?;
        self.send(GraphCommand::FlushStop)
    }

    pub fn send_eos(&self) -> Result<()> {
        self.feeder().push_eos()
    }

    pub fn set_parameter(&self, params: Format) -> Result<()> {
        self.send(GraphCommand::SetParameter(params))
    }

    /// Stop the execution thread and wait for it to exit.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = self.commands.send(GraphCommand::Shutdown);
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Graph {} thread panicked", self.name);
            }
            debug!("Graph {} shut down", self.name);
        }
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct GraphWorker {
    element: Box<dyn CodecElement>,
    waiter: Arc<StateWaiter>,
    emitter: EventEmitter,
    epoch: Arc<AtomicU64>,
    state: GraphState,
    source: Option<Arc<Source>>,
    sink: Option<Arc<Sink>>,
    link_error: Option<String>,
    flushing: bool,
}

impl GraphWorker {
    fn run(mut self, commands: Receiver<GraphCommand>) {
        while let Ok(command) = commands.recv() {
            match command {
                GraphCommand::Shutdown => break,
                GraphCommand::Link {
                    source,
                    sink,
                    ports,
                } => {
                    self.link_error = self
                        .element
                        .configure(&ports.input, &ports.output)
                        .err()
                        .map(|e| e.to_string());
                    self.source = Some(source);
                    self.sink = Some(sink);
                }
                GraphCommand::SetState(target) => self.change_state(target),
                GraphCommand::Buffer {
                    sample,
                    origin,
                    epoch,
                } => self.handle_buffer(sample, origin, epoch),
                GraphCommand::CodecData(data) => {
                    if let Err(e) = self.element.set_codec_data(data) {
                        self.post(BusMessage::Error {
                            kind: e.domain.to_error_kind(),
                            message: e.to_string(),
                        });
                    }
                }
                GraphCommand::Eos { epoch } => self.handle_eos(epoch),
                GraphCommand::FlushStart => {
                    self.flushing = true;
                    self.element.flush();
                }
                GraphCommand::FlushStop => self.flushing = false,
                GraphCommand::SetParameter(params) => {
                    if let Err(e) = self.element.set_parameter(&params) {
                        self.post(BusMessage::Error {
                            kind: e.domain.to_error_kind(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
        self.source = None;
        self.sink = None;
        debug!("Graph thread for {} exiting", self.element.name());
    }

    /// Bus handler: runs on the graph thread for every message it raises.
    fn post(&self, message: BusMessage) {
        match message {
            BusMessage::StateChanged { old, new } => {
                debug!("{}: {} -> {}", self.element.name(), old, new);
                self.waiter.notify_state(new);
            }
            BusMessage::TransitionFailed(reason) => {
                warn!("{}: state change failed: {}", self.element.name(), reason);
                self.waiter.notify_failure(reason);
            }
            BusMessage::Error { kind, message } => {
                error!("{}: {} ({})", self.element.name(), message, kind);
                self.emitter.emit(CodecEvent::Error(kind));
            }
        }
    }

    fn change_state(&mut self, target: GraphState) {
        if target != GraphState::Null {
            if self.source.is_none() || self.sink.is_none() {
                self.post(BusMessage::TransitionFailed("graph is not linked".into()));
                return;
            }
            if let Some(reason) = self.link_error.clone() {
                self.post(BusMessage::TransitionFailed(reason));
                return;
            }
        }
        let old = self.state;
        self.state = target;
        if target == GraphState::Null {
            self.source = None;
            self.sink = None;
        }
        self.post(BusMessage::StateChanged { old, new: target });
    }

    fn is_current(&self, epoch: u64) -> bool {
        !self.flushing && epoch == self.epoch.load(Ordering::SeqCst)
    }

    fn handle_buffer(&mut self, sample: Sample, origin: Option<BufferIndex>, epoch: u64) {
        if !self.is_current(epoch) {
            debug!("{}: discarding flushed buffer", self.element.name());
            return;
        }
        if self.state != GraphState::Playing {
            warn!(
                "{}: dropping buffer received in {}",
                self.element.name(),
                self.state
            );
        } else {
            match self.element.process(sample) {
                Ok(outputs) => self.render(outputs, epoch),
                Err(e) => self.post(BusMessage::Error {
                    kind: e.domain.to_error_kind(),
                    message: e.to_string(),
                }),
            }
        }
        if let (Some(index), Some(source)) = (origin, &self.source) {
            source.input_consumed(index, epoch);
        }
    }

    fn handle_eos(&mut self, epoch: u64) {
        if !self.is_current(epoch) {
            debug!("{}: discarding flushed end of stream", self.element.name());
            return;
        }
        match self.element.drain() {
            Ok(outputs) => self.render(outputs, epoch),
            Err(e) => self.post(BusMessage::Error {
                kind: e.domain.to_error_kind(),
                message: e.to_string(),
            }),
        }
        if let Some(sink) = &self.sink {
            sink.render_eos();
        }
    }

    fn render(&self, outputs: Vec<ElementOutput>, epoch: u64) {
        let Some(sink) = &self.sink else {
            return;
        };
        for output in outputs {
            if !self.is_current(epoch) {
                return;
            }
            if let Err(e) = sink.render(output) {
                self.post(BusMessage::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wait_returns_once_state_reached() {
        let waiter = Arc::new(StateWaiter::new());
        let notifier = waiter.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify_state(GraphState::Ready);
        });
        waiter
            .wait_for(GraphState::Ready, Duration::from_secs(5))
            .unwrap();
        t.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let waiter = StateWaiter::new();
        let started = Instant::now();
        let err = waiter
            .wait_for(GraphState::Playing, Duration::from_millis(30))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_abort_unblocks_waiter() {
        let waiter = Arc::new(StateWaiter::new());
        let aborter = waiter.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            aborter.abort();
        });
        let err = waiter
            .wait_for(GraphState::Ready, Duration::from_secs(10))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperateNotPermit);
        t.join().unwrap();

        waiter.reset();
        assert!(!waiter.is_aborted());
    }

    #[test]
    fn test_failure_reported_to_waiter() {
        let waiter = StateWaiter::new();
        waiter.notify_failure("not linked");
        let err = waiter
            .wait_for(GraphState::Ready, Duration::from_secs(1))
            .unwrap_err();
        assert!(err.to_string().contains("not linked"));
    }

    #[test]
    fn test_unlinked_graph_refuses_ready() {
        let waiter = Arc::new(StateWaiter::new());
        let (emitter, _rx) = EventEmitter::channel(8);
        let mut graph = Graph::spawn(
            Box::new(super::super::element::PassthroughElement::new("unlinked")),
            waiter,
            emitter,
        )
        .unwrap();

        let err = graph
            .set_state(GraphState::Ready, Duration::from_secs(1))
            .unwrap_err();
        assert!(err.to_string().contains("not linked"));
        assert_eq!(graph.state(), GraphState::Null);
        graph.shutdown();
    }

    #[test]
    fn test_flush_bumps_epoch() {
        let waiter = Arc::new(StateWaiter::new());
        let (emitter, _rx) = EventEmitter::channel(8);
        let graph = Graph::spawn(
            Box::new(super::super::element::PassthroughElement::new("epoch")),
            waiter,
            emitter,
        )
        .unwrap();
        let feeder = graph.feeder();
        assert_eq!(feeder.epoch(), 0);
        assert_eq!(graph.begin_flush(), 1);
        assert_eq!(feeder.epoch(), 1);
    }
}
