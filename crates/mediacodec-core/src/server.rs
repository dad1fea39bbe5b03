//! Codec server: one pipeline engine behind the lifecycle state machine.
//!
//! Control calls are serialized by the session mutex. Engine events travel
//! over a bounded channel to a dispatcher thread that never takes the
//! session lock; an asynchronous error is parked in `pending_error` and
//! folded into the state by the next call that does hold the lock.

use crate::buffer::SharedBuffer;
use crate::config::EngineConfig;
use crate::engine::{
    CodecRegistry, EngineEvent, EventEmitter, InMemorySurfaceProvider, PipelineEngine,
    StateWaiter, SurfaceProvider,
};
use crate::error::{CodecError, ErrorKind, Result};
use crate::format::Format;
use crate::service::{CodecCallback, CodecEvent};
use crate::types::{BufferFlag, BufferIndex, BufferInfo, CodecKind, CodecState, SurfaceHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything a server needs, passed explicitly at construction.
#[derive(Clone)]
pub struct ServerOptions {
    pub engine: EngineConfig,
    pub registry: Arc<CodecRegistry>,
    pub surfaces: Arc<dyn SurfaceProvider>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            registry: Arc::new(CodecRegistry::with_defaults()),
            surfaces: Arc::new(InMemorySurfaceProvider::new()),
        }
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("engine", &self.engine)
            .field("codecs", &self.registry.descriptors().len())
            .finish()
    }
}

struct Session {
    state: CodecState,
    kind: Option<CodecKind>,
    engine: Option<PipelineEngine>,
}

/// State shared with the dispatcher thread.
struct Shared {
    id: Uuid,
    generation: AtomicU64,
    pending_error: Mutex<Option<(u64, ErrorKind)>>,
    callback: Mutex<Option<Arc<dyn CodecCallback>>>,
}

impl Shared {
    fn callback(&self) -> Option<Arc<dyn CodecCallback>> {
        self.callback.lock().expect("callback lock poisoned").clone()
    }
}

/// Server side of one codec session.
pub struct CodecServer {
    options: ServerOptions,
    session: Mutex<Session>,
    waiter: Arc<StateWaiter>,
    events: SyncSender<EngineEvent>,
    shared: Arc<Shared>,
    released: AtomicBool,
}

impl CodecServer {
    pub fn new(options: ServerOptions) -> Result<Self> {
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            generation: AtomicU64::new(0),
            pending_error: Mutex::new(None),
            callback: Mutex::new(None),
        });
        let (events, rx) = mpsc::sync_channel(options.engine.event_queue_capacity.max(1));

        let dispatcher_shared = shared.clone();
        std::thread::Builder::new()
            .name(format!("codec-events-{}", &shared.id.simple().to_string()[..8]))
            .spawn(move || dispatch_events(rx, dispatcher_shared))?;

        info!("Session {} created", shared.id);
        Ok(Self {
            options,
            session: Mutex::new(Session {
                state: CodecState::Uninitialized,
                kind: None,
                engine: None,
            }),
            waiter: Arc::new(StateWaiter::new()),
            events,
            shared,
            released: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.id
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Current lifecycle state, including any error raised asynchronously.
    pub fn state(&self) -> CodecState {
        let mut session = self.lock();
        self.absorb_pending_error(&mut session);
        session.state
    }

    pub fn kind(&self) -> Option<CodecKind> {
        self.lock().kind
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().expect("session lock poisoned")
    }

    /// Lock the session for `operation`, rejecting it unless the state is in `legal`.
    fn enter(&self, operation: &str, legal: &[CodecState]) -> Result<MutexGuard<'_, Session>> {
        if self.released.load(Ordering::SeqCst) {
            return Err(CodecError::no_memory("codec session has been released"));
        }
        let mut session = self.lock();
        self.absorb_pending_error(&mut session);
        if session.state == CodecState::Error || !legal.contains(&session.state) {
            debug!(
                "Session {}: {} rejected in {}",
                self.shared.id, operation, session.state
            );
            return Err(CodecError::not_permitted(operation, session.state));
        }
        Ok(session)
    }

    fn absorb_pending_error(&self, session: &mut Session) {
        let pending = self
            .shared
            .pending_error
            .lock()
            .expect("pending error lock poisoned")
            .take();
        if let Some((generation, kind)) = pending {
            if generation == self.shared.generation.load(Ordering::SeqCst)
                && session.state != CodecState::Uninitialized
            {
                self.transition(session, CodecState::Error);
                warn!("Session {}: engine reported {}", self.shared.id, kind);
            }
        }
    }

    fn transition(&self, session: &mut Session, state: CodecState) {
        if session.state != state {
            info!("Session {}: {} -> {}", self.shared.id, session.state, state);
            session.state = state;
        }
    }

    /// Move to `Error` when a lifecycle call fails inside the engine.
    fn lifecycle_failure(&self, session: &mut Session, operation: &str, err: CodecError) -> CodecError {
        match err.kind() {
            ErrorKind::InvalidValue | ErrorKind::OperateNotPermit => {}
            _ => {
                error!("Session {}: {} failed: {}", self.shared.id, operation, err);
                self.transition(session, CodecState::Error);
            }
        }
        err
    }

    fn engine<'a>(session: &'a mut Session, operation: &str) -> Result<&'a mut PipelineEngine> {
        let state = session.state;
        session
            .engine
            .as_mut()
            .ok_or_else(|| CodecError::not_permitted(operation, state))
    }

    pub fn init_parameter(&self, kind: CodecKind, by_mime: bool, name: &str) -> Result<()> {
        let mut session = self.enter("init_parameter", &[CodecState::Uninitialized])?;
        let generation = self.shared.generation.load(Ordering::SeqCst);
        let engine = PipelineEngine::init(
            kind,
            by_mime,
            name,
            &self.options.registry,
            self.options.engine.clone(),
            self.options.surfaces.clone(),
            self.waiter.clone(),
            EventEmitter::new(self.events.clone(), generation),
        )?;
        session.engine = Some(engine);
        session.kind = Some(kind);
        self.transition(&mut session, CodecState::Initialized);
        Ok(())
    }

    pub fn set_callback(&self, callback: Arc<dyn CodecCallback>) -> Result<()> {
        let _session = self.enter(
            "set_callback",
            &[CodecState::Uninitialized, CodecState::Initialized],
        )?;
        let mut slot = self.shared.callback.lock().expect("callback lock poisoned");
        if slot.is_some() {
            return Err(CodecError::not_permitted("set_callback", "callback already set"));
        }
        *slot = Some(callback);
        debug!("Session {}: callback installed", self.shared.id);
        Ok(())
    }

    pub fn configure(&self, format: &Format) -> Result<()> {
        let mut session = self.enter("configure", &[CodecState::Initialized])?;
        Self::engine(&mut session, "configure")?.configure(format)?;
        self.transition(&mut session, CodecState::Configured);
        Ok(())
    }

    pub fn create_input_surface(&self) -> Result<SurfaceHandle> {
        let mut session = self.enter("create_input_surface", &[CodecState::Configured])?;
        Self::engine(&mut session, "create_input_surface")?.create_input_surface()
    }

    pub fn set_output_surface(&self, surface: SurfaceHandle) -> Result<()> {
        let mut session = self.enter("set_output_surface", &[CodecState::Configured])?;
        Self::engine(&mut session, "set_output_surface")?.set_output_surface(surface)
    }

    pub fn prepare(&self) -> Result<()> {
        let mut session = self.enter("prepare", &[CodecState::Configured])?;
        let result = Self::engine(&mut session, "prepare")?.prepare();
        match result {
            Ok(()) => {
                self.transition(&mut session, CodecState::Prepared);
                Ok(())
            }
            Err(e) => Err(self.lifecycle_failure(&mut session, "prepare", e)),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut session = self.enter("start", &[CodecState::Prepared, CodecState::Flushed])?;
        let result = Self::engine(&mut session, "start")?.start();
        match result {
            Ok(()) => {
                self.transition(&mut session, CodecState::Running);
                Ok(())
            }
            Err(e) => Err(self.lifecycle_failure(&mut session, "start", e)),
        }
    }

    pub fn stop(&self) -> Result<()> {
        let mut session = self.enter("stop", &[CodecState::Running, CodecState::EndOfStream])?;
        let result = Self::engine(&mut session, "stop")?.stop();
        match result {
            Ok(()) => {
                self.transition(&mut session, CodecState::Prepared);
                Ok(())
            }
            Err(e) => Err(self.lifecycle_failure(&mut session, "stop", e)),
        }
    }

    pub fn flush(&self) -> Result<()> {
        let mut session = self.enter("flush", &[CodecState::Running, CodecState::EndOfStream])?;
        let result = Self::engine(&mut session, "flush")?.flush();
        match result {
            Ok(()) => {
                self.transition(&mut session, CodecState::Flushed);
                Ok(())
            }
            Err(e) => Err(self.lifecycle_failure(&mut session, "flush", e)),
        }
    }

    pub fn notify_eos(&self) -> Result<()> {
        let mut session = self.enter("notify_eos", &[CodecState::Running])?;
        if !session.kind.is_some_and(CodecKind::is_encoder) {
            return Err(CodecError::not_permitted("notify_eos", "decoder session"));
        }
        let result = Self::engine(&mut session, "notify_eos")?.notify_eos();
        match result {
            Ok(()) => {
                self.transition(&mut session, CodecState::EndOfStream);
                Ok(())
            }
            Err(e) => Err(self.lifecycle_failure(&mut session, "notify_eos", e)),
        }
    }

    /// Tear down the engine and return to `Uninitialized`. Legal in any state.
    pub fn reset(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(CodecError::no_memory("codec session has been released"));
        }
        self.waiter.abort();
        let mut session = self.lock();
        self.teardown(&mut session);
        self.waiter.reset();
        Ok(())
    }

    /// Terminal teardown. Idempotent; unblocks any pending state wait.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.waiter.abort();
        let mut session = self.lock();
        self.teardown(&mut session);
        self.shared
            .callback
            .lock()
            .expect("callback lock poisoned")
            .take();
        info!("Session {} released", self.shared.id);
    }

    fn teardown(&self, session: &mut Session) {
        // Events from the old engine are stale from here on
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared
            .pending_error
            .lock()
            .expect("pending error lock poisoned")
            .take();
        if let Some(mut engine) = session.engine.take() {
            engine.release();
        }
        session.kind = None;
        self.transition(session, CodecState::Uninitialized);
    }

    pub fn get_input_buffer(&self, index: BufferIndex) -> Result<Option<SharedBuffer>> {
        let mut session = self.enter("get_input_buffer", &[CodecState::Running])?;
        Self::engine(&mut session, "get_input_buffer")?.get_input_buffer(index)
    }

    pub fn queue_input_buffer(
        &self,
        index: BufferIndex,
        info: BufferInfo,
        flag: BufferFlag,
    ) -> Result<()> {
        let mut session = self.enter("queue_input_buffer", &[CodecState::Running])?;
        Self::engine(&mut session, "queue_input_buffer")?.queue_input_buffer(index, info, flag)?;
        if flag.contains(BufferFlag::EOS) {
            self.transition(&mut session, CodecState::EndOfStream);
        }
        Ok(())
    }

    pub fn get_output_buffer(&self, index: BufferIndex) -> Result<Option<SharedBuffer>> {
        let mut session = self.enter(
            "get_output_buffer",
            &[CodecState::Running, CodecState::EndOfStream],
        )?;
        Self::engine(&mut session, "get_output_buffer")?.get_output_buffer(index)
    }

    pub fn release_output_buffer(&self, index: BufferIndex, render: bool) -> Result<()> {
        let mut session = self.enter(
            "release_output_buffer",
            &[CodecState::Running, CodecState::EndOfStream],
        )?;
        Self::engine(&mut session, "release_output_buffer")?.release_output_buffer(index, render)
    }

    pub fn get_output_format(&self) -> Result<Format> {
        let mut session = self.enter(
            "get_output_format",
            &[
                CodecState::Initialized,
                CodecState::Configured,
                CodecState::Prepared,
                CodecState::Running,
                CodecState::Flushed,
                CodecState::EndOfStream,
            ],
        )?;
        Ok(Self::engine(&mut session, "get_output_format")?.get_output_format())
    }

    pub fn set_parameter(&self, params: &Format) -> Result<()> {
        let mut session = self.enter(
            "set_parameter",
            &[
                CodecState::Prepared,
                CodecState::Running,
                CodecState::Flushed,
                CodecState::EndOfStream,
            ],
        )?;
        if params.is_empty() {
            return Err(CodecError::invalid_value("set_parameter with no keys"));
        }
        Self::engine(&mut session, "set_parameter")?.set_parameter(params)
    }
}

impl Drop for CodecServer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Dispatcher loop: one per server, exits when every emitter is gone.
fn dispatch_events(rx: Receiver<EngineEvent>, shared: Arc<Shared>) {
    while let Ok(EngineEvent { generation, event }) = rx.recv() {
        if generation != shared.generation.load(Ordering::SeqCst) {
            debug!("Session {}: dropping stale {:?}", shared.id, event);
            continue;
        }
        if let CodecEvent::Error(kind) = event {
            *shared
                .pending_error
                .lock()
                .expect("pending error lock poisoned") = Some((generation, kind));
        }
        match shared.callback() {
            Some(callback) => event.dispatch(callback.as_ref()),
            None => debug!("Session {}: no callback for {:?}", shared.id, event),
        }
    }
    debug!("Session {}: event dispatcher exiting", shared.id);
}
