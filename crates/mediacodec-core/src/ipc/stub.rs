//! Server-side RPC endpoint for one codec session.
//!
//! Decodes each request parcel, runs the matching `CodecServer` call on the
//! blocking pool, and encodes the reply. The stub owns the server half of
//! the buffer handle caches.

use super::listener::ListenerProxy;
use super::parcel::{Parcel, ParcelReader};
use super::protocol::RequestCode;
use crate::buffer::SharedBuffer;
use crate::cache::{CacheFlag, Direction, StubBufferCache};
use crate::config::IpcConfig;
use crate::error::{CodecError, ErrorKind, Result};
use crate::server::CodecServer;
use crate::service::CodecCallback;
use crate::types::{BufferFlag, BufferIndex, CodecKind, SurfaceHandle};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct StubCaches {
    input: StubBufferCache,
    output: StubBufferCache,
}

impl StubCaches {
    fn new() -> Self {
        Self {
            input: StubBufferCache::new(Direction::Input),
            output: StubBufferCache::new(Direction::Output),
        }
    }
}

/// A reply ready for the wire: status code plus body.
#[derive(Debug)]
pub struct StubReply {
    pub status: i32,
    pub body: Bytes,
}

impl StubReply {
    fn ok(body: Parcel) -> Self {
        Self {
            status: 0,
            body: body.freeze(),
        }
    }

    fn error(err: &CodecError) -> Self {
        let mut body = Parcel::new();
        body.write_string(&err.to_string());
        Self {
            status: err.kind().status_code(),
            body: body.freeze(),
        }
    }
}

pub struct CodecServiceStub {
    server: Arc<CodecServer>,
    frames: mpsc::UnboundedSender<Bytes>,
    caches: Mutex<Option<StubCaches>>,
    /// Bumped whenever the caches are installed or dropped.
    cache_generation: AtomicU64,
    destroyed: AtomicBool,
}

impl CodecServiceStub {
    /// `frames` is the connection's outbound queue, used for listener events.
    pub fn new(server: Arc<CodecServer>, frames: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            server,
            frames,
            caches: Mutex::new(None),
            cache_generation: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn server(&self) -> &Arc<CodecServer> {
        &self.server
    }

    /// Entry count of the input and output caches, if allocated.
    pub fn cached_handles(&self) -> Option<(usize, usize)> {
        self.caches
            .lock()
            .expect("stub cache lock poisoned")
            .as_ref()
            .map(|c| (c.input.len(), c.output.len()))
    }

    fn set_caches(&self, caches: Option<StubCaches>) {
        let mut guard = self.caches.lock().expect("stub cache lock poisoned");
        *guard = caches;
        self.cache_generation.fetch_add(1, Ordering::SeqCst);
    }

    fn cache_generation(&self) -> u64 {
        self.cache_generation.load(Ordering::SeqCst)
    }

    /// Record a looked-up buffer in the reply. A buffer looked up before the
    /// caches were replaced (`generation` is stale) goes out as INVALIDATE.
    fn write_buffer(
        &self,
        direction: Direction,
        generation: u64,
        index: BufferIndex,
        buffer: Option<SharedBuffer>,
        reply: &mut Parcel,
    ) -> Result<CacheFlag> {
        let mut guard = self.caches.lock().expect("stub cache lock poisoned");
        let caches = guard.as_mut().ok_or_else(|| {
            CodecError::not_permitted(&format!("get_{}_buffer", direction), "no buffer cache")
        })?;
        let cache = match direction {
            Direction::Input => &mut caches.input,
            Direction::Output => &mut caches.output,
        };
        let buffer = if self.cache_generation() == generation {
            buffer
        } else {
            debug!("Dropping {} buffer {} looked up before a cache reset", direction, index);
            None
        };
        Ok(cache.write_to_parcel(index, buffer.as_ref(), reply))
    }

    /// Handle one request and produce its reply.
    pub async fn on_remote_request(&self, code: u32, args: Bytes) -> StubReply {
        let mut data = ParcelReader::new(args);
        if let Err(e) = data.enforce_interface(IpcConfig::SERVICE_DESCRIPTOR) {
            warn!("Rejecting request {}: {}", code, e);
            return StubReply::error(&CodecError::invalid_value(e.to_string()));
        }
        let Some(request) = RequestCode::from_u32(code) else {
            warn!("Unknown request code {}", code);
            return StubReply::error(&CodecError::unsupported(format!(
                "unknown request code {}",
                code
            )));
        };
        if self.destroyed.load(Ordering::SeqCst) {
            return StubReply::error(&CodecError::no_memory("codec stub destroyed"));
        }

        debug!("Session {}: {}", self.server.session_id(), request);
        match self.dispatch(request, data).await {
            Ok(reply) => StubReply::ok(reply),
            Err(e) => {
                debug!("Session {}: {} failed: {}", self.server.session_id(), request, e);
                StubReply::error(&e)
            }
        }
    }

    /// Run a server call on the blocking pool; state waits may block.
    async fn blocking<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&CodecServer) -> Result<T> + Send + 'static,
    {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || call(&server))
            .await
            .map_err(|e| CodecError::Unknown(format!("server task failed: {}", e)))?
    }

    async fn dispatch(&self, request: RequestCode, mut data: ParcelReader) -> Result<Parcel> {
        let mut reply = Parcel::new();
        match request {
            RequestCode::SetListenerObject => {
                let listener: Arc<dyn CodecCallback> = Arc::new(ListenerProxy::new(self.frames.clone()));
                self.blocking(move |server| server.set_callback(listener))
                    .await?;
            }
            RequestCode::InitParameter => {
                let kind = CodecKind::from_wire(data.read_i32()?)?;
                let by_mime = data.read_bool()?;
                let name = data.read_string()?;
                self.blocking(move |server| server.init_parameter(kind, by_mime, &name))
                    .await?;
            }
            RequestCode::Configure => {
                let format = data.read_format()?;
                self.blocking(move |server| server.configure(&format)).await?;
            }
            RequestCode::Prepare => {
                self.blocking(|server| server.prepare()).await?;
                self.set_caches(Some(StubCaches::new()));
            }
            RequestCode::Start => self.blocking(|server| server.start()).await?,
            RequestCode::Stop => self.blocking(|server| server.stop()).await?,
            RequestCode::Flush => {
                self.blocking(|server| server.flush()).await?;
                if let Some(caches) = self.caches.lock().expect("stub cache lock poisoned").as_mut() {
                    caches.input.clear();
                    caches.output.clear();
                }
            }
            RequestCode::Reset => {
                self.set_caches(None);
                self.blocking(|server| server.reset()).await?;
            }
            RequestCode::Release => {
                self.set_caches(None);
                self.blocking(|server| {
                    server.release();
                    Ok(())
                })
                .await?;
            }
            RequestCode::NotifyEos => self.blocking(|server| server.notify_eos()).await?,
            RequestCode::CreateInputSurface => {
                let handle = self.blocking(|server| server.create_input_surface()).await?;
                reply.write_u64(handle.0);
            }
            RequestCode::SetOutputSurface => {
                let handle = SurfaceHandle(data.read_u64()?);
                self.blocking(move |server| server.set_output_surface(handle))
                    .await?;
            }
            RequestCode::GetInputBuffer => {
                let index = data.read_u32()?;
                let generation = self.cache_generation();
                let buffer = self
                    .blocking(move |server| server.get_input_buffer(index))
                    .await?;
                self.write_buffer(Direction::Input, generation, index, buffer, &mut reply)?;
            }
            RequestCode::QueueInputBuffer => {
                let index = data.read_u32()?;
                let info = data.read_buffer_info()?;
                let flag = BufferFlag::from_bits(data.read_u32()?)?;
                self.blocking(move |server| server.queue_input_buffer(index, info, flag))
                    .await?;
            }
            RequestCode::GetOutputBuffer => {
                let index = data.read_u32()?;
                let generation = self.cache_generation();
                let buffer = self
                    .blocking(move |server| server.get_output_buffer(index))
                    .await?;
                self.write_buffer(Direction::Output, generation, index, buffer, &mut reply)?;
            }
            RequestCode::GetOutputFormat => {
                let format = self.blocking(|server| server.get_output_format()).await?;
                reply.write_format(&format);
            }
            RequestCode::ReleaseOutputBuffer => {
                let index = data.read_u32()?;
                let render = data.read_bool()?;
                self.blocking(move |server| server.release_output_buffer(index, render))
                    .await?;
            }
            RequestCode::SetParameter => {
                let params = data.read_format()?;
                self.blocking(move |server| server.set_parameter(&params))
                    .await?;
            }
            RequestCode::DestroyStub => self.destroy().await,
        }
        Ok(reply)
    }

    /// Release the server and refuse further requests. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_caches(None);
        let result = self
            .blocking(|server| {
                server.release();
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!("Session {}: release on destroy failed: {}", self.server.session_id(), e);
        }
        debug!("Session {}: stub destroyed", self.server.session_id());
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Status carried by a reply, decoded.
pub fn reply_error(status: i32, body: Bytes) -> CodecError {
    let message = ParcelReader::new(body)
        .read_string()
        .unwrap_or_else(|_| format!("remote status {}", status));
    CodecError::from_remote(ErrorKind::from_status_code(status), message)
}
