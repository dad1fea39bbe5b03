//! Client handle for one remote codec session.
//!
//! # Example
//!
//! ```rust,ignore
//! use mediacodec_core::{CodecClient, CodecKind, CodecService};
//!
//! let client = CodecClient::connect(addr).await?;
//! client.set_callback(callback).await?;
//! client.init_parameter(CodecKind::AudioDecoder, true, "audio/mp4a-latm").await?;
//! client.configure(&format).await?;
//! client.prepare().await?;
//! client.start().await?;
//! ```

use crate::buffer::SharedBuffer;
use crate::error::{CodecError, Result};
use crate::format::Format;
use crate::ipc::{CallbackSlot, CodecServiceProxy, IpcClient, ListenerStub};
use crate::service::{CodecCallback, CodecService};
use crate::types::{BufferFlag, BufferIndex, BufferInfo, CodecKind, SurfaceHandle};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A codec session hosted by a remote codec server.
///
/// Owns the proxy and the listener stub for its connection. Once the
/// connection is lost, every call fails with `ServiceDied` and the installed
/// callback receives one `on_error(ServiceDied)`.
pub struct CodecClient {
    proxy: CodecServiceProxy,
    slot: Arc<CallbackSlot>,
    configured: AtomicBool,
    released: AtomicBool,
}

impl CodecClient {
    /// Connect to a codec server and register the listener object.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = IpcClient::connect(addr, events_tx).await?;
        let slot = Arc::new(CallbackSlot::new());
        let listener = ListenerStub::spawn(events_rx, slot.clone());

        let proxy = CodecServiceProxy::new(client);
        if let Err(e) = proxy.set_listener_object().await {
            listener.abort();
            return Err(e);
        }

        info!("Connected to codec service at {}", addr);
        Ok(Self {
            proxy,
            slot,
            configured: AtomicBool::new(false),
            released: AtomicBool::new(false),
        })
    }

    /// Whether the remote session is still reachable.
    pub fn is_alive(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && self.proxy.client().is_alive()
    }

    /// Entry count of the local input and output handle caches, if allocated.
    pub fn cached_handles(&self) -> Option<(usize, usize)> {
        self.proxy.cached_handles()
    }

    fn check(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(CodecError::no_memory("codec client released"));
        }
        if !self.proxy.client().is_alive() {
            return Err(CodecError::ServiceDied);
        }
        Ok(())
    }
}

#[async_trait]
impl CodecService for CodecClient {
    async fn init_parameter(&self, kind: CodecKind, by_mime: bool, name: &str) -> Result<()> {
        self.check()?;
        if name.is_empty() {
            return Err(CodecError::invalid_value("codec name is empty"));
        }
        self.proxy.init_parameter(kind, by_mime, name).await
    }

    async fn set_callback(&self, callback: Arc<dyn CodecCallback>) -> Result<()> {
        self.check()?;
        if self.configured.load(Ordering::SeqCst) {
            return Err(CodecError::not_permitted("set_callback", "already configured"));
        }
        self.slot.install(callback)
    }

    async fn configure(&self, format: &Format) -> Result<()> {
        self.check()?;
        if format.is_empty() {
            return Err(CodecError::invalid_value("format is empty"));
        }
        self.proxy.configure(format).await?;
        self.configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_input_surface(&self) -> Result<SurfaceHandle> {
        self.check()?;
        self.proxy.create_input_surface().await
    }

    async fn set_output_surface(&self, surface: SurfaceHandle) -> Result<()> {
        self.check()?;
        self.proxy.set_output_surface(surface).await
    }

    async fn prepare(&self) -> Result<()> {
        self.check()?;
        self.proxy.prepare().await
    }

    async fn start(&self) -> Result<()> {
        self.check()?;
        self.proxy.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.check()?;
        self.proxy.stop().await
    }

    async fn flush(&self) -> Result<()> {
        self.check()?;
        self.proxy.flush().await
    }

    async fn reset(&self) -> Result<()> {
        self.check()?;
        self.proxy.reset().await
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!("Codec client already released");
            return;
        }
        // Our own disconnect is not a service death
        self.slot.close();

        if self.proxy.client().is_alive() {
            if let Err(e) = self.proxy.release().await {
                warn!("Remote release failed: {}", e);
            }
            if let Err(e) = self.proxy.destroy_stub().await {
                warn!("Destroying remote stub failed: {}", e);
            }
        }
        self.proxy.client().close();
        info!("Codec client released");
    }

    async fn notify_eos(&self) -> Result<()> {
        self.check()?;
        self.proxy.notify_eos().await
    }

    async fn get_input_buffer(&self, index: BufferIndex) -> Result<SharedBuffer> {
        self.check()?;
        self.proxy.get_input_buffer(index).await
    }

    async fn queue_input_buffer(
        &self,
        index: BufferIndex,
        info: BufferInfo,
        flag: BufferFlag,
    ) -> Result<()> {
        self.check()?;
        if info.size < 0 || info.offset < 0 {
            return Err(CodecError::invalid_value(format!(
                "negative buffer range: offset {}, size {}",
                info.offset, info.size
            )));
        }
        self.proxy.queue_input_buffer(index, info, flag).await
    }

    async fn get_output_buffer(&self, index: BufferIndex) -> Result<SharedBuffer> {
        self.check()?;
        self.proxy.get_output_buffer(index).await
    }

    async fn release_output_buffer(&self, index: BufferIndex, render: bool) -> Result<()> {
        self.check()?;
        self.proxy.release_output_buffer(index, render).await
    }

    async fn get_output_format(&self) -> Result<Format> {
        self.check()?;
        self.proxy.get_output_format().await
    }

    async fn set_parameter(&self, params: &Format) -> Result<()> {
        self.check()?;
        if params.is_empty() {
            return Err(CodecError::invalid_value("parameters are empty"));
        }
        self.proxy.set_parameter(params).await
    }
}

impl Drop for CodecClient {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.slot.close();
            if let Err(e) = self.proxy.post_destroy_stub() {
                debug!("DestroyStub on drop not sent: {}", e);
            }
            self.proxy.client().close();
        }
    }
}
