//! Client-side RPC endpoint: one method per remote codec operation.

use super::client::IpcClient;
use super::parcel::{Parcel, ParcelReader};
use super::protocol::RequestCode;
use super::stub::reply_error;
use crate::buffer::SharedBuffer;
use crate::cache::{Direction, ProxyBufferCache};
use crate::config::IpcConfig;
use crate::error::{CodecError, Result};
use crate::format::Format;
use crate::types::{BufferFlag, BufferIndex, BufferInfo, CodecKind, SurfaceHandle};
use std::sync::Mutex;
use tracing::debug;

struct ProxyCaches {
    input: ProxyBufferCache,
    output: ProxyBufferCache,
}

impl ProxyCaches {
    fn new() -> Self {
        Self {
            input: ProxyBufferCache::new(Direction::Input),
            output: ProxyBufferCache::new(Direction::Output),
        }
    }
}

/// Marshals codec calls onto an [`IpcClient`] connection.
///
/// Owns the client half of the buffer caches: allocated by a successful
/// `prepare`, emptied by `flush`, dropped by `reset` and `release`.
pub struct CodecServiceProxy {
    client: IpcClient,
    caches: Mutex<Option<ProxyCaches>>,
}

impl CodecServiceProxy {
    pub fn new(client: IpcClient) -> Self {
        Self {
            client,
            caches: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &IpcClient {
        &self.client
    }

    /// Entry count of the input and output caches, if allocated.
    pub fn cached_handles(&self) -> Option<(usize, usize)> {
        self.caches
            .lock()
            .expect("proxy cache lock poisoned")
            .as_ref()
            .map(|c| (c.input.len(), c.output.len()))
    }

    fn set_caches(&self, caches: Option<ProxyCaches>) {
        *self.caches.lock().expect("proxy cache lock poisoned") = caches;
    }

    fn request() -> Parcel {
        Parcel::with_interface_token(IpcConfig::SERVICE_DESCRIPTOR)
    }

    /// One round trip. A non-zero status becomes the matching error.
    async fn transact<F>(&self, code: RequestCode, build: F) -> Result<ParcelReader>
    where
        F: FnOnce(&mut Parcel),
    {
        let mut args = Self::request();
        build(&mut args);
        let (status, body) = self.client.call(code, args).await?;
        if status != 0 {
            let err = reply_error(status, body);
            debug!("{} failed remotely: {}", code, err);
            return Err(err);
        }
        Ok(ParcelReader::new(body))
    }

    pub async fn set_listener_object(&self) -> Result<()> {
        self.transact(RequestCode::SetListenerObject, |_| {}).await?;
        Ok(())
    }

    pub async fn init_parameter(&self, kind: CodecKind, by_mime: bool, name: &str) -> Result<()> {
        self.transact(RequestCode::InitParameter, |args| {
            args.write_i32(kind.to_wire());
            args.write_bool(by_mime);
            args.write_string(name);
        })
        .await?;
        Ok(())
    }

    pub async fn configure(&self, format: &Format) -> Result<()> {
        self.transact(RequestCode::Configure, |args| args.write_format(format))
            .await?;
        Ok(())
    }

    pub async fn create_input_surface(&self) -> Result<SurfaceHandle> {
        let mut reply = self.transact(RequestCode::CreateInputSurface, |_| {}).await?;
        Ok(SurfaceHandle(reply.read_u64()?))
    }

    pub async fn set_output_surface(&self, surface: SurfaceHandle) -> Result<()> {
        self.transact(RequestCode::SetOutputSurface, |args| args.write_u64(surface.0))
            .await?;
        Ok(())
    }

    pub async fn prepare(&self) -> Result<()> {
        self.transact(RequestCode::Prepare, |_| {}).await?;
        self.set_caches(Some(ProxyCaches::new()));
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.transact(RequestCode::Start, |_| {}).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.transact(RequestCode::Stop, |_| {}).await?;
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.transact(RequestCode::Flush, |_| {}).await?;
        if let Some(caches) = self.caches.lock().expect("proxy cache lock poisoned").as_mut() {
            caches.input.clear();
            caches.output.clear();
        }
        Ok(())
    }

    pub async fn reset(&self) -> Result<()> {
        self.set_caches(None);
        self.transact(RequestCode::Reset, |_| {}).await?;
        Ok(())
    }

    pub async fn release(&self) -> Result<()> {
        self.set_caches(None);
        self.transact(RequestCode::Release, |_| {}).await?;
        Ok(())
    }

    pub async fn notify_eos(&self) -> Result<()> {
        self.transact(RequestCode::NotifyEos, |_| {}).await?;
        Ok(())
    }

    pub async fn get_input_buffer(&self, index: BufferIndex) -> Result<SharedBuffer> {
        self.get_buffer(RequestCode::GetInputBuffer, Direction::Input, index)
            .await
    }

    pub async fn get_output_buffer(&self, index: BufferIndex) -> Result<SharedBuffer> {
        self.get_buffer(RequestCode::GetOutputBuffer, Direction::Output, index)
            .await
    }

    async fn get_buffer(
        &self,
        code: RequestCode,
        direction: Direction,
        index: BufferIndex,
    ) -> Result<SharedBuffer> {
        if self.cached_handles().is_none() {
            return Err(CodecError::not_permitted(
                &format!("get_{}_buffer", direction),
                "no buffer cache",
            ));
        }
        let mut reply = self.transact(code, |args| args.write_u32(index)).await?;

        let mut caches = self.caches.lock().expect("proxy cache lock poisoned");
        let caches = caches.as_mut().ok_or_else(|| {
            CodecError::not_permitted(&format!("get_{}_buffer", direction), "no buffer cache")
        })?;
        match direction {
            Direction::Input => caches.input.read_from_parcel(index, &mut reply),
            Direction::Output => caches.output.read_from_parcel(index, &mut reply),
        }
    }

    pub async fn queue_input_buffer(
        &self,
        index: BufferIndex,
        info: BufferInfo,
        flag: BufferFlag,
    ) -> Result<()> {
        self.transact(RequestCode::QueueInputBuffer, |args| {
            args.write_u32(index);
            args.write_buffer_info(&info);
            args.write_u32(flag.bits());
        })
        .await?;
        Ok(())
    }

    pub async fn release_output_buffer(&self, index: BufferIndex, render: bool) -> Result<()> {
        self.transact(RequestCode::ReleaseOutputBuffer, |args| {
            args.write_u32(index);
            args.write_bool(render);
        })
        .await?;
        Ok(())
    }

    pub async fn get_output_format(&self) -> Result<Format> {
        let mut reply = self.transact(RequestCode::GetOutputFormat, |_| {}).await?;
        reply.read_format()
    }

    pub async fn set_parameter(&self, params: &Format) -> Result<()> {
        self.transact(RequestCode::SetParameter, |args| args.write_format(params))
            .await?;
        Ok(())
    }

    pub async fn destroy_stub(&self) -> Result<()> {
        self.transact(RequestCode::DestroyStub, |_| {}).await?;
        Ok(())
    }

    /// Queue `DestroyStub` without waiting; usable where awaiting is not.
    pub fn post_destroy_stub(&self) -> Result<()> {
        self.client.post(RequestCode::DestroyStub, Self::request())
    }
}
