//! Reverse channel: codec events from the server back to the client.
//!
//! On the server, [`ListenerProxy`] is the session's `CodecCallback` and
//! turns each event into an `Event` frame. On the client, the connection's
//! reader forwards those frames to [`ListenerStub`], which decodes them and
//! calls the installed callback from a single task, in arrival order.

use super::parcel::{Parcel, ParcelReader};
use super::protocol::{ListenerCode, Message};
use crate::config::IpcConfig;
use crate::error::{CodecError, ErrorKind, Result};
use crate::format::Format;
use crate::service::{CodecCallback, CodecEvent};
use crate::types::{BufferFlag, BufferIndex, BufferInfo};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Server-side callback that forwards events over the session connection.
pub struct ListenerProxy {
    frames: mpsc::UnboundedSender<Bytes>,
}

impl ListenerProxy {
    pub fn new(frames: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { frames }
    }

    fn send(&self, code: ListenerCode, payload: Parcel) {
        let message = Message::Event {
            code: code.as_u32(),
            payload: payload.freeze(),
        };
        if self.frames.send(message.encode()).is_err() {
            warn!("Listener connection closed, dropping {}", code);
        }
    }
}

fn event_parcel() -> Parcel {
    Parcel::with_interface_token(IpcConfig::LISTENER_DESCRIPTOR)
}

impl CodecCallback for ListenerProxy {
    fn on_error(&self, kind: ErrorKind) {
        let mut payload = event_parcel();
        payload.write_i32(kind.status_code());
        self.send(ListenerCode::OnError, payload);
    }

    fn on_output_format_changed(&self, format: &Format) {
        let mut payload = event_parcel();
        payload.write_format(format);
        self.send(ListenerCode::OnOutputFormatChanged, payload);
    }

    fn on_input_buffer_available(&self, index: BufferIndex) {
        let mut payload = event_parcel();
        payload.write_u32(index);
        self.send(ListenerCode::OnInputBufferAvailable, payload);
    }

    fn on_output_buffer_available(&self, index: BufferIndex, info: BufferInfo, flag: BufferFlag) {
        let mut payload = event_parcel();
        payload.write_u32(index);
        payload.write_buffer_info(&info);
        payload.write_u32(flag.bits());
        self.send(ListenerCode::OnOutputBufferAvailable, payload);
    }
}

/// Decode one `Event` frame payload.
pub fn decode_event(code: u32, payload: Bytes) -> Result<CodecEvent> {
    let code = ListenerCode::from_u32(code)
        .ok_or_else(|| CodecError::protocol(format!("unknown listener code {}", code)))?;
    let mut data = ParcelReader::new(payload);
    data.enforce_interface(IpcConfig::LISTENER_DESCRIPTOR)?;

    let event = match code {
        ListenerCode::OnError => CodecEvent::Error(ErrorKind::from_status_code(data.read_i32()?)),
        ListenerCode::OnOutputFormatChanged => CodecEvent::OutputFormatChanged(data.read_format()?),
        ListenerCode::OnInputBufferAvailable => CodecEvent::InputBufferAvailable(data.read_u32()?),
        ListenerCode::OnOutputBufferAvailable => CodecEvent::OutputBufferAvailable {
            index: data.read_u32()?,
            info: data.read_buffer_info()?,
            flag: BufferFlag::from_bits(data.read_u32()?)?,
        },
    };
    Ok(event)
}

/// What the connection reader hands to the listener stub.
#[derive(Debug)]
pub enum RemoteEvent {
    Event { code: u32, payload: Bytes },
    /// The connection is gone. Sent once.
    Disconnected,
}

/// Holds the client's callback. Installed at most once.
#[derive(Default)]
pub struct CallbackSlot {
    callback: Mutex<Option<Arc<dyn CodecCallback>>>,
    closed: AtomicBool,
}

impl CallbackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, callback: Arc<dyn CodecCallback>) -> Result<()> {
        let mut slot = self.callback.lock().expect("callback slot lock poisoned");
        if slot.is_some() {
            return Err(CodecError::not_permitted("set_callback", "callback already set"));
        }
        *slot = Some(callback);
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.callback
            .lock()
            .expect("callback slot lock poisoned")
            .is_some()
    }

    fn get(&self) -> Option<Arc<dyn CodecCallback>> {
        self.callback
            .lock()
            .expect("callback slot lock poisoned")
            .clone()
    }

    /// Stop delivering events, including the disconnect notification.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn deliver(&self, event: CodecEvent) {
        if self.is_closed() {
            debug!("Listener closed, dropping {:?}", event);
            return;
        }
        match self.get() {
            Some(callback) => event.dispatch(callback.as_ref()),
            None => debug!("No callback installed, dropping {:?}", event),
        }
    }
}

/// Client-side event dispatcher.
pub struct ListenerStub;

impl ListenerStub {
    /// Spawn the dispatcher task for one client connection.
    pub fn spawn(
        mut events: mpsc::UnboundedReceiver<RemoteEvent>,
        slot: Arc<CallbackSlot>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(remote) = events.recv().await {
                match remote {
                    RemoteEvent::Event { code, payload } => match decode_event(code, payload) {
                        Ok(event) => slot.deliver(event),
                        Err(e) => warn!("Rejecting listener event {}: {}", code, e),
                    },
                    RemoteEvent::Disconnected => {
                        if !slot.is_closed() {
                            warn!("Codec service connection lost");
                            slot.deliver(CodecEvent::Error(ErrorKind::ServiceDied));
                        }
                        break;
                    }
                }
            }
            debug!("Listener stub exiting");
        })
    }
}
