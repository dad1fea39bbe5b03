//! The codec service contract and its event surface.

use crate::buffer::SharedBuffer;
use crate::error::{ErrorKind, Result};
use crate::format::Format;
use crate::types::{BufferFlag, BufferIndex, BufferInfo, CodecKind, SurfaceHandle};
use async_trait::async_trait;
use std::sync::Arc;

/// An asynchronous notification from the engine to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecEvent {
    Error(ErrorKind),
    OutputFormatChanged(Format),
    InputBufferAvailable(BufferIndex),
    OutputBufferAvailable {
        index: BufferIndex,
        info: BufferInfo,
        flag: BufferFlag,
    },
}

impl CodecEvent {
    /// Deliver to the matching callback method.
    pub fn dispatch(self, callback: &dyn CodecCallback) {
        match self {
            CodecEvent::Error(kind) => callback.on_error(kind),
            CodecEvent::OutputFormatChanged(format) => callback.on_output_format_changed(&format),
            CodecEvent::InputBufferAvailable(index) => callback.on_input_buffer_available(index),
            CodecEvent::OutputBufferAvailable { index, info, flag } => {
                callback.on_output_buffer_available(index, info, flag)
            }
        }
    }
}

/// Receiver of codec events. May be invoked from any thread.
pub trait CodecCallback: Send + Sync {
    fn on_error(&self, kind: ErrorKind);

    fn on_output_format_changed(&self, format: &Format);

    fn on_input_buffer_available(&self, index: BufferIndex);

    fn on_output_buffer_available(&self, index: BufferIndex, info: BufferInfo, flag: BufferFlag);
}

/// The client-visible codec contract.
///
/// Each call is one blocking round trip to the codec server.
#[async_trait]
pub trait CodecService: Send + Sync {
    async fn init_parameter(&self, kind: CodecKind, by_mime: bool, name: &str) -> Result<()>;

    /// Install the event receiver. Once per session, before `configure`.
    async fn set_callback(&self, callback: Arc<dyn CodecCallback>) -> Result<()>;

    async fn configure(&self, format: &Format) -> Result<()>;

    async fn create_input_surface(&self) -> Result<SurfaceHandle>;

    async fn set_output_surface(&self, surface: SurfaceHandle) -> Result<()>;

    async fn prepare(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn flush(&self) -> Result<()>;

    async fn reset(&self) -> Result<()>;

    /// Tear down the session. Safe to call any number of times.
    async fn release(&self);

    async fn notify_eos(&self) -> Result<()>;

    async fn get_input_buffer(&self, index: BufferIndex) -> Result<SharedBuffer>;

    async fn queue_input_buffer(
        &self,
        index: BufferIndex,
        info: BufferInfo,
        flag: BufferFlag,
    ) -> Result<()>;

    async fn get_output_buffer(&self, index: BufferIndex) -> Result<SharedBuffer>;

    async fn release_output_buffer(&self, index: BufferIndex, render: bool) -> Result<()>;

    async fn get_output_format(&self) -> Result<Format>;

    async fn set_parameter(&self, params: &Format) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl CodecCallback for Recorder {
        fn on_error(&self, kind: ErrorKind) {
            self.calls.lock().unwrap().push(format!("error {}", kind));
        }

        fn on_output_format_changed(&self, format: &Format) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("format {}", format.len()));
        }

        fn on_input_buffer_available(&self, index: BufferIndex) {
            self.calls.lock().unwrap().push(format!("input {}", index));
        }

        fn on_output_buffer_available(&self, index: BufferIndex, info: BufferInfo, _flag: BufferFlag) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("output {} {}", index, info.size));
        }
    }

    #[test]
    fn test_dispatch_routes_each_variant() {
        let recorder = Recorder::default();
        CodecEvent::InputBufferAvailable(2).dispatch(&recorder);
        CodecEvent::OutputBufferAvailable {
            index: 1,
            info: BufferInfo::new(0, 10, 0),
            flag: BufferFlag::NONE,
        }
        .dispatch(&recorder);
        CodecEvent::OutputFormatChanged(Format::new()).dispatch(&recorder);
        CodecEvent::Error(ErrorKind::Io).dispatch(&recorder);

        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["input 2", "output 1 10", "format 0", "error io"]
        );
    }
}
