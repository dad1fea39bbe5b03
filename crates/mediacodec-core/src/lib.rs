//! Mediacodec Core - out-of-process media codec control plane.
//!
//! A codec session runs in a host process that owns a streaming pipeline
//! engine. Callers drive it through [`CodecClient`], which speaks a small
//! binary RPC protocol over a local TCP connection and receives buffer and
//! error events back through a [`CodecCallback`].
//!
//! The host side is [`IpcServer`], which gives every connection its own
//! [`CodecServer`]. The same `CodecServer` can be used in-process without
//! any transport.
//!
//! # Example
//!
//! ```rust,ignore
//! use mediacodec_core::{CodecClient, CodecKind, CodecService, IpcServer, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> mediacodec_core::Result<()> {
//!     let handle = IpcServer::start(ServerOptions::default()).await?;
//!     let client = CodecClient::connect(handle.addr()).await?;
//!
//!     client.init_parameter(CodecKind::AudioDecoder, true, "audio/mp4a-latm").await?;
//!     client.release().await;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod cache;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod ipc;
pub mod platform;
pub mod server;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use buffer::{SharedBuffer, SharedMemoryHandle};
pub use client::CodecClient;
pub use config::{EngineConfig, FormatConfig, IpcConfig};
pub use engine::{CodecDescriptor, CodecRegistry, InMemorySurfaceProvider, SurfaceProvider};
pub use error::{CodecError, ErrorKind, Result};
pub use format::{keys, Format, FormatValue};
pub use ipc::{IpcServer, IpcServerHandle};
pub use server::{CodecServer, ServerOptions};
pub use service::{CodecCallback, CodecEvent, CodecService};
pub use types::{
    BufferFlag, BufferIndex, BufferInfo, CodecKind, CodecState, SurfaceHandle, EOS_BUFFER_INDEX,
};
