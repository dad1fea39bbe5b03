//! Out-of-process transport for codec sessions.
//!
//! A codec session spans two processes: the client holds a
//! `CodecServiceProxy`, the host holds a `CodecServiceStub` wrapping a
//! `CodecServer`. They talk over one `127.0.0.1` TCP connection carrying
//! length-prefixed binary frames.
//!
//! # Architecture
//!
//! - **Parcel**: typed argument serialization with interface tokens
//! - **Protocol**: request codes, message envelopes, and framing
//! - **Client / Server**: connection management on each side
//! - **Proxy / Stub**: one method per remote operation, plus the buffer caches
//! - **Listener**: the reverse channel carrying codec events back to the client

pub mod client;
pub mod listener;
pub mod parcel;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod stub;

pub use client::IpcClient;
pub use listener::{CallbackSlot, ListenerProxy, ListenerStub, RemoteEvent};
pub use parcel::{Parcel, ParcelReader};
pub use protocol::{ListenerCode, Message, RequestCode};
pub use proxy::CodecServiceProxy;
pub use server::{IpcServer, IpcServerHandle};
pub use stub::{CodecServiceStub, StubReply};
