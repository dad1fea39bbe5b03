//! TCP transport for the client side of a codec session.
//!
//! One connection carries requests, replies, and listener events. A reader
//! task routes replies to waiting callers by sequence number and forwards
//! events to the listener stub. A writer task owns the write half so frames
//! can be queued from synchronous code, such as `Drop`.
//!
//! # Thread Safety
//!
//! `call` may be used concurrently from multiple tasks; each call waits on
//! its own oneshot channel.

use super::listener::RemoteEvent;
use super::parcel::Parcel;
use super::protocol::{read_frame, write_frame, Message, RequestCode};
use crate::config::IpcConfig;
use crate::error::{CodecError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<(i32, Bytes)>>>>;

/// Client connection to a codec host.
#[derive(Debug)]
pub struct IpcClient {
    addr: SocketAddr,
    frames: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    pending: Pending,
    next_seq: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl IpcClient {
    /// Connect to a codec host. Listener events are forwarded to `events`.
    ///
    /// Uses the connection timeout from `IpcConfig`.
    pub async fn connect(
        addr: SocketAddr,
        events: mpsc::UnboundedSender<RemoteEvent>,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| CodecError::Timeout(IpcConfig::CONNECT_TIMEOUT))?
            .map_err(|e| {
                debug!("Connect to {} failed: {}", addr, e);
                CodecError::ServiceDied
            })?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (frames, frames_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(write_half, frames_rx));
        let reader = tokio::spawn(read_loop(read_half, pending.clone(), alive.clone(), events));

        debug!("IPC client connected to {}", addr);

        Ok(Self {
            addr,
            frames: Mutex::new(Some(frames)),
            pending,
            next_seq: AtomicU64::new(1),
            alive,
            reader,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the connection is still up.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn queue(&self, frame: Bytes) -> Result<()> {
        let frames = self.frames.lock().expect("frame queue lock poisoned");
        match frames.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| CodecError::ServiceDied),
            None => Err(CodecError::ServiceDied),
        }
    }

    /// Send a request and wait for its reply status and body.
    ///
    /// Fails with `ServiceDied` if the connection is down or drops before the
    /// reply arrives, and with `Timeout` after `IpcConfig::CALL_TIMEOUT`.
    pub async fn call(&self, code: RequestCode, args: Parcel) -> Result<(i32, Bytes)> {
        if !self.is_alive() {
            return Err(CodecError::ServiceDied);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending call lock poisoned")
            .insert(seq, tx);

        // The reader may have drained `pending` between the check and the insert
        if !self.is_alive() {
            self.forget(seq);
            return Err(CodecError::ServiceDied);
        }

        let request = Message::Request {
            seq,
            code: code.as_u32(),
            args: args.freeze(),
        };
        if let Err(e) = self.queue(request.encode()) {
            self.forget(seq);
            return Err(e);
        }

        match tokio::time::timeout(IpcConfig::CALL_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CodecError::ServiceDied),
            Err(_) => {
                self.forget(seq);
                warn!("{} to {} timed out", code, self.addr);
                Err(CodecError::Timeout(IpcConfig::CALL_TIMEOUT))
            }
        }
    }

    /// Queue a request without waiting for the reply.
    pub fn post(&self, code: RequestCode, args: Parcel) -> Result<()> {
        if !self.is_alive() {
            return Err(CodecError::ServiceDied);
        }
        let request = Message::Request {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            code: code.as_u32(),
            args: args.freeze(),
        };
        self.queue(request.encode())
    }

    fn forget(&self, seq: u64) {
        self.pending
            .lock()
            .expect("pending call lock poisoned")
            .remove(&seq);
    }

    /// Flush queued frames and close the connection.
    pub fn close(&self) {
        self.frames.lock().expect("frame queue lock poisoned").take();
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!("IPC write failed: {}", e);
            return;
        }
    }
    // Dropping the write half sends FIN to the server
    debug!("IPC writer closed");
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    pending: Pending,
    alive: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<RemoteEvent>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Codec host closed the connection");
                break;
            }
            Err(e) => {
                warn!("IPC read failed: {}", e);
                break;
            }
        };

        match Message::decode(Bytes::from(frame)) {
            Ok(Message::Reply { seq, status, body }) => {
                let waiter = pending
                    .lock()
                    .expect("pending call lock poisoned")
                    .remove(&seq);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send((status, body));
                    }
                    None => debug!("Reply for unknown request {}", seq),
                }
            }
            Ok(Message::Event { code, payload }) => {
                let _ = events.send(RemoteEvent::Event { code, payload });
            }
            Ok(Message::Request { code, .. }) => {
                warn!("Ignoring request {} sent by the codec host", code);
            }
            Err(e) => warn!("Malformed frame from codec host: {}", e),
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Dropping the senders fails every in-flight call
    pending.lock().expect("pending call lock poisoned").clear();
    let _ = events.send(RemoteEvent::Disconnected);
}
