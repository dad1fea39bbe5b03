//! TCP IPC server for the codec host.
//!
//! Listens on a local address, accepts client connections, and gives each
//! connection its own codec session: a `CodecServer` behind a
//! `CodecServiceStub`. The session lives exactly as long as the connection.
//!
//! # Thread Safety
//!
//! The server runs on the tokio runtime. Each connection is handled in its own
//! spawned task, and each request on a connection in its own task, so a
//! state wait on one request does not stall event delivery. Outbound frames
//! (replies and listener events) go through one writer task per connection.

use super::protocol::{read_frame, write_frame, Message};
use super::stub::CodecServiceStub;
use crate::config::IpcConfig;
use crate::error::Result;
use crate::server::{CodecServer, ServerOptions};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running IPC server. Dropping shuts down the server.
pub struct IpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
    active_connections: Arc<AtomicUsize>,
}

impl IpcServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of sessions currently connected.
    pub fn active_sessions(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Shut down the server.
    ///
    /// Stops accepting new connections and releases every live session; the
    /// clients observe the closed connection as `ServiceDied`.
    pub fn shutdown(&mut self) {
        // Signal accept loop to stop
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Signal all connection handlers to close
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// IPC server that hosts codec sessions.
pub struct IpcServer;

impl IpcServer {
    /// Start the IPC server on a random local port.
    pub async fn start(options: ServerOptions) -> Result<IpcServerHandle> {
        Self::start_on(SocketAddr::from(([127, 0, 0, 1], 0)), options).await
    }

    /// Start the IPC server on `addr`. Port 0 lets the OS pick.
    ///
    /// The server runs in background tokio tasks.
    pub async fn start_on(addr: SocketAddr, options: ServerOptions) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("Codec host listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            options,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections.clone(),
        ));

        Ok(IpcServerHandle {
            addr,
            port,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
            active_connections,
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        options: ServerOptions,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Codec host shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= IpcConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    IpcConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let options = options.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, options, &mut conn_shutdown).await {
                                    debug!("Connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        options: ServerOptions,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, writer) = stream.into_split();

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let writer_task = tokio::spawn(write_loop(writer, frames_rx, close_rx));

        let server = Arc::new(CodecServer::new(options)?);
        let session_id = server.session_id();
        let stub = Arc::new(CodecServiceStub::new(server, frames_tx.clone()));

        let result = loop {
            // Wait for either a frame or a shutdown signal
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Some(f)) => f,
                        Ok(None) => break Ok(()), // Clean disconnect
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    break Ok(()); // Server shutting down
                }
            };

            match Message::decode(Bytes::from(frame)) {
                Ok(Message::Request { seq, code, args }) => {
                    let stub = stub.clone();
                    let frames = frames_tx.clone();
                    tokio::spawn(async move {
                        let reply = stub.on_remote_request(code, args).await;
                        let message = Message::Reply {
                            seq,
                            status: reply.status,
                            body: reply.body,
                        };
                        let _ = frames.send(message.encode());
                    });
                }
                Ok(other) => warn!("Session {}: ignoring unexpected {:?}", session_id, other),
                Err(e) => warn!("Session {}: malformed frame: {}", session_id, e),
            }
        };

        stub.destroy().await;
        let _ = close_tx.send(());
        let _ = writer_task.await;
        debug!("Session {} closed", session_id);
        result
    }
}

/// Drain outbound frames onto the socket until told to close.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    mut close: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { return };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("Write failed: {}", e);
                    return;
                }
            }
            _ = &mut close => {
                while let Ok(frame) = frames.try_recv() {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        return;
                    }
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::ipc::parcel::Parcel;
    use crate::ipc::protocol::RequestCode;

    fn options(dir: &tempfile::TempDir) -> ServerOptions {
        ServerOptions {
            engine: EngineConfig {
                shm_dir: Some(dir.path().to_path_buf()),
                ..EngineConfig::default()
            },
            ..ServerOptions::default()
        }
    }

    fn request(seq: u64, code: RequestCode, token: &str) -> Bytes {
        Message::Request {
            seq,
            code: code.as_u32(),
            args: Parcel::with_interface_token(token).freeze(),
        }
        .encode()
    }

    async fn reply(reader: &mut tokio::net::tcp::ReadHalf<'_>) -> Message {
        let frame = read_frame(reader).await.unwrap().unwrap();
        Message::decode(Bytes::from(frame)).unwrap()
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = IpcServer::start(options(&dir)).await.unwrap();

        assert!(handle.port > 0);
        assert_eq!(handle.addr.ip(), std::net::Ipv4Addr::LOCALHOST);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_request_gets_reply_with_same_seq() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = IpcServer::start(options(&dir)).await.unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let (mut reader, mut writer) = stream.split();

        let frame = request(7, RequestCode::Start, IpcConfig::SERVICE_DESCRIPTOR);
        write_frame(&mut writer, &frame).await.unwrap();

        match reply(&mut reader).await {
            Message::Reply { seq, status, .. } => {
                assert_eq!(seq, 7);
                assert_eq!(status, ErrorKind::OperateNotPermit.status_code());
            }
            other => panic!("expected reply, got {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_foreign_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = IpcServer::start(options(&dir)).await.unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let (mut reader, mut writer) = stream.split();

        let frame = request(1, RequestCode::Start, "other.Service");
        write_frame(&mut writer, &frame).await.unwrap();

        match reply(&mut reader).await {
            Message::Reply { status, .. } => {
                assert_eq!(status, ErrorKind::InvalidValue.status_code())
            }
            other => panic!("expected reply, got {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = IpcServer::start(options(&dir)).await.unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let (mut reader, mut writer) = stream.split();
        let frame = request(1, RequestCode::SetListenerObject, IpcConfig::SERVICE_DESCRIPTOR);
        write_frame(&mut writer, &frame).await.unwrap();
        assert!(matches!(reply(&mut reader).await, Message::Reply { status: 0, .. }));

        handle.shutdown();
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }
}
