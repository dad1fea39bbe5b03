//! Integration tests for the mediacodec-host binary.
//!
//! These tests spawn the real host process, read its port from stdout, and
//! drive a codec session through `CodecClient`.

use mediacodec_core::{
    keys, BufferFlag, BufferIndex, BufferInfo, CodecCallback, CodecClient, CodecKind,
    CodecService, ErrorKind, Format,
};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

struct HostHandle {
    child: tokio::process::Child,
    port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl HostHandle {
    fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    async fn kill(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

/// Write an engine config pointing shared memory at `dir`.
fn write_config(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("engine.json");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        r#"{{"shm_dir": {:?}, "input_buffer_count": 2}}"#,
        dir.path().join("shm")
    )
    .unwrap();
    std::fs::create_dir_all(dir.path().join("shm")).unwrap();
    path
}

/// Start the host binary and wait for its port line.
async fn start_host(config: &std::path::Path) -> Result<HostHandle, String> {
    let binary = PathBuf::from(env!("CARGO_BIN_EXE_mediacodec-host"));

    let mut child = tokio::process::Command::new(&binary)
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .arg("--config")
        .arg(config)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("failed to spawn mediacodec-host: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut discovered_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("MEDIACODEC_PORT=") {
                    let parsed = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid MEDIACODEC_PORT value '{value}': {e}"))?;
                    discovered_port = Some(parsed);
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read host stdout: {err}")),
            Err(_) => continue,
        }
    }

    let port = discovered_port
        .ok_or_else(|| "MEDIACODEC_PORT line not emitted by mediacodec-host".to_string())?;

    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(HostHandle {
        child,
        port,
        stdout_drain: Some(stdout_drain),
    })
}

struct ErrorCallback(mpsc::UnboundedSender<ErrorKind>);

impl CodecCallback for ErrorCallback {
    fn on_error(&self, kind: ErrorKind) {
        let _ = self.0.send(kind);
    }

    fn on_output_format_changed(&self, _format: &Format) {}

    fn on_input_buffer_available(&self, _index: BufferIndex) {}

    fn on_output_buffer_available(&self, _index: BufferIndex, _info: BufferInfo, _flag: BufferFlag) {}
}

async fn running_decoder(client: &CodecClient) -> mpsc::UnboundedReceiver<ErrorKind> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.set_callback(Arc::new(ErrorCallback(tx))).await.unwrap();
    client
        .init_parameter(CodecKind::AudioDecoder, true, "audio/vorbis")
        .await
        .unwrap();
    let mut format = Format::new();
    format
        .set_i32(keys::CHANNEL_COUNT, 1)
        .set_i32(keys::SAMPLE_RATE, 8000)
        .set_i32(keys::AUDIO_RAW_FORMAT, 1);
    client.configure(&format).await.unwrap();
    client.prepare().await.unwrap();
    client.start().await.unwrap();
    rx
}

#[tokio::test]
async fn test_host_serves_a_session() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let host = start_host(&config).await.unwrap();
    assert!(host.port > 0);

    let client = CodecClient::connect(host.addr()).await.unwrap();
    let mut errors = running_decoder(&client).await;

    // Vorbis decoders need codec data before any frame
    client.get_input_buffer(0).await.unwrap();
    let err = client
        .queue_input_buffer(0, BufferInfo::new(0, 4, 0), BufferFlag::NONE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
    client
        .queue_input_buffer(0, BufferInfo::new(0, 4, 0), BufferFlag::CODEC_DATA)
        .await
        .unwrap();

    client.stop().await.unwrap();
    client.release().await;
    assert!(errors.try_recv().is_err());

    host.kill().await;
}

#[tokio::test]
async fn test_killed_host_reports_service_died() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let host = start_host(&config).await.unwrap();

    let client = CodecClient::connect(host.addr()).await.unwrap();
    let mut errors = running_decoder(&client).await;

    host.kill().await;

    let kind = tokio::time::timeout(Duration::from_secs(5), errors.recv())
        .await
        .expect("no error after host death")
        .unwrap();
    assert_eq!(kind, ErrorKind::ServiceDied);

    let err = client.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceDied);
    client.release().await;
}
