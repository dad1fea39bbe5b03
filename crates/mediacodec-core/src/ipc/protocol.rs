//! Wire protocol: request codes, message envelopes, and framing.
//!
//! Every frame is a 4-byte big-endian length prefix followed by one encoded
//! [`Message`]:
//!
//! ```text
//! [u32 BE: len][u8 kind][kind-specific header][parcel bytes]
//!
//! Request: kind=1, u64 seq, u32 code, args   (args open with the service token)
//! Reply:   kind=2, u64 seq, i32 status, body (status 0 is success)
//! Event:   kind=3, u32 code, payload         (payload opens with the listener token)
//! ```

use crate::config::IpcConfig;
use crate::error::{CodecError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Service request codes, one per remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestCode {
    SetListenerObject = 1,
    InitParameter = 2,
    Configure = 3,
    Prepare = 4,
    Start = 5,
    Stop = 6,
    Flush = 7,
    Reset = 8,
    Release = 9,
    NotifyEos = 10,
    CreateInputSurface = 11,
    SetOutputSurface = 12,
    GetInputBuffer = 13,
    QueueInputBuffer = 14,
    GetOutputBuffer = 15,
    GetOutputFormat = 16,
    ReleaseOutputBuffer = 17,
    SetParameter = 18,
    DestroyStub = 19,
}

impl RequestCode {
    const ALL: [RequestCode; 19] = [
        RequestCode::SetListenerObject,
        RequestCode::InitParameter,
        RequestCode::Configure,
        RequestCode::Prepare,
        RequestCode::Start,
        RequestCode::Stop,
        RequestCode::Flush,
        RequestCode::Reset,
        RequestCode::Release,
        RequestCode::NotifyEos,
        RequestCode::CreateInputSurface,
        RequestCode::SetOutputSurface,
        RequestCode::GetInputBuffer,
        RequestCode::QueueInputBuffer,
        RequestCode::GetOutputBuffer,
        RequestCode::GetOutputFormat,
        RequestCode::ReleaseOutputBuffer,
        RequestCode::SetParameter,
        RequestCode::DestroyStub,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_u32() == code)
    }
}

impl fmt::Display for RequestCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Reverse-channel event codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ListenerCode {
    OnError = 1,
    OnOutputFormatChanged = 2,
    OnInputBufferAvailable = 3,
    OnOutputBufferAvailable = 4,
}

impl ListenerCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(ListenerCode::OnError),
            2 => Some(ListenerCode::OnOutputFormatChanged),
            3 => Some(ListenerCode::OnInputBufferAvailable),
            4 => Some(ListenerCode::OnOutputBufferAvailable),
            _ => None,
        }
    }
}

impl fmt::Display for ListenerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

const KIND_REQUEST: u8 = 1;
const KIND_REPLY: u8 = 2;
const KIND_EVENT: u8 = 3;

/// One frame's worth of protocol traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request { seq: u64, code: u32, args: Bytes },
    Reply { seq: u64, status: i32, body: Bytes },
    Event { code: u32, payload: Bytes },
}

impl Message {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::Request { seq, code, args } => {
                buf.put_u8(KIND_REQUEST);
                buf.put_u64(*seq);
                buf.put_u32(*code);
                buf.put_slice(args);
            }
            Message::Reply { seq, status, body } => {
                buf.put_u8(KIND_REPLY);
                buf.put_u64(*seq);
                buf.put_i32(*status);
                buf.put_slice(body);
            }
            Message::Event { code, payload } => {
                buf.put_u8(KIND_EVENT);
                buf.put_u32(*code);
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.remaining() < 1 {
            return Err(CodecError::protocol("empty frame"));
        }
        match frame.get_u8() {
            KIND_REQUEST => {
                need(&frame, 12, "request header")?;
                let seq = frame.get_u64();
                let code = frame.get_u32();
                Ok(Message::Request {
                    seq,
                    code,
                    args: frame,
                })
            }
            KIND_REPLY => {
                need(&frame, 12, "reply header")?;
                let seq = frame.get_u64();
                let status = frame.get_i32();
                Ok(Message::Reply {
                    seq,
                    status,
                    body: frame,
                })
            }
            KIND_EVENT => {
                need(&frame, 4, "event header")?;
                let code = frame.get_u32();
                Ok(Message::Event {
                    code,
                    payload: frame,
                })
            }
            other => Err(CodecError::protocol(format!("unknown message kind {}", other))),
        }
    }
}

fn need(frame: &Bytes, len: usize, what: &str) -> Result<()> {
    if frame.remaining() < len {
        return Err(CodecError::protocol(format!("truncated {}", what)));
    }
    Ok(())
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(CodecError::protocol(format!(
            "IPC message size {} exceeds maximum {}",
            len,
            IpcConfig::MAX_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(CodecError::protocol(format!(
            "IPC message size {} exceeds maximum {}",
            payload.len(),
            IpcConfig::MAX_MESSAGE_SIZE
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_codes_are_stable() {
        assert_eq!(RequestCode::SetListenerObject.as_u32(), 1);
        assert_eq!(RequestCode::GetInputBuffer.as_u32(), 13);
        assert_eq!(RequestCode::DestroyStub.as_u32(), 19);
        assert_eq!(RequestCode::from_u32(14), Some(RequestCode::QueueInputBuffer));
        assert_eq!(RequestCode::from_u32(0), None);
        assert_eq!(RequestCode::from_u32(20), None);
        assert_eq!(ListenerCode::from_u32(4), Some(ListenerCode::OnOutputBufferAvailable));
    }

    #[test]
    fn test_reply_keeps_body() {
        let reply = Message::Reply {
            seq: 42,
            status: 2,
            body: Bytes::from_static(b"not now"),
        };
        assert_eq!(Message::decode(reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_truncated_and_unknown_messages_rejected() {
        assert!(Message::decode(Bytes::new()).is_err());
        assert!(Message::decode(Bytes::from_static(&[KIND_REQUEST, 0, 0])).is_err());
        assert!(Message::decode(Bytes::from_static(&[9, 0, 0, 0, 0])).is_err());
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();

        assert_eq!(read_back, Some(payload.to_vec()));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (IpcConfig::MAX_MESSAGE_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }
}
