//! Binary parcel encoding for request, reply, and event payloads.
//!
//! All integers are big-endian. Strings and byte blobs carry a `u32` length
//! prefix. Reads are bounds-checked and never panic; a short or malformed
//! parcel is a protocol error.

use crate::buffer::SharedMemoryHandle;
use crate::error::{CodecError, Result};
use crate::format::{Format, FormatValue};
use crate::types::BufferInfo;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Write side of a parcel.
#[derive(Debug, Default)]
pub struct Parcel {
    buf: BytesMut,
}

impl Parcel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a parcel with a protocol identity token.
    pub fn with_interface_token(token: &str) -> Self {
        let mut parcel = Self::new();
        parcel.write_string(token);
        parcel
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_blob(value.as_bytes());
    }

    pub fn write_blob(&mut self, value: &[u8]) {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
    }

    pub fn write_format(&mut self, format: &Format) {
        self.write_u32(format.len() as u32);
        for (key, value) in format.iter() {
            self.write_string(key);
            self.write_u8(value.tag());
            match value {
                FormatValue::Int32(v) => self.write_i32(*v),
                FormatValue::Int64(v) => self.write_i64(*v),
                FormatValue::Float(v) => self.write_f32(*v),
                FormatValue::Double(v) => self.write_f64(*v),
                FormatValue::String(v) => self.write_string(v),
                FormatValue::Bytes(v) => self.write_blob(v),
            }
        }
    }

    pub fn write_buffer_info(&mut self, info: &BufferInfo) {
        self.write_i64(info.presentation_time_us);
        self.write_i32(info.size);
        self.write_i32(info.offset);
    }

    pub fn write_shm_handle(&mut self, handle: &SharedMemoryHandle) {
        self.write_u64(handle.id);
        self.write_u32(handle.capacity);
        self.write_string(&handle.name);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Read side of a parcel.
#[derive(Debug, Clone)]
pub struct ParcelReader {
    buf: Bytes,
}

impl ParcelReader {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self { buf: buf.into() }
    }

    fn need(&self, len: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(CodecError::protocol(format!(
                "parcel too short reading {}: need {} bytes, have {}",
                what,
                len,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::protocol(format!("invalid bool byte {}", other))),
        }
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.need(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.need(4, "f32")?;
        Ok(self.buf.get_f32())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.need(8, "f64")?;
        Ok(self.buf.get_f64())
    }

    pub fn read_blob(&mut self) -> Result<Bytes> {
        let len = self.read_u32()? as usize;
        self.need(len, "blob")?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_blob()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CodecError::protocol("invalid UTF-8 in parcel string"))
    }

    /// Consume the identity token and reject foreign callers.
    pub fn enforce_interface(&mut self, expected: &str) -> Result<()> {
        let token = self.read_string()?;
        if token != expected {
            return Err(CodecError::protocol(format!(
                "interface token mismatch: expected {}, got {}",
                expected, token
            )));
        }
        Ok(())
    }

    pub fn read_format(&mut self) -> Result<Format> {
        let count = self.read_u32()?;
        let mut format = Format::new();
        for _ in 0..count {
            let key = self.read_string()?;
            let value = match self.read_u8()? {
                1 => FormatValue::Int32(self.read_i32()?),
                2 => FormatValue::Int64(self.read_i64()?),
                3 => FormatValue::Float(self.read_f32()?),
                4 => FormatValue::Double(self.read_f64()?),
                5 => FormatValue::String(self.read_string()?),
                6 => FormatValue::Bytes(self.read_blob()?.to_vec()),
                tag => {
                    return Err(CodecError::protocol(format!(
                        "unknown format value tag {} for key {}",
                        tag, key
                    )))
                }
            };
            format.set(key, value);
        }
        Ok(format)
    }

    pub fn read_buffer_info(&mut self) -> Result<BufferInfo> {
        Ok(BufferInfo {
            presentation_time_us: self.read_i64()?,
            size: self.read_i32()?,
            offset: self.read_i32()?,
        })
    }

    pub fn read_shm_handle(&mut self) -> Result<SharedMemoryHandle> {
        Ok(SharedMemoryHandle {
            id: self.read_u64()?,
            capacity: self.read_u32()?,
            name: self.read_string()?,
        })
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_and_strings() {
        let mut parcel = Parcel::with_interface_token("token");
        parcel.write_i32(-7);
        parcel.write_bool(true);
        parcel.write_string("audio/flac");

        let mut reader = ParcelReader::new(parcel.freeze());
        reader.enforce_interface("token").unwrap();
        assert_eq!(reader.read_i32().unwrap(), -7);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_string().unwrap(), "audio/flac");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_foreign_token_rejected() {
        let parcel = Parcel::with_interface_token("someone.else");
        let mut reader = ParcelReader::new(parcel.freeze());
        let err = reader.enforce_interface("token").unwrap_err();
        assert!(matches!(err, CodecError::Protocol { .. }));
    }

    #[test]
    fn test_short_read_is_protocol_error() {
        let mut parcel = Parcel::new();
        parcel.write_u8(1);
        let mut reader = ParcelReader::new(parcel.freeze());
        assert!(matches!(
            reader.read_i64(),
            Err(CodecError::Protocol { .. })
        ));
    }

    #[test]
    fn test_oversized_blob_length_rejected() {
        let mut parcel = Parcel::new();
        parcel.write_u32(1_000);
        parcel.write_u8(0);
        let mut reader = ParcelReader::new(parcel.freeze());
        assert!(reader.read_blob().is_err());
    }

    #[test]
    fn test_format_with_every_value_type() {
        let mut format = Format::new();
        format
            .set_i32("i32", 1)
            .set_i64("i64", i64::MAX)
            .set("f32", FormatValue::Float(0.5))
            .set_f64("f64", 29.97)
            .set_string("str", "video/avc")
            .set_bytes("bytes", vec![0, 1, 2]);

        let mut parcel = Parcel::new();
        parcel.write_format(&format);
        let decoded = ParcelReader::new(parcel.freeze()).read_format().unwrap();
        assert_eq!(decoded, format);
    }

    #[test]
    fn test_unknown_format_tag_rejected() {
        let mut parcel = Parcel::new();
        parcel.write_u32(1);
        parcel.write_string("key");
        parcel.write_u8(42);
        assert!(ParcelReader::new(parcel.freeze()).read_format().is_err());
    }
}
