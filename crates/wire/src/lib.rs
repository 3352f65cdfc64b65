//! Binary wire protocol: serialization, framing, and canned responses.
//!
//! Message framing:
//!   `[4 bytes: payload_length (big-endian)][payload_length bytes: payload]`
//!
//! A payload begins with a 1-byte [`OpType`] (requests) or [`StatusCode`]
//! (responses), followed by type-specific fields encoded with [`ByteBuffer`].
//! All multi-byte integers are big-endian; strings are a 4-byte big-endian
//! length followed by raw bytes.

use bytes::{BufMut, BytesMut};
use quorumkv_common::defaults::MAX_MESSAGE_SIZE;
use quorumkv_common::{OpType, StatusCode, VersionedValue};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    Underflow { needed: usize, remaining: usize },
    #[error("message of {0} bytes exceeds maximum size")]
    TooLarge(usize),
    #[error("string field is not valid UTF-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// ByteBuffer
// ---------------------------------------------------------------------------

/// Append-only writer and cursor-based reader over one wire payload.
#[derive(Debug, Default, Clone)]
pub struct ByteBuffer {
    data: BytesMut,
    read_pos: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: BytesMut::from(&data[..]),
            read_pos: 0,
        }
    }

    // -- Writers ------------------------------------------------------------

    pub fn write_u8(&mut self, v: u8) {
        self.data.put_u8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.data.put_u16(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.data.put_u32(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.data.put_u64(v);
    }

    pub fn write_string(&mut self, s: &str) {
        self.data.put_u32(s.len() as u32);
        self.data.put_slice(s.as_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.data.put_u8(u8::from(v));
    }

    // -- Readers ------------------------------------------------------------

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        self.ensure_readable(1)?;
        let v = self.data[self.read_pos];
        self.read_pos += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        self.ensure_readable(2)?;
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&self.data[self.read_pos..self.read_pos + 2]);
        self.read_pos += 2;
        Ok(u16::from_be_bytes(raw))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        self.ensure_readable(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[self.read_pos..self.read_pos + 4]);
        self.read_pos += 4;
        Ok(u32::from_be_bytes(raw))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        self.ensure_readable(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.data[self.read_pos..self.read_pos + 8]);
        self.read_pos += 8;
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_u32()? as usize;
        self.ensure_readable(len)?;
        let bytes = self.data[self.read_pos..self.read_pos + len].to_vec();
        self.read_pos += len;
        Ok(String::from_utf8(bytes)?)
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    // -- Accessors ----------------------------------------------------------

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn reset_read(&mut self) {
        self.read_pos = 0;
    }

    fn ensure_readable(&self, n: usize) -> Result<(), WireError> {
        if self.read_pos + n > self.data.len() {
            return Err(WireError::Underflow {
                needed: n,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Write one length-prefixed message.
pub async fn write_frame<W>(writer: &mut W, payload: &ByteBuffer) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    if !payload.is_empty() {
        writer.write_all(payload.as_slice()).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary (peer closed the
/// connection); any mid-frame EOF is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<ByteBuffer>, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge(len));
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Some(ByteBuffer::from_vec(data)))
}

// ---------------------------------------------------------------------------
// Response builders
// ---------------------------------------------------------------------------

pub fn ok_response() -> ByteBuffer {
    let mut buf = ByteBuffer::new();
    buf.write_u8(StatusCode::Ok as u8);
    buf
}

pub fn not_found_response() -> ByteBuffer {
    let mut buf = ByteBuffer::new();
    buf.write_u8(StatusCode::NotFound as u8);
    buf
}

pub fn error_response(msg: &str) -> ByteBuffer {
    let mut buf = ByteBuffer::new();
    buf.write_u8(StatusCode::Error as u8);
    buf.write_string(msg);
    buf
}

/// `OK` carrying a value: `value_str, ts_u64, origin_str`.
pub fn value_response(vv: &VersionedValue) -> ByteBuffer {
    let mut buf = ByteBuffer::new();
    buf.write_u8(StatusCode::Ok as u8);
    buf.write_string(&vv.value);
    buf.write_u64(vv.timestamp);
    buf.write_string(&vv.origin_node);
    buf
}

/// Start a request payload with the given op byte.
pub fn request(op: OpType) -> ByteBuffer {
    let mut buf = ByteBuffer::new();
    buf.write_u8(op as u8);
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_buffer_round_trip() {
        let mut buf = ByteBuffer::new();
        buf.write_u8(7);
        buf.write_u16(7001);
        buf.write_u32(0xDEAD_BEEF);
        buf.write_u64(1_700_000_000_123);
        buf.write_string("hello");
        buf.write_bool(true);
        buf.write_bool(false);

        assert_eq!(buf.read_u8().unwrap(), 7);
        assert_eq!(buf.read_u16().unwrap(), 7001);
        assert_eq!(buf.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(buf.read_u64().unwrap(), 1_700_000_000_123);
        assert_eq!(buf.read_string().unwrap(), "hello");
        assert!(buf.read_bool().unwrap());
        assert!(!buf.read_bool().unwrap());
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_byte_buffer_big_endian_layout() {
        let mut buf = ByteBuffer::new();
        buf.write_u32(0x0102_0304);
        assert_eq!(buf.as_slice(), &[0x01, 0x02, 0x03, 0x04]);

        let mut buf = ByteBuffer::new();
        buf.write_string("ab");
        assert_eq!(buf.as_slice(), &[0, 0, 0, 2, b'a', b'b']);
    }

    #[test]
    fn test_byte_buffer_underflow() {
        let mut buf = ByteBuffer::from_vec(vec![0, 0]);
        let err = buf.read_u32().unwrap_err();
        assert!(matches!(err, WireError::Underflow { .. }));
    }

    #[test]
    fn test_string_underflow_on_bad_length() {
        // Length prefix claims 100 bytes, only 2 present.
        let mut buf = ByteBuffer::new();
        buf.write_u32(100);
        buf.write_u8(b'x');
        buf.write_u8(b'y');
        assert!(matches!(
            buf.read_string().unwrap_err(),
            WireError::Underflow { .. }
        ));
    }

    #[test]
    fn test_reset_read() {
        let mut buf = ByteBuffer::new();
        buf.write_u64(42);
        assert_eq!(buf.read_u64().unwrap(), 42);
        buf.reset_read();
        assert_eq!(buf.read_u64().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let mut payload = ByteBuffer::new();
        payload.write_u8(OpType::Put as u8);
        payload.write_string("key");
        payload.write_string("value");
        write_frame(&mut a, &payload).await.unwrap();

        let mut got = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(got.read_u8().unwrap(), OpType::Put as u8);
        assert_eq!(got.read_string().unwrap(), "key");
        assert_eq!(got.read_string().unwrap(), "value");
    }

    #[tokio::test]
    async fn test_frame_empty_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &ByteBuffer::new()).await.unwrap();
        let got = read_frame(&mut b).await.unwrap().unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_frame_clean_eof_returns_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_rejects_oversized_length() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Claim a payload far beyond the cap; no body follows.
        a.write_u32((MAX_MESSAGE_SIZE + 1) as u32).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, WireError::TooLarge(_)));
    }

    #[tokio::test]
    async fn test_frame_mid_frame_eof_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(10).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }

    #[test]
    fn test_value_response_shape() {
        let vv = VersionedValue::new("v", 123, "node1");
        let mut buf = value_response(&vv);
        assert_eq!(buf.read_u8().unwrap(), StatusCode::Ok as u8);
        assert_eq!(buf.read_string().unwrap(), "v");
        assert_eq!(buf.read_u64().unwrap(), 123);
        assert_eq!(buf.read_string().unwrap(), "node1");
    }

    #[test]
    fn test_error_response_shape() {
        let mut buf = error_response("boom");
        assert_eq!(buf.read_u8().unwrap(), StatusCode::Error as u8);
        assert_eq!(buf.read_string().unwrap(), "boom");
    }
}
