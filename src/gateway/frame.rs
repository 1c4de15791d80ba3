//! Client-facing frame codec: a `u16`-length-prefixed envelope carrying a
//! topic and payload, with optional AES-ECB-then-base64 wrapping.
//!
//! Grounded in the original gateway's binary frame format and its
//! hand-rolled ECB block loop (no chaining, no IV — matched here rather
//! than upgraded to a chained mode, since changing the wire format would
//! break compatibility with existing clients); `aes`+`cipher` supply the
//! block cipher the way the teacher's crypto helper already depended on
//! them, and `bytes::BytesMut` backs the small reusable body-buffer pool.

use crate::constants::gateway::{BODY_POOL_CAPACITY, MAX_FRAME_LEN, POOLED_BODY_SIZE};
use crate::error::{MeshError, Result};
use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use base64::Engine;
use bytes::BytesMut;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

const BLOCK_SIZE: usize = 16;

fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_SIZE - (data.len() % BLOCK_SIZE);
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(pad_len as u8).take(pad_len));
    out
}

fn pkcs7_unpad(data: &[u8]) -> Result<Vec<u8>> {
    let pad_len = *data.last().ok_or_else(|| MeshError::crypto("empty decrypted block"))? as usize;
    if pad_len == 0 || pad_len > data.len() {
        return Err(MeshError::crypto("invalid PKCS7 padding"));
    }
    Ok(data[..data.len() - pad_len].to_vec())
}

fn aes_ecb_encrypt(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let padded = pkcs7_pad(data);
    let mut out = Vec::with_capacity(padded.len());
    for chunk in padded.chunks(BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.encrypt_block(&mut block);
        out.extend_from_slice(&block);
    }
    out
}

fn aes_ecb_decrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(MeshError::crypto("ciphertext is not a multiple of the AES block size"));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        out.extend_from_slice(&block);
    }
    pkcs7_unpad(&out)
}

/// Reusable pool of body buffers sized for the common case, so a busy
/// gateway doesn't allocate a fresh `Vec` per frame. Packets too large for
/// the pooled size fall back to a one-off allocation.
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> Self {
        let mut buffers = Vec::with_capacity(BODY_POOL_CAPACITY);
        for _ in 0..BODY_POOL_CAPACITY {
            buffers.push(BytesMut::with_capacity(POOLED_BODY_SIZE));
        }
        Self { buffers: Mutex::new(buffers) }
    }

    pub fn acquire(&self) -> BytesMut {
        self.buffers
            .lock()
            .expect("buffer pool mutex poisoned")
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(POOLED_BODY_SIZE))
    }

    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let mut buffers = self.buffers.lock().expect("buffer pool mutex poisoned");
        if buffers.len() < BODY_POOL_CAPACITY {
            buffers.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes and decodes the gateway's client-facing wire frames, optionally
/// wrapping the body in AES-ECB + base64 when a key is configured.
pub struct FrameCodec {
    key: Option<[u8; 16]>,
    pool: BufferPool,
}

impl FrameCodec {
    pub fn new(key: Option<[u8; 16]>) -> Self {
        Self { key, pool: BufferPool::new() }
    }

    pub fn plain() -> Self {
        Self::new(None)
    }

    /// Encode `topic`/`payload` into a complete outbound frame, including
    /// the `u16` total-length prefix.
    pub fn encode(&self, topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
        if topic.len() > u16::MAX as usize {
            return Err(MeshError::gateway("topic exceeds u16 length"));
        }
        let mut body = self.pool.acquire();
        body.extend_from_slice(&(topic.len() as u16).to_le_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);

        let wrapped: Vec<u8> = match &self.key {
            Some(key) => {
                let encrypted = aes_ecb_encrypt(key, &body);
                base64::engine::general_purpose::STANDARD.encode(encrypted).into_bytes()
            }
            None => body.to_vec(),
        };
        self.pool.release(body);

        let total_len = wrapped.len() + 2;
        if total_len > MAX_FRAME_LEN {
            return Err(MeshError::gateway(format!("frame of {total_len} bytes exceeds the u16 length prefix")));
        }
        let mut frame = Vec::with_capacity(total_len);
        frame.extend_from_slice(&(total_len as u16).to_le_bytes());
        frame.extend_from_slice(&wrapped);
        Ok(frame)
    }

    /// Decode a `totalLen`-prefixed body already read off the wire (i.e.
    /// everything after the two-byte length prefix) into `(topic, payload)`.
    pub fn decode_body(&self, wrapped: &[u8]) -> Result<(String, Vec<u8>)> {
        let body = match &self.key {
            Some(key) => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(wrapped)
                    .map_err(|e| MeshError::crypto(format!("base64 decode: {e}")))?;
                aes_ecb_decrypt(key, &decoded)?
            }
            None => wrapped.to_vec(),
        };
        if body.len() < 2 {
            return Err(MeshError::gateway("frame body shorter than the topic-length prefix"));
        }
        let topic_len = u16::from_le_bytes([body[0], body[1]]) as usize;
        if body.len() < 2 + topic_len {
            return Err(MeshError::gateway("frame body shorter than its declared topic length"));
        }
        let topic = String::from_utf8(body[2..2 + topic_len].to_vec())
            .map_err(|e| MeshError::gateway(format!("topic is not valid UTF-8: {e}")))?;
        let payload = body[2 + topic_len..].to_vec();
        Ok((topic, payload))
    }

    /// Read one frame off `reader`. Returns `Ok(None)` for a zero-length
    /// body, the protocol's keep-alive: no topic/payload to dispatch.
    pub async fn read_frame<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Option<(String, Vec<u8>)>> {
        let mut len_buf = [0u8; 2];
        reader.read_exact(&mut len_buf).await.map_err(|e| MeshError::transport(e.to_string()))?;
        let total_len = u16::from_le_bytes(len_buf) as usize;
        if total_len < 2 {
            return Err(MeshError::gateway("frame totalLen is shorter than the length prefix itself"));
        }
        let body_len = total_len - 2;
        if body_len == 0 {
            return Ok(None);
        }

        let mut body = self.pool.acquire();
        body.resize(body_len, 0);
        reader.read_exact(&mut body).await.map_err(|e| MeshError::transport(e.to_string()))?;
        let decoded = self.decode_body(&body);
        self.pool.release(body);
        decoded.map(Some)
    }

    /// Decode a complete frame (length prefix included) that arrived as a
    /// single message rather than a byte stream, e.g. one WebSocket binary
    /// frame. The message boundary already demarcates the frame, but
    /// `encode` always prepends the `u16` prefix for wire-format parity with
    /// the TCP listener, so it's stripped here the same way `read_frame`
    /// strips it off the stream.
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Option<(String, Vec<u8>)>> {
        if frame.len() < 2 {
            return Err(MeshError::gateway("frame shorter than the length prefix"));
        }
        if frame.len() == 2 {
            return Ok(None);
        }
        self.decode_body(&frame[2..]).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_round_trips() {
        let codec = FrameCodec::plain();
        let frame = codec.encode("auth/login", b"hello").unwrap();
        let total_len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(total_len, frame.len());
        let (topic, payload) = codec.decode_body(&frame[2..]).unwrap();
        assert_eq!(topic, "auth/login");
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn encrypted_round_trips() {
        let codec = FrameCodec::new(Some(*b"0123456789abcdef"));
        let frame = codec.encode("gate/push", b"payload-bytes").unwrap();
        let (topic, payload) = codec.decode_body(&frame[2..]).unwrap();
        assert_eq!(topic, "gate/push");
        assert_eq!(payload, b"payload-bytes");
    }

    #[test]
    fn empty_topic_and_payload_round_trip() {
        let codec = FrameCodec::plain();
        let frame = codec.encode("", b"").unwrap();
        let (topic, payload) = codec.decode_body(&frame[2..]).unwrap();
        assert_eq!(topic, "");
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn read_frame_treats_zero_length_body_as_keepalive() {
        let codec = FrameCodec::plain();
        let mut bytes: &[u8] = &2u16.to_le_bytes();
        let result = codec.read_frame(&mut bytes).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn read_frame_decodes_a_full_frame_from_a_stream() {
        let codec = FrameCodec::plain();
        let frame = codec.encode("m/fn", b"args").unwrap();
        let mut cursor: &[u8] = &frame;
        let (topic, payload) = codec.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(topic, "m/fn");
        assert_eq!(payload, b"args");
    }
}
