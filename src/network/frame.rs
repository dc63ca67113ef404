// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Length-prefixed text frames.
//!
//! Wire layout of one frame:
//!
//! ```text
//! +----------------------------+---------------------------+
//! | length: i32, little-endian | payload: `length` bytes   |
//! +----------------------------+---------------------------+
//! ```
//!
//! The payload is UTF-8 text and may be empty.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{AppError, AppResult};

pub const LENGTH_PREFIX_SIZE: usize = 4;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Interprets a raw length prefix. No validation happens here.
pub fn decode_length(prefix: [u8; LENGTH_PREFIX_SIZE]) -> i32 {
    i32::from_le_bytes(prefix)
}

/// Reads until `buf` is full.
///
/// A zero-byte read before that point means the peer closed the stream
/// mid-frame and is reported as [`AppError::ConnectionReset`].
pub async fn read_exact_or_reset<R>(reader: &mut R, buf: &mut [u8]) -> AppResult<()>
where
    R: AsyncRead + Unpin,
{
    let received = fill(reader, buf).await?;
    if received < buf.len() {
        return Err(AppError::ConnectionReset(format!(
            "stream closed after {} of {} bytes",
            received,
            buf.len()
        )));
    }
    Ok(())
}

// returns the number of bytes read, short only when the stream hit eof
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut received = 0;
    while received < buf.len() {
        let n = reader.read(&mut buf[received..]).await?;
        if n == 0 {
            break;
        }
        received += n;
    }
    Ok(received)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        FrameCodec {
            // the prefix is an i32, nothing larger can be expressed
            max_frame_size: max_frame_size.min(i32::MAX as usize),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn encode(&self, payload: &str) -> AppResult<BytesMut> {
        let body = payload.as_bytes();
        self.check_size(body.len())?;
        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
        frame.put_i32_le(body.len() as i32);
        frame.put_slice(body);
        Ok(frame)
    }

    /// Validates a decoded length prefix against the frame size policy.
    pub fn decode_length(&self, prefix: [u8; LENGTH_PREFIX_SIZE]) -> AppResult<usize> {
        let length = decode_length(prefix);
        if length < 0 {
            return Err(AppError::MalformedFrame(format!(
                "frame size {} less than 0",
                length
            )));
        }
        let length = length as usize;
        self.check_size(length)?;
        Ok(length)
    }

    /// Parses one frame out of `buffer` if a complete one is present,
    /// leaving any trailing bytes in place.
    pub fn decode(&self, buffer: &mut BytesMut) -> AppResult<Option<String>> {
        if buffer.remaining() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&buffer[..LENGTH_PREFIX_SIZE]);
        let length = self.decode_length(prefix)?;
        if buffer.remaining() < LENGTH_PREFIX_SIZE + length {
            buffer.reserve(LENGTH_PREFIX_SIZE + length - buffer.remaining());
            return Ok(None);
        }
        buffer.advance(LENGTH_PREFIX_SIZE);
        let body = buffer.split_to(length);
        decode_payload(body.to_vec()).map(Some)
    }

    /// Reads one frame in two phases: the length prefix, then the payload.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly before the first byte
    /// of a new frame. A stream that ends anywhere inside a frame yields
    /// [`AppError::ConnectionReset`].
    pub async fn read_frame<R>(&self, reader: &mut R) -> AppResult<Option<String>>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        match fill(reader, &mut prefix).await? {
            0 => return Ok(None),
            LENGTH_PREFIX_SIZE => {}
            partial => {
                return Err(AppError::ConnectionReset(format!(
                    "stream closed after {} bytes of length prefix",
                    partial
                )))
            }
        }
        let length = self.decode_length(prefix)?;
        let mut body = vec![0u8; length];
        read_exact_or_reset(reader, &mut body).await?;
        decode_payload(body).map(Some)
    }

    /// Writes the whole frame and flushes it.
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &str) -> AppResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(payload)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn check_size(&self, size: usize) -> AppResult<()> {
        if size > self.max_frame_size {
            return Err(AppError::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        Ok(())
    }
}

fn decode_payload(body: Vec<u8>) -> AppResult<String> {
    String::from_utf8(body)
        .map_err(|e| AppError::MalformedFrame(format!("payload is not utf-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let codec = FrameCodec::default();
        let frame = codec.encode("héllo").unwrap();
        assert_eq!(&frame[..4], &6i32.to_le_bytes());
        assert_eq!(&frame[4..], "héllo".as_bytes());

        let empty = codec.encode("").unwrap();
        assert_eq!(&empty[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_roundtrip() {
        let codec = FrameCodec::default();
        for text in ["", "hello", "Echo: 你好, мир 🦀"] {
            let mut buffer = codec.encode(text).unwrap();
            assert_eq!(codec.decode(&mut buffer).unwrap().as_deref(), Some(text));
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let codec = FrameCodec::default();
        let frame = codec.encode("partial").unwrap();

        let mut buffer = BytesMut::from(&frame[..2]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        let mut buffer = BytesMut::from(&frame[..7]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        assert_eq!(buffer.len(), 7);

        // two frames back to back come out one at a time
        let mut buffer = codec.encode("one").unwrap();
        buffer.extend_from_slice(&codec.encode("two").unwrap());
        assert_eq!(codec.decode(&mut buffer).unwrap().as_deref(), Some("one"));
        assert_eq!(codec.decode(&mut buffer).unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn test_decode_length_policy() {
        let codec = FrameCodec::new(8);
        assert_eq!(codec.decode_length(8i32.to_le_bytes()).unwrap(), 8);
        assert!(matches!(
            codec.decode_length((-1i32).to_le_bytes()),
            Err(AppError::MalformedFrame(_))
        ));
        assert!(matches!(
            codec.decode_length(9i32.to_le_bytes()),
            Err(AppError::FrameTooLarge { size: 9, limit: 8 })
        ));
        assert_eq!(decode_length([0xff, 0xff, 0xff, 0xff]), -1);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let codec = FrameCodec::new(4);
        assert!(codec.encode("four").is_ok());
        assert!(matches!(
            codec.encode("fives"),
            Err(AppError::FrameTooLarge { size: 5, limit: 4 })
        ));
    }

    #[test]
    fn test_invalid_utf8_is_malformed() {
        let codec = FrameCodec::default();
        let mut buffer = BytesMut::new();
        buffer.put_i32_le(2);
        buffer.put_slice(&[0xc3, 0x28]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(AppError::MalformedFrame(_))
        ));
    }
}
