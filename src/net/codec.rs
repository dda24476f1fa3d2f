//! Length-prefixed framing shared by the control and bulk connections.
//!
//! ```text
//! ┌──────────┬──────────┬──────────────────────────────────────────────┐
//! │ u32 len  │ u8 kind  │ body (len - 1 bytes)                         │
//! └──────────┴──────────┴──────────────────────────────────────────────┘
//! kind 1  JSON control message (HostMessage / ReceiverMessage / identity)
//! kind 2  MapChunk: u16 id_len │ id │ u32 index │ u32 total │ payload
//! ```
//!
//! All integers are big-endian. Chunk payloads stay raw `Bytes`; they are
//! split off the read buffer without copying.

use crate::error::{Result, SyncError};
use crate::protocol::MapChunk;
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const KIND_MESSAGE: u8 = 1;
pub const KIND_CHUNK: u8 = 2;

/// Upper bound on `len`; anything larger is treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<M> {
    Message(M),
    Chunk(MapChunk),
}

pub fn encode_message<M: Serialize>(msg: &M, dst: &mut BytesMut) -> Result<()> {
    let body = serde_json::to_vec(msg)?;
    put_header(dst, body.len() + 1)?;
    dst.put_u8(KIND_MESSAGE);
    dst.put_slice(&body);
    Ok(())
}

pub fn encode_chunk(chunk: &MapChunk, dst: &mut BytesMut) -> Result<()> {
    let id = chunk.transfer_id.as_bytes();
    let id_len = u16::try_from(id.len())
        .map_err(|_| SyncError::MalformedFrame(format!("transfer id of {} bytes", id.len())))?;
    let len = 1 + 2 + id.len() + 4 + 4 + chunk.payload.len();
    put_header(dst, len)?;
    dst.put_u8(KIND_CHUNK);
    dst.put_u16(id_len);
    dst.put_slice(id);
    dst.put_u32(chunk.chunk_index as u32);
    dst.put_u32(chunk.total_chunks as u32);
    dst.put_slice(&chunk.payload);
    Ok(())
}

fn put_header(dst: &mut BytesMut, len: usize) -> Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(SyncError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    dst.reserve(HEADER_LEN + len);
    dst.put_u32(len as u32);
    Ok(())
}

/// Pull one complete frame off the front of `src`.
///
/// Returns `Ok(None)` when more bytes are needed; `src` is left untouched in
/// that case.
pub fn decode<M: DeserializeOwned>(src: &mut BytesMut) -> Result<Option<Frame<M>>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(SyncError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    if len == 0 {
        return Err(SyncError::MalformedFrame("empty frame".into()));
    }
    if src.len() < HEADER_LEN + len {
        src.reserve(HEADER_LEN + len - src.len());
        return Ok(None);
    }

    src.advance(HEADER_LEN);
    let mut body = src.split_to(len);
    let kind = body.get_u8();
    match kind {
        KIND_MESSAGE => Ok(Some(Frame::Message(serde_json::from_slice(&body)?))),
        KIND_CHUNK => decode_chunk(body).map(|c| Some(Frame::Chunk(c))),
        other => Err(SyncError::MalformedFrame(format!("unknown frame kind {}", other))),
    }
}

fn decode_chunk(mut body: BytesMut) -> Result<MapChunk> {
    if body.remaining() < 2 {
        return Err(SyncError::MalformedFrame("chunk header truncated".into()));
    }
    let id_len = body.get_u16() as usize;
    if body.remaining() < id_len + 8 {
        return Err(SyncError::MalformedFrame("chunk header truncated".into()));
    }
    let id = body.split_to(id_len);
    let transfer_id = String::from_utf8(id.to_vec())
        .map_err(|_| SyncError::MalformedFrame("transfer id is not utf-8".into()))?;
    let chunk_index = body.get_u32() as i32;
    let total_chunks = body.get_u32() as i32;
    Ok(MapChunk {
        transfer_id,
        chunk_index,
        total_chunks,
        payload: body.freeze(),
    })
}

// ---------------------------------------------------------------------------
// Async stream helpers
// ---------------------------------------------------------------------------

#[cfg(feature = "server")]
pub use stream::{read_frame, write_buf};

#[cfg(feature = "server")]
mod stream {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Read until one frame is available. `Ok(None)` on a clean EOF between
    /// frames.
    pub async fn read_frame<R, M>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<Frame<M>>>
    where
        R: AsyncRead + Unpin,
        M: DeserializeOwned,
    {
        loop {
            if let Some(frame) = decode(buf)? {
                return Ok(Some(frame));
            }
            if reader.read_buf(buf).await? == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(SyncError::MalformedFrame(format!(
                    "stream closed mid-frame ({} bytes pending)",
                    buf.len()
                )));
            }
        }
    }

    pub async fn write_buf<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> Result<()> {
        writer.write_all(buf).await?;
        writer.flush().await?;
        Ok(())
    }
}
