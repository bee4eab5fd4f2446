//! Length-prefixed rkyv framing for the shared pipe.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::{Frame, MAX_FRAME_SIZE};

fn codec_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("codec error: {e}"))
}

pub(crate) fn encode(frame: &Frame) -> io::Result<Vec<u8>> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(frame).map_err(codec_error)?;
    Ok(bytes.into_vec())
}

pub(crate) fn decode(payload: &[u8]) -> io::Result<Frame> {
    rkyv::from_bytes::<Frame, rkyv::rancor::Error>(payload).map_err(codec_error)
}

/// Read a single length-prefixed frame off the pipe.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {MAX_FRAME_SIZE})"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    decode(&payload)
}

/// Write a single frame, coalescing the length prefix and payload into one
/// write, and flush so the peer sees it immediately.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> io::Result<()> {
    let payload = encode(frame)?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    writer.write_all(&buf).await?;
    writer.flush().await
}
