//! Port-list wire codec: `count (u16 BE) || port[0] (u16 BE) || ...`

use apf_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encode a port list into its wire form. Fails if the list cannot be
/// described by the 16-bit count.
pub fn encode_ports(ports: &[u16]) -> Result<Vec<u8>> {
    let count = u16::try_from(ports.len())
        .map_err(|_| Error::Protocol(format!("port list too long: {}", ports.len())))?;
    let mut buf = Vec::with_capacity(2 + ports.len() * 2);
    buf.extend_from_slice(&count.to_be_bytes());
    for port in ports {
        buf.extend_from_slice(&port.to_be_bytes());
    }
    Ok(buf)
}

/// Decode a complete port-list buffer produced by [`encode_ports`].
pub fn decode_ports(buf: &[u8]) -> Result<Vec<u16>> {
    if buf.len() < 2 {
        return Err(Error::Protocol("port list shorter than its header".into()));
    }
    let count = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let body = &buf[2..];
    if body.len() != count * 2 {
        return Err(Error::Protocol(format!(
            "port list length mismatch: header says {count}, got {} bytes",
            body.len()
        )));
    }
    Ok(body
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Read a port list off a stream: the 2-byte count, then exactly that many
/// ports.
pub async fn read_ports<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u16>> {
    let mut header = [0u8; 2];
    r.read_exact(&mut header).await?;
    let count = u16::from_be_bytes(header) as usize;
    let mut body = vec![0u8; count * 2];
    r.read_exact(&mut body).await?;
    Ok(body
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Write a port list onto a stream.
pub async fn write_ports<W: AsyncWrite + Unpin>(w: &mut W, ports: &[u16]) -> Result<()> {
    let buf = encode_ports(ports)?;
    w.write_all(&buf).await?;
    Ok(())
}
