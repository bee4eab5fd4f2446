//! Wire protocol spoken on the two dedicated control streams.
//!
//! Every frame starts with a 3-byte ASCII opcode. `fwd`, `del` and `lsn`
//! carry a port list: a big-endian `u16` count followed by that many
//! big-endian `u16` ports. There is no version field; host and agent are
//! always the same build.

mod codec;

pub use codec::{decode_ports, encode_ports, read_ports, write_ports};

use apf_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length of every opcode on the wire.
pub const OPCODE_LEN: usize = 3;

pub const PING: &[u8; OPCODE_LEN] = b"png";
pub const FWD: &[u8; OPCODE_LEN] = b"fwd";
pub const DEL: &[u8; OPCODE_LEN] = b"del";
pub const ACK: &[u8; OPCODE_LEN] = b"ack";
pub const LSN: &[u8; OPCODE_LEN] = b"lsn";

/// A request sent on a control stream. Each request is answered by exactly
/// one [`Response`] before the next request is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Liveness probe; answered with `ack`.
    Ping,
    /// Ask the peer to bind a listener for each port; answered with `lsn`
    /// carrying the bound local ports in request order.
    Fwd(Vec<u16>),
    /// Ask the peer to close the listeners for each port; answered with `ack`.
    Del(Vec<u16>),
}

impl Request {
    pub fn opcode(&self) -> &'static [u8; OPCODE_LEN] {
        match self {
            Request::Ping => PING,
            Request::Fwd(_) => FWD,
            Request::Del(_) => DEL,
        }
    }

    /// Read one request frame. An unknown opcode is a protocol error; the
    /// stream is unusable afterwards.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Request> {
        let mut opcode = [0u8; OPCODE_LEN];
        r.read_exact(&mut opcode).await?;
        match &opcode {
            PING => Ok(Request::Ping),
            FWD => Ok(Request::Fwd(read_ports(r).await?)),
            DEL => Ok(Request::Del(read_ports(r).await?)),
            other => Err(Error::Protocol(format!(
                "unknown request opcode: {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_all(self.opcode()).await?;
        match self {
            Request::Ping => {}
            Request::Fwd(ports) | Request::Del(ports) => write_ports(w, ports).await?,
        }
        w.flush().await?;
        Ok(())
    }
}

/// A response read back on the stream the request went out on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack,
    /// Reply to `fwd`: the ports the peer actually bound, `0` marking a
    /// failed bind.
    Lsn(Vec<u16>),
}

impl Response {
    pub fn opcode(&self) -> &'static [u8; OPCODE_LEN] {
        match self {
            Response::Ack => ACK,
            Response::Lsn(_) => LSN,
        }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Response> {
        let mut opcode = [0u8; OPCODE_LEN];
        r.read_exact(&mut opcode).await?;
        match &opcode {
            ACK => Ok(Response::Ack),
            LSN => Ok(Response::Lsn(read_ports(r).await?)),
            other => Err(Error::Protocol(format!(
                "unknown response opcode: {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_all(self.opcode()).await?;
        if let Response::Lsn(ports) = self {
            write_ports(w, ports).await?;
        }
        w.flush().await?;
        Ok(())
    }
}
