use std::net::Ipv4Addr;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use apf_mux::{MuxSession, MuxStream};

use crate::copy::pump;

/// Accepts inbound data streams and splices each onto a loopback connection
/// to the port named in its 2-byte prelude.
pub struct ProxyForwarder {
    session: MuxSession,
}

impl ProxyForwarder {
    pub fn new(session: MuxSession) -> Self {
        Self { session }
    }

    /// Accept streams until the session goes away. Prelude or dial failures
    /// drop the one stream and nothing else.
    pub async fn run(mut self) {
        while let Some(stream) = self.session.accept().await {
            tokio::spawn(serve_stream(stream));
        }
        debug!("session closed, forwarder stopping");
    }
}

async fn serve_stream(mut stream: MuxStream) {
    let mut prelude = [0u8; 2];
    if let Err(e) = stream.read_exact(&mut prelude).await {
        warn!(%e, "failed to read stream prelude");
        return;
    }
    let target_port = u16::from_be_bytes(prelude);

    let conn = match TcpStream::connect((Ipv4Addr::LOCALHOST, target_port)).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(target_port, %e, "failed to dial local service");
            return;
        }
    };
    let _ = conn.set_nodelay(true);
    debug!(target_port, stream_id = stream.id(), "splicing stream");
    pump(stream, conn).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use apf_mux::{Mode, MuxSession};
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn session_pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            MuxSession::new(ar, aw, Mode::Server),
            MuxSession::new(br, bw, Mode::Client),
        )
    }

    /// A loopback echo service; returns its port.
    async fn spawn_echo() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind failed");
        let port = listener.local_addr().expect("local_addr failed").port();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = conn.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn splices_streams_onto_loopback() {
        let (host_session, agent_session) = session_pair();
        let opener = host_session.opener();
        tokio::spawn(ProxyForwarder::new(agent_session).run());

        let echo_port = spawn_echo().await;

        let mut stream = opener.open().await.expect("open failed");
        stream
            .write_all(&echo_port.to_be_bytes())
            .await
            .expect("write failed");
        stream.write_all(b"testmsg").await.expect("write failed");

        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.expect("read failed");
        assert_eq!(&buf, b"testmsg");
        drop(host_session);
    }

    #[tokio::test]
    async fn dial_failure_drops_only_that_stream() {
        let (host_session, agent_session) = session_pair();
        let opener = host_session.opener();
        tokio::spawn(ProxyForwarder::new(agent_session).run());

        // Point a stream at a port nobody listens on.
        let dead = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind failed");
        let dead_port = dead.local_addr().expect("local_addr failed").port();
        drop(dead);

        let mut doomed = opener.open().await.expect("open failed");
        doomed
            .write_all(&dead_port.to_be_bytes())
            .await
            .expect("write failed");
        let mut buf = [0u8; 1];
        let n = doomed.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "the doomed stream must be dropped");

        // A second stream to a live service still works.
        let echo_port = spawn_echo().await;
        let mut fine = opener.open().await.expect("open failed");
        fine.write_all(&echo_port.to_be_bytes())
            .await
            .expect("write failed");
        fine.write_all(b"ok").await.expect("write failed");
        let mut ok = [0u8; 2];
        fine.read_exact(&mut ok).await.expect("read failed");
        assert_eq!(&ok, b"ok");
        drop(host_session);
    }
}
