use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use apf_common::{Error, Result};
use apf_manager::PortForwarder;
use apf_mux::MuxOpener;

use crate::copy::pump;

/// Owns the local TCP listeners that shadow the peer's ports. Each accepted
/// connection becomes one multiplexed stream, preluded with the target port.
pub struct ProxyListener {
    opener: MuxOpener,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// local listener port -> accept-loop handle
    listeners: HashMap<u16, ListenerHandle>,
    /// peer target port -> local listener port
    port_map: HashMap<u16, u16>,
}

struct ListenerHandle {
    cancel: CancellationToken,
}

/// The port we try first: the target port itself, bumped out of the
/// privileged range when necessary.
fn preferred_port(target_port: u16) -> u16 {
    if target_port < 1024 {
        target_port + 5000
    } else {
        target_port
    }
}

async fn bind_v4(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await
}

impl ProxyListener {
    pub fn new(opener: MuxOpener) -> Self {
        Self {
            opener,
            state: Mutex::new(State::default()),
        }
    }

    /// Bind a listener that forwards into `target_port` on the peer and
    /// start its accept loop. Prefers a local port matching the target, and
    /// falls back to an OS-chosen one when that is taken.
    pub async fn new_listener(&self, target_port: u16) -> Result<u16> {
        let listener = match bind_v4(preferred_port(target_port)).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => bind_v4(0).await?,
            Err(e) => {
                warn!(target_port, %e, "failed to bind listener");
                return Err(e.into());
            }
        };
        let local_port = listener.local_addr()?.port();
        debug!(target_port, local_port, "new listener");

        let cancel = CancellationToken::new();
        {
            let mut state = self.state.lock().unwrap();
            state.listeners.insert(
                local_port,
                ListenerHandle {
                    cancel: cancel.clone(),
                },
            );
            state.port_map.insert(target_port, local_port);
        }
        tokio::spawn(accept_loop(
            listener,
            target_port,
            self.opener.clone(),
            cancel,
        ));
        Ok(local_port)
    }

    /// Close the listener for `target_port` and forget both table entries.
    pub fn close_listener(&self, target_port: u16) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(local_port) = state.port_map.remove(&target_port) else {
            return Err(Error::Protocol(format!(
                "no listener for target port {target_port}"
            )));
        };
        if let Some(handle) = state.listeners.remove(&local_port) {
            handle.cancel.cancel();
        }
        debug!(target_port, local_port, "closed listener");
        Ok(())
    }

    /// Whether `local_port` is one of ours. The agent uses this to keep its
    /// own forward listeners out of the scanner snapshots it reports.
    pub fn port_in_use(&self, local_port: u16) -> bool {
        self.state.lock().unwrap().listeners.contains_key(&local_port)
    }
}

#[async_trait]
impl PortForwarder for ProxyListener {
    async fn bind(&self, target_port: u16) -> Result<u16> {
        self.new_listener(target_port).await
    }

    async fn unbind(&self, target_port: u16) -> Result<()> {
        self.close_listener(target_port)
    }
}

async fn accept_loop(
    listener: TcpListener,
    target_port: u16,
    opener: MuxOpener,
    cancel: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((conn, peer)) => {
                    debug!(%peer, target_port, "accepted connection");
                    conn
                }
                Err(e) => {
                    warn!(target_port, %e, "accept failed");
                    break;
                }
            },
        };

        let opener = opener.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(conn, target_port, opener).await {
                debug!(target_port, %e, "proxied connection ended with error");
            }
        });
    }
}

async fn serve_connection(conn: TcpStream, target_port: u16, opener: MuxOpener) -> io::Result<()> {
    let _ = conn.set_nodelay(true);
    let mut stream = opener.open().await?;
    // Tell the far side which loopback port this stream is for before the
    // byte pump takes over.
    stream.write_all(&target_port.to_be_bytes()).await?;
    pump(conn, stream).await;
    Ok(())
}
