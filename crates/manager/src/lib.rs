//! Control-plane manager.
//!
//! Owns the two dedicated control streams and keeps both sides' listener
//! sets in sync. The receiving loop services the peer's `fwd`/`del` requests
//! through the [`PortForwarder`] callbacks; the sending loop serialises our
//! own requests and pairs each with exactly one response; a 5-second ping
//! doubles as the liveness check. Any protocol violation, response timeout
//! or stream error funnels into the once-latched [`Manager::shutdown`].

mod dump;

pub use dump::{ForwardTables, dump_to_stderr};

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use apf_common::{Error, Result};
use apf_protocol::{Request, Response};

/// How long a sent request may wait for its response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness ping period.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Callbacks into the data plane: bind or close a local listener shadowing a
/// peer port. A bind failure is reported, recorded as port `0`, and does not
/// bring the system down.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    /// Bind a listener forwarding to `target_port` on the peer; returns the
    /// local port actually bound.
    async fn bind(&self, target_port: u16) -> Result<u16>;

    /// Close and forget the listener for `target_port`.
    async fn unbind(&self, target_port: u16) -> Result<()>;
}

/// Ran exactly once when the manager shuts down; used to tear down the
/// multiplexer (and, on the host, reap the agent process).
pub type ShutdownHook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Callback rendering the forwarding summary after every table change.
pub type DumpFn = Box<dyn Fn(&ForwardTables) + Send + Sync>;

#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

struct Inner {
    cmd_tx: mpsc::Sender<Request>,
    cmd_rx: std::sync::Mutex<Option<mpsc::Receiver<Request>>>,
    /// Single-slot path for `lsn` replies from the sending loop into
    /// `update_peer_ports`; only one `fwd` is ever in flight.
    lsn_tx: mpsc::Sender<Vec<u16>>,
    lsn_rx: Mutex<mpsc::Receiver<Vec<u16>>>,
    /// peer target port -> local listener port (0 = bind failed).
    /// Written only by the receiving loop.
    local_ports: Mutex<HashMap<u16, u16>>,
    /// our target port -> port the peer bound (0 = not yet confirmed).
    /// Written only under the `update_peer_ports` critical section.
    peer_ports: Mutex<HashMap<u16, u16>>,
    forwarder: Arc<dyn PortForwarder>,
    dump: Option<DumpFn>,
    latch: AtomicBool,
    token: CancellationToken,
    hook: std::sync::Mutex<Option<ShutdownHook>>,
}

impl Manager {
    pub fn new(
        forwarder: Arc<dyn PortForwarder>,
        dump: Option<DumpFn>,
        shutdown_hook: ShutdownHook,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (lsn_tx, lsn_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(Inner {
                cmd_tx,
                cmd_rx: std::sync::Mutex::new(Some(cmd_rx)),
                lsn_tx,
                lsn_rx: Mutex::new(lsn_rx),
                local_ports: Mutex::new(HashMap::new()),
                peer_ports: Mutex::new(HashMap::new()),
                forwarder,
                dump,
                latch: AtomicBool::new(false),
                token: CancellationToken::new(),
                hook: std::sync::Mutex::new(Some(shutdown_hook)),
            }),
        }
    }

    /// Start the three manager tasks over the dedicated control streams:
    /// `inbound` carries the peer's requests, `outbound` ours.
    pub fn run<S>(&self, inbound: S, outbound: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(cmd_rx) = self.inner.cmd_rx.lock().unwrap().take() else {
            warn!("manager is already running");
            return;
        };
        tokio::spawn(receiving_loop(inbound, Arc::clone(&self.inner)));
        tokio::spawn(sending_loop(outbound, cmd_rx, Arc::clone(&self.inner)));
        tokio::spawn(healthcheck(Arc::clone(&self.inner)));
    }

    /// Reconcile the complete set of ports the peer should be listening on.
    ///
    /// Diffs against the peer-port table, sends `fwd` for new ports (awaiting
    /// the `lsn` reply and recording the ports the peer chose) and `del` for
    /// vanished ones. Idempotent for an unchanged set: no wire traffic.
    /// Callers are serialised; interleaving two updates would corrupt the
    /// table.
    pub async fn update_peer_ports(&self, ports: &[u16]) -> Result<()> {
        let inner = &self.inner;
        let mut peer = inner.peer_ports.lock().await;

        let desired: HashSet<u16> = ports.iter().copied().collect();
        let mut fwd_list = Vec::new();
        let mut seen = HashSet::new();
        for &port in ports {
            if !peer.contains_key(&port) && seen.insert(port) {
                fwd_list.push(port);
            }
        }
        let del_list: Vec<u16> = peer
            .keys()
            .copied()
            .filter(|port| !desired.contains(port))
            .collect();

        if fwd_list.is_empty() && del_list.is_empty() {
            return Ok(());
        }

        // Rebuild the table, carrying confirmed peer ports over and seeding
        // new entries with 0 until the reply lands.
        let mut next = HashMap::with_capacity(desired.len());
        for &port in &desired {
            next.insert(port, peer.get(&port).copied().unwrap_or(0));
        }
        *peer = next;

        if !fwd_list.is_empty() {
            inner
                .cmd_tx
                .send(Request::Fwd(fwd_list.clone()))
                .await
                .map_err(|_| Error::ChannelClosed)?;

            let reply = {
                let mut lsn_rx = inner.lsn_rx.lock().await;
                tokio::select! {
                    _ = inner.token.cancelled() => None,
                    reply = lsn_rx.recv() => reply,
                }
            };
            let Some(reply) = reply else {
                inner.shutdown().await;
                return Err(Error::ChannelClosed);
            };
            if reply.len() != fwd_list.len() {
                error!(
                    requested = fwd_list.len(),
                    confirmed = reply.len(),
                    "lsn reply does not match the fwd request"
                );
                inner.shutdown().await;
                return Err(Error::Protocol("lsn reply length mismatch".into()));
            }
            for (port, peer_port) in fwd_list.iter().zip(reply) {
                peer.insert(*port, peer_port);
            }
        }

        if !del_list.is_empty() {
            inner
                .cmd_tx
                .send(Request::Del(del_list))
                .await
                .map_err(|_| Error::ChannelClosed)?;
        }

        drop(peer);
        inner.dump().await;
        Ok(())
    }

    /// Snapshot of the local forward table (peer target port, local port).
    pub async fn local_ports(&self) -> Vec<(u16, u16)> {
        let mut ports: Vec<_> = self
            .inner
            .local_ports
            .lock()
            .await
            .iter()
            .map(|(&target, &local)| (target, local))
            .collect();
        ports.sort_unstable();
        ports
    }

    /// Snapshot of the peer-port table (our target port, peer's listener
    /// port).
    pub async fn peer_ports(&self) -> Vec<(u16, u16)> {
        let mut ports: Vec<_> = self
            .inner
            .peer_ports
            .lock()
            .await
            .iter()
            .map(|(&target, &peer)| (target, peer))
            .collect();
        ports.sort_unstable();
        ports
    }

    /// Idempotent teardown: stops all three loops and runs the shutdown hook
    /// exactly once.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.latch.load(Ordering::SeqCst)
    }
}

impl Inner {
    async fn shutdown(&self) {
        if self.latch.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("manager shutting down");
        self.token.cancel();
        let hook = self.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook().await;
        }
    }

    async fn dump(&self) {
        let Some(dump) = &self.dump else { return };
        let mut local: Vec<(u16, u16)> = self
            .local_ports
            .lock()
            .await
            .iter()
            .map(|(&target, &port)| (target, port))
            .collect();
        let mut peer: Vec<(u16, u16)> = self
            .peer_ports
            .lock()
            .await
            .iter()
            .map(|(&target, &port)| (target, port))
            .collect();
        local.sort_unstable();
        peer.sort_unstable();
        dump(&ForwardTables { local, peer });
    }
}

/// Service the peer's requests on the inbound stream. Sole writer of the
/// local forward table.
async fn receiving_loop<S>(mut inbound: S, inner: Arc<Inner>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let request = tokio::select! {
            _ = inner.token.cancelled() => break,
            request = Request::read_from(&mut inbound) => match request {
                Ok(request) => request,
                Err(e) => {
                    debug!("control receive failed: {e}");
                    inner.shutdown().await;
                    break;
                }
            },
        };

        let replied = match request {
            Request::Ping => Response::Ack.write_to(&mut inbound).await,
            Request::Fwd(ports) => {
                let mut local = inner.local_ports.lock().await;
                let mut bound = Vec::with_capacity(ports.len());
                for port in ports {
                    let local_port = match local.get(&port) {
                        Some(&local_port) => local_port,
                        None => {
                            let local_port = match inner.forwarder.bind(port).await {
                                Ok(local_port) => local_port,
                                Err(e) => {
                                    warn!(port, %e, "failed to bind forward listener");
                                    0
                                }
                            };
                            local.insert(port, local_port);
                            local_port
                        }
                    };
                    bound.push(local_port);
                }
                drop(local);
                let replied = Response::Lsn(bound).write_to(&mut inbound).await;
                inner.dump().await;
                replied
            }
            Request::Del(ports) => {
                let mut local = inner.local_ports.lock().await;
                for port in ports {
                    local.remove(&port);
                    if let Err(e) = inner.forwarder.unbind(port).await {
                        debug!(port, %e, "failed to close forward listener");
                    }
                }
                drop(local);
                let replied = Response::Ack.write_to(&mut inbound).await;
                inner.dump().await;
                replied
            }
        };

        if let Err(e) = replied {
            debug!("control reply failed: {e}");
            inner.shutdown().await;
            break;
        }
    }
}

/// Drain the command queue onto the outbound stream, pairing every request
/// with exactly one response under the response deadline.
async fn sending_loop<S>(mut outbound: S, mut cmd_rx: mpsc::Receiver<Request>, inner: Arc<Inner>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let request = tokio::select! {
            _ = inner.token.cancelled() => break,
            request = cmd_rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        match exchange(&mut outbound, &request, &inner.lsn_tx).await {
            Ok(()) => {}
            Err(Error::Io(e)) => {
                debug!("control exchange failed: {e}");
                inner.shutdown().await;
                break;
            }
            Err(e) => {
                error!("control exchange failed: {e}");
                inner.shutdown().await;
                break;
            }
        }
    }
}

/// One request/response pair on the outbound stream, under the response
/// deadline. An `lsn` reply is routed to the `update_peer_ports` waiter; any
/// other mismatch between request and response is a protocol violation.
async fn exchange<S>(
    outbound: &mut S,
    request: &Request,
    lsn_tx: &mpsc::Sender<Vec<u16>>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    request.write_to(outbound).await?;
    let response = timeout(RESPONSE_TIMEOUT, Response::read_from(outbound))
        .await
        .map_err(|_| Error::ResponseTimeout)??;
    match (response, matches!(request, Request::Fwd(_))) {
        (Response::Ack, false) => Ok(()),
        (Response::Lsn(ports), true) => lsn_tx
            .try_send(ports)
            .map_err(|_| Error::Protocol("lsn reply with no waiting fwd".into())),
        (response, _) => Err(Error::Protocol(format!(
            "response {response:?} does not match the request"
        ))),
    }
}

async fn healthcheck(inner: Arc<Inner>) {
    let mut ticker = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => break,
            _ = ticker.tick() => {
                if inner.cmd_tx.send(Request::Ping).await.is_err() {
                    break;
                }
            }
        }
    }
}
