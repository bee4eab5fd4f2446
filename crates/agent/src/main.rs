//! The in-container agent. Spawned by the host driver over the container
//! runtime's exec pipe; its stdin/stdout carry the multiplexer and nothing
//! else.

mod logging;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use apf_common::{AGENT_PATH, Result};
use apf_manager::{Manager, ShutdownHook};
use apf_mux::MuxSession;
use apf_proxy::{ProxyForwarder, ProxyListener};
use apf_scanner::ListenerScanner;

#[tokio::main]
async fn main() {
    // A single flag; not worth an argument parser inside the container.
    let debug = std::env::args().skip(1).any(|arg| arg == "-d");
    logging::init(debug);

    info!("agent starting");
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("agent failed: {e}");
            1
        }
    };
    info!("agent stopping");

    // The bootstrap archive put us at a fixed path; leave nothing behind.
    let _ = std::fs::remove_file(AGENT_PATH);
    std::process::exit(code);
}

async fn run() -> Result<()> {
    let mut session = MuxSession::over_stdio();

    // Stream order mirrors the host driver's accept order: its receiving
    // stream first (our sending side), then its sending stream.
    let outbound = session.open().await?;
    let inbound = session.open().await?;

    let listener = Arc::new(ProxyListener::new(session.opener()));
    let control = session.control();
    let hook: ShutdownHook = Box::new(move || Box::pin(async move { control.shutdown().await }));
    let manager = Manager::new(listener.clone(), None, hook);
    manager.run(inbound, outbound);

    let (ports_tx, mut ports_rx) = mpsc::channel(16);
    tokio::spawn(ListenerScanner::new().run(ports_tx));
    {
        let manager = manager.clone();
        let listener = listener.clone();
        tokio::spawn(async move {
            while let Some(ports) = ports_rx.recv().await {
                // Skip ports owned by our own forward listeners, otherwise
                // every host-requested forward would echo straight back.
                let announce: Vec<u16> = ports
                    .into_iter()
                    .filter(|port| !listener.port_in_use(*port))
                    .collect();
                if manager.update_peer_ports(&announce).await.is_err() {
                    debug!("peer update failed, scanner consumer stopping");
                    break;
                }
            }
        });
    }

    ProxyForwarder::new(session).run().await;
    Ok(())
}
