//! The host driver: copies the agent into a running container, spawns it
//! over the runtime's exec pipe, and keeps both sides' listening ports
//! mirrored until interrupted.

mod bootstrap;
mod logging;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use apf_common::{Error, Result};
use apf_manager::{Manager, ShutdownHook, dump_to_stderr};
use apf_mux::MuxSession;
use apf_proxy::{ProxyForwarder, ProxyListener};

use bootstrap::ContainerRuntime;

#[derive(Parser, Debug)]
#[command(
    name = "apf",
    version,
    about = "Automatic bidirectional TCP port forwarding for containers",
    after_help = "Examples:\n    apf cafe1234\n    apf -k staging/web-0\n    apf -r 8080,9090 cafe1234"
)]
struct Cli {
    /// Target is a Kubernetes pod; ID is "namespace/pod"
    #[arg(short = 'k')]
    kubernetes: bool,

    /// Target is a Podman container
    #[arg(short = 'p', conflicts_with = "kubernetes")]
    podman: bool,

    /// Log debug info to /tmp/autoportforward.log
    #[arg(short = 'd')]
    debug: bool,

    /// Comma separated list of host ports to forward into the container,
    /// e.g. 8080,9090
    #[arg(short = 'r', value_delimiter = ',', value_name = "PORTS")]
    reverse: Vec<u16>,

    /// Container ID (or namespace/pod with -k)
    #[arg(value_name = "ID")]
    target: String,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };
    logging::init(cli.debug);

    if let Err(e) = run(cli).await {
        error!("{e}");
        eprintln!("apf: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let runtime = if cli.kubernetes {
        ContainerRuntime::Kubernetes
    } else if cli.podman {
        ContainerRuntime::Podman
    } else {
        ContainerRuntime::Docker
    };
    let target = bootstrap::Target::parse(runtime, &cli.target)?;

    bootstrap::install_agent(&target).await?;

    let mut session = MuxSession::spawn(bootstrap::agent_command(&target, cli.debug))?;
    print_prelude();

    // The agent opens the two control streams in a fixed order: our
    // receiving stream first, our sending stream second.
    let missing_streams = || Error::Protocol("agent did not open the control streams".into());
    let inbound = session.accept().await.ok_or_else(missing_streams)?;
    let outbound = session.accept().await.ok_or_else(missing_streams)?;

    let listener = Arc::new(ProxyListener::new(session.opener()));
    let control = session.control();
    let hook: ShutdownHook = Box::new(move || Box::pin(async move { control.shutdown().await }));
    let manager = Manager::new(
        listener.clone(),
        Some(Box::new(dump_to_stderr)),
        hook,
    );
    manager.run(inbound, outbound);

    {
        let manager = manager.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted");
                manager.shutdown().await;
            }
        });
    }

    if !cli.reverse.is_empty() {
        manager.update_peer_ports(&cli.reverse).await?;
    }

    ProxyForwarder::new(session).run().await;
    eprintln!();
    Ok(())
}

fn print_prelude() {
    println!();
    println!("*  ==> : forwarding local listening ports to (==>) container ports");
    println!("*  <== : forwarding to local ports from (<==) container listening ports (-r option)");
    println!();
}
