// Strata agent: domain check-in, NAT punch, silent node removal, and the avatar bot.

mod bot;
mod config;
mod protocols;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use strata_core::{Endpoint, NodeKind, NodeList};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("strata-agent {}", VERSION);
                return Ok(());
            }
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load(config_path.as_deref())?;
    let domain = Endpoint::resolve(&cfg.domain_host, cfg.domain_port)
        .with_context(|| format!("resolving domain {}", cfg.domain_host))?;
    tracing::info!(version = VERSION, %domain, listen_port = cfg.listen_port, "starting");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, domain))
}

async fn run(cfg: config::Config, domain: Endpoint) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("binding UDP port {}", cfg.listen_port))?;
    let socket = Arc::new(socket);
    let nodes: protocols::SharedNodeList = Arc::new(Mutex::new(
        NodeList::new(NodeKind::Avatar).with_interests([NodeKind::AvatarMixer, NodeKind::AudioMixer]),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = vec![
        tokio::spawn(protocols::check_in_loop(
            nodes.clone(),
            socket.clone(),
            domain,
            cfg.listen_port,
            cfg.local_address,
            cfg.check_in_interval(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(protocols::silent_sweep_loop(
            nodes.clone(),
            cfg.silence_timeout(),
            protocols::SILENT_SWEEP_INTERVAL,
            shutdown_rx.clone(),
        )),
        tokio::spawn(protocols::ping_loop(
            nodes.clone(),
            socket.clone(),
            cfg.ping_interval(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(protocols::recv_loop(nodes.clone(), socket.clone(), shutdown_rx)),
    ];

    bot::run(nodes.clone(), socket, cfg.data_send_interval(), async {
        if let Err(e) = shutdown_signal().await {
            tracing::warn!(error = %e, "signal handler failed, stopping");
        }
    })
    .await;

    let _ = shutdown_tx.send(true);
    for h in handles {
        if let Err(e) = h.await {
            tracing::warn!(error = %e, "task ended abnormally");
        }
    }
    let stats = nodes.lock().await.stats();
    tracing::info!(
        nodes = stats.nodes,
        active = stats.active,
        packets = stats.packets_dispatched,
        silent_removals = stats.silent_removals,
        "stopped"
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
