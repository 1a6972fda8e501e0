// dfs node: key-addressed blob store that replicates store intents to its peers.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dfs_core::{
    FileServer, FileServerOpts, Handshake, LengthPrefixDecoder, NopHandshake, PathTransform,
    TcpTransport, TcpTransportOpts, Transport, VersionHandshake,
};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, HandshakeKind};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("dfs-node {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load(config_path.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let handshake: Arc<dyn Handshake> = match cfg.handshake {
        HandshakeKind::Nop => Arc::new(NopHandshake),
        HandshakeKind::Version => Arc::new(VersionHandshake::default()),
    };
    let mut opts = TcpTransportOpts::new(cfg.listen_addr.clone());
    opts.handshake = handshake;
    opts.decoder = Arc::new(LengthPrefixDecoder::new(cfg.max_frame_len));
    let transport = Arc::new(TcpTransport::new(opts));

    let storage_root = cfg.storage_root();
    tracing::info!(
        listen_addr = %cfg.listen_addr,
        storage_root = %storage_root.display(),
        bootstrap = ?cfg.bootstrap_nodes(),
        "starting dfs node"
    );
    let server = Arc::new(FileServer::new(FileServerOpts {
        storage_root,
        path_transform: PathTransform::new(cfg.shard_width),
        transport: transport.clone(),
        bootstrap_nodes: cfg.bootstrap_nodes(),
    }));

    let runner = server.clone();
    let mut task = tokio::spawn(async move { runner.start().await });
    tokio::select! {
        res = &mut task => {
            res.context("file server task panicked")?
                .context("file server failed")?;
            return Ok(());
        }
        sig = shutdown_signal() => sig?,
    }

    tracing::info!(peers = server.peer_count(), "shutting down");
    server.stop();
    transport.close().await?;
    task.await
        .context("file server task panicked")?
        .context("file server failed")?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
