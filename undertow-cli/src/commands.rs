//! CLI command implementations

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Subcommand;
use tokio_util::sync::CancellationToken;
use undertow_core::config::UndertowConfig;
use undertow_core::engine::{
    DownloadManagerHandle, ManagerDeps, SimulatedSessionFactory, SimulatedSwarm,
    spawn_download_manager,
};
use undertow_core::health::{
    DhtHealthManager, HealthChecker, HealthCheckerHandle, create_tracker_session,
    spawn_health_checker,
};
use undertow_core::mining::{CreditMiningHandle, MiningDeps, spawn_credit_mining};
use undertow_core::torrent::{InfoHash, NoProgress, TorrentCreator, TorrentDef, merkle_root};
use undertow_core::tunnel::{TunnelDeps, TunnelHandle, UdpEndpoint, spawn_tunnel_community};
use undertow_core::{Notification, Notifier};
use undertow_web::AppState;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the node: downloads, tunnels, health checks, credit mining and REST API
    Serve {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// REST API port, overriding the configuration
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Create a .torrent file from files or directories
    Create {
        /// Files or directories to include
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Piece length in bytes; chosen from the payload size when omitted
        #[arg(long)]
        piece_length: Option<u64>,
        /// Tracker announce URL, may be repeated
        #[arg(long = "tracker")]
        trackers: Vec<String>,
        /// Store a Merkle root hash instead of the piece list
        #[arg(long)]
        merkle: bool,
        /// Torrent name, defaults to the first path's name
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        comment: Option<String>,
        /// Where to write the torrent
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Scrape one tracker for swarm sizes
    Scrape {
        /// http(s):// or udp:// announce URL
        tracker: String,
        /// Hex infohashes
        #[arg(required = true)]
        infohashes: Vec<String>,
        /// Seconds to wait for the tracker
        #[arg(long, default_value = "15")]
        timeout: u64,
    },
    /// Print the Merkle root over a torrent's piece hashes
    MerkleRoot {
        /// Path to a .torrent file
        torrent: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the first failure of the command; `serve` fails only on
/// unrecoverable initialization errors.
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve { config, port } => serve(config, port).await,
        Commands::Create {
            paths,
            piece_length,
            trackers,
            merkle,
            name,
            comment,
            output,
        } => {
            let mut creator = TorrentCreator::new()
                .piece_length(piece_length.unwrap_or(0))
                .trackers(trackers)
                .merkle(merkle);
            for path in paths {
                creator = creator.add_path(path);
            }
            if let Some(name) = name {
                creator = creator.name(name);
            }
            if let Some(comment) = comment {
                creator = creator.comment(comment);
            }
            create_torrent(creator, output).await
        }
        Commands::Scrape {
            tracker,
            infohashes,
            timeout,
        } => scrape(tracker, infohashes, Duration::from_secs(timeout)).await,
        Commands::MerkleRoot { torrent } => print_merkle_root(torrent),
    }
}

/// Running node components, shut down in reverse start order.
struct Node {
    engine: DownloadManagerHandle,
    health: HealthCheckerHandle,
    tunnel: Option<TunnelHandle>,
    mining: Option<CreditMiningHandle>,
    notifier: Notifier,
}

impl Node {
    async fn shutdown(self) {
        let notify = |text: &str| {
            self.notifier.notify(Notification::ShutdownState {
                text: text.to_string(),
            });
        };

        if let Some(mining) = &self.mining {
            notify("Stopping credit mining...");
            if let Err(e) = mining.shutdown().await {
                tracing::warn!("Credit mining shutdown failed: {}", e);
            }
        }
        if let Some(tunnel) = &self.tunnel {
            notify("Closing circuits...");
            if let Err(e) = tunnel.shutdown().await {
                tracing::warn!("Tunnel shutdown failed: {}", e);
            }
        }
        notify("Stopping health checks...");
        if let Err(e) = self.health.shutdown().await {
            tracing::warn!("Health checker shutdown failed: {}", e);
        }
        notify("Saving download state...");
        if let Err(e) = self.engine.shutdown().await {
            tracing::warn!("Download manager shutdown failed: {}", e);
        }
    }
}

fn load_config(path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<UndertowConfig> {
    let mut config = match path {
        Some(path) => UndertowConfig::load(&path)?,
        None => UndertowConfig::default(),
    };
    config.apply_env();
    config.sanitize();
    if let Some(port) = port {
        config.http_api.port = port;
    }
    config.ensure_state_dir()?;
    Ok(config)
}

async fn serve(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let notifier = Notifier::new();
    let config = match load_config(config_path, port) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {:#}", e);
            notifier.notify(Notification::ConfigError {
                message: e.to_string(),
            });
            return Err(e);
        }
    };
    tracing::info!("Starting Undertow with state in {}", config.state_dir.display());

    let dht_health = Arc::new(DhtHealthManager::new());
    let deps = ManagerDeps::new(Arc::new(SimulatedSessionFactory::new(SimulatedSwarm::new())))
        .with_notifier(notifier.clone())
        .with_dht_health(Arc::clone(&dht_health));
    let engine = spawn_download_manager(config.clone(), deps);
    let checkpoints = engine
        .load_checkpoints()
        .await
        .context("failed to restore downloads")?;
    tracing::info!("Restored {} of {} downloads", checkpoints.loaded, checkpoints.total);

    let checker = HealthChecker::new(config.health.clone(), notifier.clone())
        .with_dht(dht_health, Arc::new(engine.clone()));
    let health = spawn_health_checker(checker);

    let tunnel = if config.tunnel.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.tunnel.listen_port));
        let (endpoint, inbox) = UdpEndpoint::bind(addr)
            .await
            .context("failed to bind overlay endpoint")?;
        let deps = TunnelDeps::new(Arc::new(endpoint), inbox).with_notifier(notifier.clone());
        let tunnel = spawn_tunnel_community(config.tunnel.clone(), deps);
        tunnel.monitor_downloads(engine.clone()).await?;
        Some(tunnel)
    } else {
        None
    };

    let mining = if config.credit_mining.enabled {
        let deps = MiningDeps::new(engine.clone(), config.mining_dir())
            .with_health(health.clone())
            .with_notifier(notifier.clone());
        Some(spawn_credit_mining(config.credit_mining.clone(), deps)?)
    } else {
        None
    };

    let node = Node {
        engine: engine.clone(),
        health,
        tunnel,
        mining,
        notifier,
    };

    let stop = CancellationToken::new();
    let api = if config.http_api.enabled {
        let addr: SocketAddr = format!("{}:{}", config.http_api.host, config.http_api.port)
            .parse()
            .context("invalid REST API address")?;
        let state = AppState::new(engine, config.libtorrent.download_defaults.clone());
        let shutdown = stop.clone().cancelled_owned();
        Some(tokio::spawn(undertow_web::run_server(addr, state, shutdown)))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    stop.cancel();
    if let Some(api) = api {
        match api.await {
            Ok(Err(e)) => tracing::warn!("REST API stopped with error: {}", e),
            Err(e) => tracing::warn!("REST API task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    node.shutdown().await;
    Ok(())
}

async fn create_torrent(creator: TorrentCreator, output: PathBuf) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let created = creator.build(&cancel, Arc::new(NoProgress)).await?;
    created.save(&output).await?;
    println!("Created {}", output.display());
    println!("  Name:     {}", created.torrent_def.name());
    println!("  Infohash: {}", created.infohash);
    println!("  Pieces:   {}", created.torrent_def.number_of_pieces());
    Ok(())
}

async fn scrape(tracker: String, infohashes: Vec<String>, timeout: Duration) -> anyhow::Result<()> {
    let mut session = create_tracker_session(&tracker, timeout, &[])?;
    for value in &infohashes {
        let infohash = InfoHash::from_hex(value)?;
        if !session.can_add_request() {
            bail!("{tracker} accepts at most {} infohashes per scrape", session.infohashes().len());
        }
        session.add_infohash(infohash)?;
    }

    let response = session.connect_to_tracker().await?;
    println!("{}", response.url);
    for result in &response.results {
        println!(
            "  {}  seeders={} leechers={}",
            result.infohash, result.seeders, result.leechers
        );
    }
    Ok(())
}

fn print_merkle_root(path: PathBuf) -> anyhow::Result<()> {
    let def = TorrentDef::load(&path)?;
    let root = match def.root_hash() {
        Some(root) => root,
        None => merkle_root(def.piece_hashes()),
    };
    println!("{}", hex::encode(root));
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
    }

    #[test]
    fn test_parse_create_arguments() {
        let cli = TestCli::try_parse_from([
            "undertow",
            "create",
            "a.mkv",
            "b.srt",
            "--tracker",
            "udp://t1.example:6969/announce",
            "--tracker",
            "http://t2.example/announce",
            "--merkle",
            "-o",
            "out.torrent",
        ])
        .unwrap();
        match cli.command {
            Commands::Create {
                paths,
                trackers,
                merkle,
                output,
                piece_length,
                ..
            } => {
                assert_eq!(paths.len(), 2);
                assert_eq!(trackers.len(), 2);
                assert!(merkle);
                assert_eq!(output, PathBuf::from("out.torrent"));
                assert_eq!(piece_length, None);
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn test_scrape_requires_infohash() {
        assert!(TestCli::try_parse_from(["undertow", "scrape", "udp://t.example:1/a"]).is_err());
    }

    #[tokio::test]
    async fn test_create_then_merkle_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let payload = dir.path().join("movie.bin");
        std::fs::write(&payload, vec![7u8; 100_000]).unwrap();
        let output = dir.path().join("movie.torrent");

        let creator = TorrentCreator::new()
            .add_path(&payload)
            .piece_length(16 * 1024)
            .merkle(true);
        create_torrent(creator, output.clone()).await.unwrap();

        let def = TorrentDef::load(&output).unwrap();
        assert!(def.root_hash().is_some());
        print_merkle_root(output).unwrap();
    }

    #[test]
    fn test_load_config_applies_port_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("undertow.json");
        let state = dir.path().join("state");
        std::fs::write(
            &path,
            format!(r#"{{"state_dir": {:?}, "http_api": {{"port": 8085}}}}"#, state),
        )
        .unwrap();

        let config = load_config(Some(path), Some(9090)).unwrap();
        assert_eq!(config.http_api.port, 9090);
        assert!(state.exists());

        let missing = load_config(Some(dir.path().join("missing.json")), None);
        assert!(missing.is_err());
    }
}
