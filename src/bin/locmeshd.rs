//! The locmesh daemon: joins the overlay, serves the protocol on a TCP
//! port and runs the background maintenance until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use locmesh::config::NodeConfig;
use locmesh::dispatch::{self, TcpConnector};
use locmesh::logging;
use locmesh::node::{EngineSettings, MaintenancePeriods, Node};
use locmesh::snapshot::PeerSnapshot;
use locmesh::store::SpatialStore;

#[derive(Parser, Debug)]
#[command(name = "locmeshd", about = "Location-based overlay network node")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the configured latitude.
    #[arg(long)]
    latitude: Option<f64>,

    /// Override the configured longitude.
    #[arg(long)]
    longitude: Option<f64>,

    /// Run with test-mode timeouts.
    #[arg(long)]
    test_mode: bool,
}

#[tokio::main]
async fn main() -> Result<(), locmesh::Error> {
    let args = Args::parse();

    let mut config = NodeConfig::load(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(latitude) = args.latitude {
        config.latitude = latitude;
    }
    if let Some(longitude) = args.longitude {
        config.longitude = longitude;
    }
    if args.test_mode {
        config.test_mode = true;
    }

    let _log_guard = logging::init(config.log_path.as_deref());

    let own_info = config.node_info()?;
    info!(node = %own_info, "starting locmesh node");

    let store = Arc::new(SpatialStore::new(own_info.clone(), config.db_expiration()));
    if let Some(db_path) = &config.db_path {
        if db_path.exists() {
            match PeerSnapshot::load_from_file(db_path) {
                Ok(snapshot) => {
                    let restored = snapshot.restore(&store).await;
                    info!(restored, saved_at = %snapshot.saved_at(), "restored peer snapshot");
                }
                Err(error) => warn!(%error, "could not load peer snapshot"),
            }
        }
    }

    let connector = TcpConnector::new(config.request_expiration());
    let node = Node::new(
        own_info.clone(),
        Arc::clone(&store),
        connector.clone(),
        config.seed_endpoints()?,
        EngineSettings {
            neighbourhood_target_size: config.neighbourhood_target_size,
            bubble: config.bubble,
        },
    );

    // Accept*/Renew* replies tell us how the world sees our address.
    {
        let weak = Arc::downgrade(&node);
        connector.set_detected_ip_callback(Arc::new(move |address: String| {
            if let Some(node) = weak.upgrade() {
                tokio::spawn(async move { node.learn_own_address(&address).await });
            }
        }));
    }

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "listening");

    let server = tokio::spawn(dispatch::serve(
        listener,
        Arc::clone(&node),
        config.request_expiration(),
    ));

    match node.init().await {
        Ok(()) => info!("network discovery finished"),
        Err(error) => {
            warn!(%error, "network discovery failed, will keep retrying");
            node.spawn_bootstrap_retry(config.discovery_period());
        }
    }

    let maintenance = node.start_maintenance(MaintenancePeriods {
        renewal: config.renewal_period(),
        db_maintenance: config.db_maintenance_period(),
        discovery: config.discovery_period(),
    });

    wait_for_shutdown().await;
    info!("shutdown requested");

    server.abort();
    for task in maintenance {
        task.abort();
    }

    if let Some(db_path) = &config.db_path {
        let snapshot = PeerSnapshot::capture(&store).await;
        match snapshot.save_to_file(db_path) {
            Ok(()) => info!(peers = snapshot.peer_count(), "saved peer snapshot"),
            Err(error) => error!(%error, "failed to save peer snapshot"),
        }
    }

    info!("finished");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
