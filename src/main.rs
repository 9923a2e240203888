//! Edge cluster coordinator.
//!
//! Runs a fleet of edge router nodes in one process, sharing an in-memory KV
//! store. One node is elected leader and publishes the routing table; every
//! node keeps a synchronized copy of it.
//!
//! # Architecture Overview
//!
//! ```text
//!   routing file ──notify──▶ RoutingWatcher ──▶ latest routes (watch channel)
//!                                                     │
//!             ┌───────────────────────────────────────┼──────────────────┐
//!             ▼                                       ▼                  ▼
//!      ┌────────────┐                          ┌────────────┐     ┌────────────┐
//!      │  node 1    │                          │  node 2    │ ... │  node N    │
//!      │ Leadership │── elected ──▶ begin/commit│ Leadership │     │ Leadership │
//!      │ Datastore  │                          │ Datastore  │     │ Datastore  │
//!      └─────┬──────┘                          └─────┬──────┘     └─────┬──────┘
//!            └─────────────────── MemoryStore ───────┴──────────────────┘
//!                            <prefix>, <prefix>/lock, <prefix>/leader
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use edge_cluster::cluster::{Datastore, Leadership, Role};
use edge_cluster::config::{load_config, load_routing, ClusterConfig, RoutingConfig, RoutingWatcher};
use edge_cluster::kv::{KvSource, MemoryStore, Store};
use edge_cluster::lifecycle::{shutdown_signal, Pool};
use edge_cluster::observability::{init_logging, init_metrics};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "edge-cluster")]
#[command(about = "Coordinates routing configuration across a fleet of edge routers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process fleet until Ctrl+C
    Run {
        /// Node configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Routing table published by the leader
        #[arg(short, long)]
        routes: PathBuf,

        /// Number of nodes in the fleet
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,
    },
    /// Validate configuration files and exit
    Check {
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(short, long)]
        routes: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, routes, nodes } => run(config.as_deref(), &routes, nodes).await,
        Commands::Check { config, routes } => check(config.as_deref(), &routes),
    }
}

fn node_config(path: Option<&Path>) -> Result<ClusterConfig, BoxError> {
    Ok(match path {
        Some(path) => load_config(path)?,
        None => ClusterConfig::default(),
    })
}

fn check(config: Option<&Path>, routes: &Path) -> Result<(), BoxError> {
    let config = node_config(config)?;
    let routing = load_routing(routes)?;
    println!(
        "ok: node {} on prefix {}, {} routes, {} backends",
        config.node,
        config.store.prefix,
        routing.routes.len(),
        routing.backends.len()
    );
    Ok(())
}

async fn run(config: Option<&Path>, routes: &Path, nodes: usize) -> Result<(), BoxError> {
    let config = node_config(config)?;
    init_logging(&config.observability)?;

    tracing::info!("edge-cluster v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        init_metrics(addr)?;
    }

    let routing = load_routing(routes)?;
    tracing::info!(
        prefix = %config.store.prefix,
        nodes,
        routes = routing.routes.len(),
        "Configuration loaded"
    );

    let store = MemoryStore::new();
    let pool = Pool::new();

    let (watcher, latest) = RoutingWatcher::new(routes, routing);
    let _watcher = watcher.watch()?;

    for i in 0..nodes.max(1) {
        let name = if nodes <= 1 {
            config.node.clone()
        } else {
            format!("{}-{}", config.node, i + 1)
        };
        let kv = KvSource::new(Arc::new(store.clone()), config.store.prefix.clone());
        let datastore =
            Datastore::in_pool(&pool, kv.clone(), RoutingConfig::default(), config.datastore.clone()).await?;
        let leadership = Leadership::new(kv, name, config.leadership.clone());
        let roles = leadership.participate(&pool)?;

        let node = Node {
            datastore,
            leadership,
            routes: latest.clone(),
        };
        pool.go(|stop| node.run(roles, stop));
    }

    shutdown_signal().await?;
    pool.stop().await;

    for pair in store.list(&config.store.prefix).await? {
        println!("{} = {}", pair.key, String::from_utf8_lossy(&pair.value));
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

struct Node {
    datastore: Datastore<RoutingConfig>,
    leadership: Leadership,
    routes: watch::Receiver<RoutingConfig>,
}

impl Node {
    async fn run(mut self, mut roles: mpsc::UnboundedReceiver<Role>, stop: CancellationToken) {
        let mut changes = self.datastore.subscribe();

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                role = roles.recv() => match role {
                    Some(Role::Leader) => self.publish().await,
                    Some(Role::Follower) => {}
                    None => return,
                },
                changed = self.routes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if self.leadership.is_leader() {
                        self.publish().await;
                    }
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let routing = changes.borrow_and_update().clone();
                    tracing::info!(
                        node = %self.leadership.node(),
                        routes = routing.routes.len(),
                        backends = routing.backends.len(),
                        "Routing configuration updated"
                    );
                }
            }
        }
    }

    async fn publish(&mut self) {
        let routing = self.routes.borrow_and_update().clone();
        let mut tx = match self.datastore.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                tracing::error!(node = %self.leadership.node(), error = %err, "Cannot start routing transaction");
                return;
            }
        };
        match tx.commit(routing).await {
            Ok(()) => tracing::info!(node = %self.leadership.node(), "Routing configuration published"),
            Err(err) => {
                tracing::error!(node = %self.leadership.node(), error = %err, "Cannot publish routing configuration")
            }
        }
    }
}
