//! SPQR Router Service
//!
//! Entry point for client connections. Serves:
//! - PostgreSQL wire protocol (client sessions + spqr-console admin)
//! - Router-local gRPC (routing-map mutations)

use clap::Parser;
use spqr_common::{Config, MemKv, SpqrError};
use spqr_qrouter::{RoutingMap, Shard};
use spqr_router::grpc::LocalQrouterServer;
use spqr_router::{metrics, PgServer, RouterContext, RoutePool};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "spqr-router")]
#[command(about = "SPQR Router - PostgreSQL sharding proxy")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, env = "SPQR_CONFIG")]
    config: Option<String>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    spqr_common::telemetry::init(&args.log_level);

    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let config = match args.config.as_deref() {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config {}: {}", path, e);
                return 1;
            }
        },
        None => Config::default(),
    };

    info!("starting SPQR router");
    info!("  listen address: {}", config.listen_addr);
    info!("  gRPC address: {}", config.grpc_addr);
    info!("  shards configured: {}", config.shards.len());

    let kv = Arc::new(MemKv::new());
    let map = match RoutingMap::load(kv, config.world_mode).await {
        Ok(map) => Arc::new(map),
        Err(SpqrError::StorageUnavailable(e)) => {
            error!("KV store unreachable at start: {}", e);
            return 2;
        }
        Err(e) => {
            error!("failed to load routing map: {}", e);
            return 1;
        }
    };

    // Seed statically configured shards that storage does not know yet.
    for shard in &config.shards {
        let known = map.snapshot().shards.iter().any(|s| s.id == shard.id);
        if !known {
            if let Err(e) = map
                .add_shard(Shard {
                    id: shard.id.clone(),
                    hosts: shard.hosts.clone(),
                    world: shard.world,
                })
                .await
            {
                error!("failed to register shard {}: {}", shard.id, e);
                return 1;
            }
        }
    }

    let pool = Arc::new(RoutePool::new(map.clone(), config.pool.clone()));
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel(1);

    let ctx = match RouterContext::new(&config, map.clone(), pool.clone(), shutdown_tx) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!("router startup failed: {}", e);
            return 1;
        }
    };

    let pg_ctx = ctx.clone();
    let listen_addr = config.listen_addr;
    let pg_handle = tokio::spawn(async move {
        let server = PgServer::new(pg_ctx);
        if let Err(e) = server.start(listen_addr).await {
            error!("PostgreSQL listener error: {}", e);
        }
    });

    let grpc_addr = config.grpc_addr;
    let grpc_server = LocalQrouterServer::new(map.clone(), pool.clone());
    let grpc_handle = tokio::spawn(async move {
        if let Err(e) = grpc_server.serve(grpc_addr).await {
            error!("gRPC listener error: {}", e);
        }
    });

    info!("SPQR router started");

    let signalled = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            true
        }
        _ = shutdown_rx.recv() => {
            info!("console shutdown received");
            false
        }
        _ = pg_handle => false,
        _ = grpc_handle => false,
    };

    pool.shutdown().await;

    let outstanding = metrics::ACTIVE_SESSIONS.get();
    if signalled && outstanding > 0 {
        info!("terminated with {} outstanding sessions", outstanding);
        return 3;
    }
    0
}
