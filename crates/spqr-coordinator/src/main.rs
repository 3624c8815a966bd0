//! SPQR Coordinator Service
//!
//! Serves the key-range lifecycle API: lock, unlock, split, merge, and
//! move operations with persisted status records.

use clap::Parser;
use spqr_common::proto::balancer_service_server::BalancerServiceServer;
use spqr_common::proto::key_range_service_server::KeyRangeServiceServer;
use spqr_common::proto::operation_service_server::OperationServiceServer;
use spqr_common::proto::shard_service_server::ShardServiceServer;
use spqr_common::proto::sharding_rules_service_server::ShardingRulesServiceServer;
use spqr_common::{MemKv, SpqrError};
use spqr_coordinator::{OperationRegistry, SpqrCoordinator};
use spqr_qrouter::RoutingMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "spqr-coordinator")]
#[command(about = "SPQR Coordinator - key range lifecycle control plane")]
struct Args {
    /// gRPC listen address
    #[arg(long, env = "COORDINATOR_ADDR", default_value = "0.0.0.0:7001")]
    addr: SocketAddr,

    /// Route predicate-free statements to world shards
    #[arg(long, env = "WORLD_MODE", default_value = "false")]
    world_mode: bool,

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
    info!("starting SPQR coordinator on {}", args.addr);

    let kv = Arc::new(MemKv::new());

    let map = match RoutingMap::load(kv.clone(), args.world_mode).await {
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

    let registry = match OperationRegistry::load(kv).await {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("failed to load operation registry: {}", e);
            return 2;
        }
    };

    let coordinator = SpqrCoordinator::new(map, registry);

    let serve = tonic::transport::Server::builder()
        .add_service(KeyRangeServiceServer::new(coordinator.clone()))
        .add_service(ShardServiceServer::new(coordinator.clone()))
        .add_service(ShardingRulesServiceServer::new(coordinator.clone()))
        .add_service(OperationServiceServer::new(coordinator.clone()))
        .add_service(BalancerServiceServer::new(coordinator))
        .serve(args.addr);

    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                error!("coordinator gRPC server error: {}", e);
                return 1;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    0
}
