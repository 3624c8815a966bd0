//! SPQR Balancer Service
//!
//! Single background loop per installation; talks to the coordinator
//! for key-range operations and to shards for load statistics.

use clap::Parser;
use spqr_balancer::{Balancer, CoordinatorClient};
use spqr_common::{BackendRule, BalancerSettings, SslMode};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "spqr-balancer")]
#[command(about = "SPQR Balancer - shard load equalization loop")]
struct Args {
    /// Coordinator gRPC endpoint
    #[arg(long, env = "COORDINATOR_ADDR", default_value = "http://localhost:7001")]
    coordinator_addr: String,

    /// User presented to shards for the statistics query
    #[arg(long, env = "STATS_USER", default_value = "spqr")]
    stats_user: String,

    /// Database holding the spqr.range_stats view
    #[arg(long, env = "STATS_DATABASE", default_value = "postgres")]
    stats_database: String,

    /// Password for the statistics user
    #[arg(long, env = "STATS_PASSWORD")]
    stats_password: Option<String>,

    /// Seconds between balancing cycles
    #[arg(long, env = "BALANCER_PERIOD_SECS", default_value = "30")]
    period_secs: u64,

    /// Relative band around the mean load that counts as balanced
    #[arg(long, env = "BALANCER_EPSILON", default_value = "0.1")]
    epsilon: f64,

    /// Minimum variance improvement required to act
    #[arg(long, env = "BALANCER_THETA", default_value = "0.0")]
    theta: f64,

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
    info!("starting SPQR balancer, coordinator at {}", args.coordinator_addr);

    let client = match CoordinatorClient::connect(&args.coordinator_addr, 3).await {
        Ok(client) => client,
        Err(e) => {
            error!("failed to connect to coordinator: {}", e);
            return 1;
        }
    };

    let settings = BalancerSettings {
        period_secs: args.period_secs,
        epsilon: args.epsilon,
        theta: args.theta,
        max_retries: 3,
    };
    let stats_rule = BackendRule {
        user: args.stats_user,
        database: args.stats_database,
        password: args.stats_password,
        ssl_mode: SslMode::Disable,
    };

    let mut balancer = Balancer::new(client, settings, stats_rule);

    tokio::select! {
        _ = balancer.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    0
}
