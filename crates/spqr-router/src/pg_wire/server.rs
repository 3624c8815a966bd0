//! PostgreSQL wire protocol listener
//!
//! Accepts client connections and runs each session on its own task.

use super::connection::{configure_tcp_keepalive, handle_connection};
use crate::metrics;
use crate::route_pool::{RouteKey, RoutePool};
use spqr_common::{Config, BackendRule, FrontendRule, Result, SpqrError, SslMode};
use spqr_qrouter::RoutingMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Shared state every client session sees
pub struct RouterContext {
    pub map: Arc<RoutingMap>,
    pub pool: Arc<RoutePool>,
    frontend_rules: HashMap<RouteKey, FrontendRule>,
    backend_rules: HashMap<RouteKey, BackendRule>,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub ssl_policy: SslMode,
    /// Console SHUTDOWN statements signal the process through this
    pub shutdown: mpsc::Sender<()>,
}

impl RouterContext {
    pub fn new(
        config: &Config,
        map: Arc<RoutingMap>,
        pool: Arc<RoutePool>,
        shutdown: mpsc::Sender<()>,
    ) -> Result<Self> {
        let frontend_rules = config
            .frontend_rules
            .iter()
            .map(|r| (RouteKey::new(&r.user, &r.database), r.clone()))
            .collect();
        let backend_rules = config
            .backend_rules
            .iter()
            .map(|r| (RouteKey::new(&r.user, &r.database), r.clone()))
            .collect();

        let tls_acceptor = match (&config.tls.cert_path, &config.tls.key_path) {
            (Some(cert), Some(key)) => {
                let material = spqr_common::TlsConfig::from_pem_files(cert, key)?;
                let server_config = spqr_common::create_server_tls_config(&material)?;
                Some(TlsAcceptor::from(Arc::new(server_config)))
            }
            _ if config.tls.mode == SslMode::Require => {
                return Err(SpqrError::Internal(
                    "ssl mode require needs cert_path and key_path".into(),
                ))
            }
            _ => None,
        };

        Ok(Self {
            map,
            pool,
            frontend_rules,
            backend_rules,
            tls_acceptor,
            ssl_policy: config.tls.mode,
            shutdown,
        })
    }

    /// Frontend + backend rules for a route key, if configured.
    pub fn rules_for(&self, key: &RouteKey) -> Option<(FrontendRule, BackendRule)> {
        let fr = self.frontend_rules.get(key)?.clone();
        let be = self.backend_rules.get(key)?.clone();
        Some((fr, be))
    }

    /// Databases reachable through the configured frontend rules.
    pub fn databases(&self) -> Vec<String> {
        let mut dbs: Vec<String> = self
            .frontend_rules
            .keys()
            .map(|k| k.database.clone())
            .collect();
        dbs.sort();
        dbs.dedup();
        dbs
    }
}

/// The client-facing listener
pub struct PgServer {
    ctx: Arc<RouterContext>,
}

impl PgServer {
    pub fn new(ctx: Arc<RouterContext>) -> Self {
        Self { ctx }
    }

    pub async fn start(&self, addr: SocketAddr) -> Result<()> {
        let tls_status = if self.ctx.tls_acceptor.is_some() {
            "TLS enabled"
        } else {
            "TLS disabled"
        };
        info!("PostgreSQL wire listener on {} ({})", addr, tls_status);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| SpqrError::Internal(format!("bind {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        // Export the backend pool gauges on a slow tick.
        let pool_for_metrics = self.ctx.pool.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                for (shard, (idle, busy)) in pool_for_metrics.shard_stats().await {
                    metrics::update_backend_pool_size(&shard, idle, busy);
                }
            }
        });

        loop {
            let (socket, peer_addr) = listener.accept().await?;
            debug!("new connection from {}", peer_addr);

            configure_tcp_keepalive(&socket, 60);

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, ctx).await {
                    let text = e.to_string();
                    if text.contains("early eof") || text.contains("connection reset") {
                        debug!("client disconnected: {}", text);
                    } else {
                        error!("session error: {}", text);
                    }
                }
            });
        }
    }
}
