//! Route pool: (user, database) routes and their backend connection pools
//!
//! A route is created on first client match and owns one bounded pool of
//! backend connections per shard. Connections are exclusively lent;
//! `drain` flushes a shard's connections so a key range can move off it.

use crate::backend::BackendConn;
use spqr_common::{BackendRule, FrontendRule, PoolSettings, Result, SpqrError};
use spqr_qrouter::RoutingMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Identity of a route: the client's (user, database) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub user: String,
    pub database: String,
}

impl RouteKey {
    pub fn new(user: &str, database: &str) -> Self {
        Self {
            user: user.to_string(),
            database: database.to_string(),
        }
    }
}

#[derive(Default)]
struct ShardPool {
    idle: Vec<BackendConn>,
    busy: usize,
    draining: bool,
}

/// Pool statistics for the admin console
#[derive(Debug, Clone)]
pub struct RouteStats {
    pub user: String,
    pub database: String,
    pub clients: usize,
    pub idle_backends: usize,
    pub busy_backends: usize,
}

/// Per-(user, database) routing context: frontend/backend policy plus
/// the backend pools, one per shard.
pub struct Route {
    key: RouteKey,
    be_rule: BackendRule,
    fr_rule: FrontendRule,
    pools: Mutex<HashMap<String, ShardPool>>,
    released: Notify,
    clients: AtomicUsize,
    settings: PoolSettings,
    map: Arc<RoutingMap>,
}

impl Route {
    fn new(
        key: RouteKey,
        be_rule: BackendRule,
        fr_rule: FrontendRule,
        settings: PoolSettings,
        map: Arc<RoutingMap>,
    ) -> Self {
        Self {
            key,
            be_rule,
            fr_rule,
            pools: Mutex::new(HashMap::new()),
            released: Notify::new(),
            clients: AtomicUsize::new(0),
            settings,
            map,
        }
    }

    pub fn key(&self) -> &RouteKey {
        &self.key
    }

    pub fn frontend_rule(&self) -> &FrontendRule {
        &self.fr_rule
    }

    pub fn add_client(&self) {
        self.clients.fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove_client(&self) {
        self.clients.fetch_sub(1, Ordering::SeqCst);
    }

    /// Borrow an idle backend connection to `shard_id`, dialing a new one
    /// while under the per-shard cap. Bounded wait, then PoolExhausted.
    pub async fn acquire(&self, shard_id: &str) -> Result<BackendConn> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.settings.acquire_timeout_ms);

        loop {
            // Register for release notifications before re-checking state
            // so a release between the check and the wait is not missed.
            let released = self.released.notified();
            {
                let mut pools = self.pools.lock().await;
                let pool = pools.entry(shard_id.to_string()).or_default();

                if !pool.draining {
                    if let Some(conn) = pool.idle.pop() {
                        pool.busy += 1;
                        return Ok(conn);
                    }
                    if pool.idle.len() + pool.busy < self.settings.max_per_shard {
                        // Reserve the slot before dialing so concurrent
                        // acquires respect the cap.
                        pool.busy += 1;
                        drop(pools);
                        return match self.dial(shard_id).await {
                            Ok(conn) => Ok(conn),
                            Err(e) => {
                                let mut pools = self.pools.lock().await;
                                if let Some(pool) = pools.get_mut(shard_id) {
                                    pool.busy -= 1;
                                }
                                self.released.notify_waiters();
                                Err(e)
                            }
                        };
                    }
                }
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(SpqrError::PoolExhausted(shard_id.to_string()));
            }
        }
    }

    /// Return a borrowed connection. Draining pools close it instead of
    /// keeping it idle.
    pub async fn release(&self, mut conn: BackendConn) {
        let shard_id = conn.shard_id().to_string();
        let close;
        {
            let mut pools = self.pools.lock().await;
            let pool = pools.entry(shard_id).or_default();
            pool.busy = pool.busy.saturating_sub(1);
            close = pool.draining;
            if !close {
                pool.idle.push(conn);
                self.released.notify_waiters();
                return;
            }
            if pool.busy == 0 {
                pool.draining = false;
            }
        }
        if close {
            conn.close().await;
            self.released.notify_waiters();
        }
    }

    /// Close a borrowed connection instead of returning it; used when
    /// the backend link is broken mid-request.
    pub async fn discard(&self, mut conn: BackendConn) {
        let shard_id = conn.shard_id().to_string();
        conn.close().await;
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get_mut(&shard_id) {
            pool.busy = pool.busy.saturating_sub(1);
            if pool.draining && pool.busy == 0 {
                pool.draining = false;
            }
        }
        self.released.notify_waiters();
    }

    /// Close idle connections to `shard_id` now and mark busy ones to
    /// close on release; resolves once the last busy connection returns.
    pub async fn drain(&self, shard_id: &str, deadline: Duration) -> Result<()> {
        let wait_until = tokio::time::Instant::now() + deadline;

        let idle = {
            let mut pools = self.pools.lock().await;
            let pool = pools.entry(shard_id.to_string()).or_default();
            if pool.busy > 0 {
                pool.draining = true;
            }
            std::mem::take(&mut pool.idle)
        };
        for mut conn in idle {
            conn.close().await;
        }

        loop {
            let released = self.released.notified();
            {
                let pools = self.pools.lock().await;
                match pools.get(shard_id) {
                    Some(pool) if pool.busy > 0 => {}
                    _ => {
                        debug!(shard = %shard_id, user = %self.key.user, "route drained");
                        return Ok(());
                    }
                }
            }
            if tokio::time::timeout_at(wait_until, released).await.is_err() {
                return Err(SpqrError::Timeout(format!("drain of shard {}", shard_id)));
            }
        }
    }

    /// Close every pooled connection; used at shutdown.
    pub async fn close_all(&self) {
        let mut pools = self.pools.lock().await;
        for (_, pool) in pools.iter_mut() {
            for mut conn in pool.idle.drain(..) {
                conn.close().await;
            }
            if pool.busy > 0 {
                pool.draining = true;
            }
        }
    }

    pub async fn stats(&self) -> RouteStats {
        let pools = self.pools.lock().await;
        RouteStats {
            user: self.key.user.clone(),
            database: self.key.database.clone(),
            clients: self.clients.load(Ordering::SeqCst),
            idle_backends: pools.values().map(|p| p.idle.len()).sum(),
            busy_backends: pools.values().map(|p| p.busy).sum(),
        }
    }

    /// Per-shard (idle, busy) connection counts on this route.
    pub(crate) async fn shard_counts(&self) -> Vec<(String, usize, usize)> {
        let pools = self.pools.lock().await;
        pools
            .iter()
            .map(|(shard, pool)| (shard.clone(), pool.idle.len(), pool.busy))
            .collect()
    }

    async fn dial(&self, shard_id: &str) -> Result<BackendConn> {
        let snapshot = self.map.snapshot();
        let shard = snapshot
            .shards
            .iter()
            .find(|s| s.id == shard_id)
            .ok_or_else(|| SpqrError::ShardUnavailable(shard_id.to_string()))?;

        let deadline = Duration::from_millis(self.settings.dial_timeout_ms);
        let mut last_err = SpqrError::ShardUnavailable(format!("{} has no hosts", shard_id));
        // First reachable host wins; later hosts are fallbacks.
        for host in &shard.hosts {
            match BackendConn::dial(shard_id, host, &self.be_rule, deadline).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(shard = %shard_id, host = %host, error = %e, "backend dial failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

/// Keyed map of active routes; creation is single-flight per key.
pub struct RoutePool {
    routes: Mutex<HashMap<RouteKey, Arc<Route>>>,
    settings: PoolSettings,
    map: Arc<RoutingMap>,
}

impl RoutePool {
    pub fn new(map: Arc<RoutingMap>, settings: PoolSettings) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            settings,
            map,
        }
    }

    /// Return the route for `key`, creating it on first match.
    pub async fn match_route(
        &self,
        key: RouteKey,
        be_rule: BackendRule,
        fr_rule: FrontendRule,
    ) -> Arc<Route> {
        let mut routes = self.routes.lock().await;
        routes
            .entry(key.clone())
            .or_insert_with(|| {
                info!(user = %key.user, database = %key.database, "route created");
                Arc::new(Route::new(
                    key,
                    be_rule,
                    fr_rule,
                    self.settings.clone(),
                    self.map.clone(),
                ))
            })
            .clone()
    }

    /// Remove the mapping; a subsequent match creates a fresh route.
    /// Existing holders keep the removed route alive until they finish.
    pub async fn obsolete(&self, key: &RouteKey) -> Option<Arc<Route>> {
        let removed = self.routes.lock().await.remove(key);
        if let Some(ref route) = removed {
            info!(user = %route.key.user, database = %route.key.database, "route obsoleted");
        }
        removed
    }

    /// Drain `shard_id` across every route; used before a range move.
    pub async fn drain_shard(&self, shard_id: &str, deadline: Duration) -> Result<()> {
        let routes: Vec<Arc<Route>> = self.routes.lock().await.values().cloned().collect();
        for route in routes {
            route.drain(shard_id, deadline).await?;
        }
        Ok(())
    }

    /// Close all pooled connections on every route.
    pub async fn shutdown(&self) {
        let routes: Vec<Arc<Route>> = self.routes.lock().await.values().cloned().collect();
        for route in routes {
            route.close_all().await;
        }
    }

    pub async fn stats(&self) -> Vec<RouteStats> {
        let routes: Vec<Arc<Route>> = self.routes.lock().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(routes.len());
        for route in routes {
            stats.push(route.stats().await);
        }
        stats
    }

    /// Pooled backend connections per shard as (idle, busy), summed
    /// across routes; feeds the Prometheus pool gauges.
    pub async fn shard_stats(&self) -> HashMap<String, (usize, usize)> {
        let routes: Vec<Arc<Route>> = self.routes.lock().await.values().cloned().collect();
        let mut totals: HashMap<String, (usize, usize)> = HashMap::new();
        for route in routes {
            for (shard, idle, busy) in route.shard_counts().await {
                let entry = totals.entry(shard).or_default();
                entry.0 += idle;
                entry.1 += busy;
            }
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg_wire::protocol::{read_startup_frame, write_backend, BackendMessage};
    use spqr_common::{AuthMethod, MemKv, PoolSettings, SslMode};
    use spqr_qrouter::Shard;
    use tokio::net::TcpListener;

    /// Minimal shard: accepts connections, completes the startup
    /// exchange, then keeps the socket open.
    async fn spawn_fake_shard() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    if read_startup_frame(&mut socket).await.is_err() {
                        return;
                    }
                    let _ = write_backend(&mut socket, &BackendMessage::AuthenticationOk).await;
                    let _ = write_backend(
                        &mut socket,
                        &BackendMessage::ReadyForQuery { status: b'I' },
                    )
                    .await;
                    // Hold the connection open until the proxy closes it
                    let mut buf = [0u8; 64];
                    use tokio::io::AsyncReadExt;
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });

        addr
    }

    async fn test_pool(shard_addr: &str, max_per_shard: usize) -> RoutePool {
        let map = Arc::new(RoutingMap::load(Arc::new(MemKv::new()), false).await.unwrap());
        map.add_shard(Shard {
            id: "sh1".into(),
            hosts: vec![shard_addr.to_string()],
            world: false,
        })
        .await
        .unwrap();

        RoutePool::new(
            map,
            PoolSettings {
                max_per_shard,
                acquire_timeout_ms: 200,
                dial_timeout_ms: 2_000,
            },
        )
    }

    fn rules() -> (BackendRule, FrontendRule) {
        (
            BackendRule {
                user: "u1".into(),
                database: "db1".into(),
                password: None,
                ssl_mode: SslMode::Disable,
            },
            FrontendRule {
                user: "u1".into(),
                database: "db1".into(),
                auth_method: AuthMethod::Trust,
                password: None,
            },
        )
    }

    #[tokio::test]
    async fn test_match_route_is_single_per_key() {
        let addr = spawn_fake_shard().await;
        let pool = test_pool(&addr, 2).await;
        let (be, fr) = rules();

        let r1 = pool
            .match_route(RouteKey::new("u1", "db1"), be.clone(), fr.clone())
            .await;
        let r2 = pool.match_route(RouteKey::new("u1", "db1"), be, fr).await;
        assert!(Arc::ptr_eq(&r1, &r2));
    }

    #[tokio::test]
    async fn test_obsolete_creates_fresh_route() {
        let addr = spawn_fake_shard().await;
        let pool = test_pool(&addr, 2).await;
        let (be, fr) = rules();

        let r1 = pool
            .match_route(RouteKey::new("u1", "db1"), be.clone(), fr.clone())
            .await;
        let removed = pool.obsolete(&RouteKey::new("u1", "db1")).await.unwrap();
        assert!(Arc::ptr_eq(&r1, &removed));

        let r2 = pool.match_route(RouteKey::new("u1", "db1"), be, fr).await;
        assert!(!Arc::ptr_eq(&r1, &r2));
    }

    #[tokio::test]
    async fn test_acquire_reuses_released_connection() {
        let addr = spawn_fake_shard().await;
        let pool = test_pool(&addr, 2).await;
        let (be, fr) = rules();
        let route = pool.match_route(RouteKey::new("u1", "db1"), be, fr).await;

        let conn = route.acquire("sh1").await.unwrap();
        let host = conn.host().to_string();
        route.release(conn).await;

        let conn = route.acquire("sh1").await.unwrap();
        assert_eq!(conn.host(), host);
        let stats = route.stats().await;
        assert_eq!(stats.busy_backends, 1);
        assert_eq!(stats.idle_backends, 0);
        route.release(conn).await;
    }

    #[tokio::test]
    async fn test_pool_cap_yields_pool_exhausted() {
        let addr = spawn_fake_shard().await;
        let pool = test_pool(&addr, 1).await;
        let (be, fr) = rules();
        let route = pool.match_route(RouteKey::new("u1", "db1"), be, fr).await;

        let held = route.acquire("sh1").await.unwrap();
        let err = route.acquire("sh1").await.unwrap_err();
        assert!(matches!(err, SpqrError::PoolExhausted(_)));
        route.release(held).await;
    }

    #[tokio::test]
    async fn test_drain_waits_for_busy_connection() {
        let addr = spawn_fake_shard().await;
        let pool = test_pool(&addr, 2).await;
        let (be, fr) = rules();
        let route = pool.match_route(RouteKey::new("u1", "db1"), be, fr).await;

        let conn = route.acquire("sh1").await.unwrap();

        let drain_route = route.clone();
        let drain = tokio::spawn(async move {
            drain_route.drain("sh1", Duration::from_secs(2)).await
        });

        // The drain cannot finish while the connection is lent out.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drain.is_finished());

        route.release(conn).await;
        drain.await.unwrap().unwrap();

        let stats = route.stats().await;
        assert_eq!(stats.idle_backends + stats.busy_backends, 0);
    }

    #[tokio::test]
    async fn test_shard_stats_track_idle_and_busy() {
        let addr = spawn_fake_shard().await;
        let pool = test_pool(&addr, 2).await;
        let (be, fr) = rules();
        let route = pool.match_route(RouteKey::new("u1", "db1"), be, fr).await;

        let conn = route.acquire("sh1").await.unwrap();
        let stats = pool.shard_stats().await;
        assert_eq!(stats["sh1"], (0, 1));

        route.release(conn).await;
        let stats = pool.shard_stats().await;
        assert_eq!(stats["sh1"], (1, 0));
    }

    #[tokio::test]
    async fn test_unknown_shard_is_unavailable() {
        let addr = spawn_fake_shard().await;
        let pool = test_pool(&addr, 2).await;
        let (be, fr) = rules();
        let route = pool.match_route(RouteKey::new("u1", "db1"), be, fr).await;

        let err = route.acquire("nowhere").await.unwrap_err();
        assert!(matches!(err, SpqrError::ShardUnavailable(_)));
    }
}
