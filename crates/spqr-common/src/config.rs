//! Configuration for SPQR services

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// TLS negotiation policy, on both the client-facing listener and
/// backend connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Never negotiate TLS
    Disable,
    /// Negotiate TLS when the peer offers it, fall back to plaintext
    Prefer,
    /// Refuse plaintext sessions
    Require,
}

impl Default for SslMode {
    fn default() -> Self {
        SslMode::Disable
    }
}

/// TLS material and policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Negotiation policy
    pub mode: SslMode,
    /// Path to certificate file (PEM)
    pub cert_path: Option<String>,
    /// Path to private key file (PEM)
    pub key_path: Option<String>,
}

/// Client authentication methods selectable per frontend rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Accept without a password exchange
    Trust,
    /// AuthenticationCleartextPassword exchange
    Cleartext,
    /// AuthenticationMD5Password exchange
    Md5,
}

/// Frontend rule: how a (user, database) pair authenticates to the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendRule {
    pub user: String,
    pub database: String,
    pub auth_method: AuthMethod,
    /// Expected password for cleartext/md5 methods
    pub password: Option<String>,
}

/// Backend rule: credentials the proxy presents to shards for a route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRule {
    pub user: String,
    pub database: String,
    /// Password sent to the shard when it challenges
    pub password: Option<String>,
    /// TLS policy towards the shard
    #[serde(default)]
    pub ssl_mode: SslMode,
}

/// A single shard: an ordered host list, first reachable host for writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub id: String,
    pub hosts: Vec<String>,
    /// World shards receive statements with no routable predicate
    #[serde(default)]
    pub world: bool,
}

/// Backend connection pool caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum backend connections per shard per route
    pub max_per_shard: usize,
    /// Bounded wait for a free connection before PoolExhausted
    pub acquire_timeout_ms: u64,
    /// Deadline for dial + backend auth
    pub dial_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_per_shard: 10,
            acquire_timeout_ms: 5_000,
            dial_timeout_ms: 10_000,
        }
    }
}

/// Balancer cycle tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerSettings {
    /// Sleep between cycles, seconds
    pub period_secs: u64,
    /// Relative band around the mean load that counts as balanced
    pub epsilon: f64,
    /// Minimum variance improvement required to act
    pub theta: f64,
    /// Retry cap for operation polling
    pub max_retries: usize,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            period_secs: 30,
            epsilon: 0.1,
            theta: 0.0,
            max_retries: 3,
        }
    }
}

/// Top-level configuration consumed by the router, coordinator, and balancer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// PostgreSQL wire listener
    pub listen_addr: SocketAddr,
    /// Router-local gRPC listener
    pub grpc_addr: SocketAddr,
    /// Coordinator gRPC endpoint
    pub coordinator_addr: String,
    /// Durable KV endpoint
    pub kv_addr: String,
    pub tls: TlsSettings,
    pub frontend_rules: Vec<FrontendRule>,
    pub backend_rules: Vec<BackendRule>,
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub balancer: BalancerSettings,
    /// Route predicate-free statements to world shards instead of rejecting
    #[serde(default)]
    pub world_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6432".parse().expect("static addr"),
            grpc_addr: "0.0.0.0:7000".parse().expect("static addr"),
            coordinator_addr: "http://localhost:7001".into(),
            kv_addr: "localhost:2379".into(),
            tls: TlsSettings::default(),
            frontend_rules: Vec::new(),
            backend_rules: Vec::new(),
            shards: Vec::new(),
            pool: PoolSettings::default(),
            balancer: BalancerSettings::default(),
            world_mode: false,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            crate::error::SpqrError::Internal(format!("failed to read config {}: {}", path, e))
        })?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Get environment variable with default
pub fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get environment variable as parsed type with default
pub fn env_parse_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trip() {
        let cfg = Config {
            frontend_rules: vec![FrontendRule {
                user: "u1".into(),
                database: "db1".into(),
                auth_method: AuthMethod::Md5,
                password: Some("secret".into()),
            }],
            shards: vec![ShardConfig {
                id: "sh1".into(),
                hosts: vec!["localhost:5432".into()],
                world: false,
            }],
            ..Default::default()
        };

        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.frontend_rules.len(), 1);
        assert_eq!(parsed.shards[0].id, "sh1");
        assert_eq!(parsed.tls.mode, SslMode::Disable);
    }

    #[test]
    fn test_ssl_mode_names() {
        assert_eq!(serde_json::to_string(&SslMode::Require).unwrap(), "\"require\"");
        let m: SslMode = serde_json::from_str("\"prefer\"").unwrap();
        assert_eq!(m, SslMode::Prefer);
    }
}
