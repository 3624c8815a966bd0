//! SPQR Common Library
//!
//! Shared configuration, errors, TLS utilities, the KV-store contract,
//! and gRPC definitions for all SPQR services.

pub mod config;
pub mod error;
pub mod kv;
pub mod proto;
pub mod telemetry;
pub mod tls;

// Re-export commonly used types
pub use config::{
    AuthMethod, BackendRule, BalancerSettings, Config, FrontendRule, PoolSettings, ShardConfig,
    SslMode,
};
pub use error::{Result, SpqrError};
pub use kv::{KvStore, MemKv};
pub use tls::{create_client_tls_config, create_server_tls_config, TlsConfig};
