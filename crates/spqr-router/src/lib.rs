//! SPQR Router
//!
//! The data-plane proxy: accepts PostgreSQL client sessions, routes each
//! statement to the owning shard through the routing map, and multiplexes
//! sessions onto pooled backend connections. Also serves the admin
//! console and a router-local gRPC mutation surface.

pub mod backend;
pub mod console;
pub mod grpc;
pub mod metrics;
pub mod pg_wire;
pub mod route_pool;

pub use backend::BackendConn;
pub use pg_wire::{PgServer, RouterContext};
pub use route_pool::{Route, RouteKey, RoutePool};
