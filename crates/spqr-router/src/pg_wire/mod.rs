//! PostgreSQL wire protocol front end: codec, listener, per-session
//! state machine, and frontend authentication.

pub mod auth;
pub mod connection;
pub mod protocol;
pub mod query_loop;
pub mod server;

pub use connection::CONSOLE_DATABASE;
pub use server::{PgServer, RouterContext};
