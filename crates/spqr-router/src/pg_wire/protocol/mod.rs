//! PostgreSQL v3 wire protocol: framing, typed messages, constants

pub mod constants;
pub mod messages;

pub use constants::*;
pub use messages::{
    read_frame, read_startup_frame, write_backend, write_frontend, write_raw, BackendMessage,
    FieldDescription, FrontendMessage,
};
