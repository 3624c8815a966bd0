//! SPQR Coordinator
//!
//! Control-plane service: routing-map mutations over gRPC with
//! asynchronous operation semantics.

pub mod operations;
pub mod service;

pub use operations::{Operation, OperationRegistry, OperationStatus};
pub use service::SpqrCoordinator;
