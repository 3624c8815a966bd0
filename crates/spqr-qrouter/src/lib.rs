//! SPQR Query Router
//!
//! The routing map that answers "which shard owns this statement":
//! sharding rules, key ranges, and data shards, with atomic
//! split/merge/lock/move operations persisted to a durable KV store.

pub mod key_range;
pub mod map;
pub mod predicates;
pub mod shard_key;

pub use key_range::{midpoint, KeyRange};
pub use map::{RejectReason, RoutingDecision, RoutingMap, Shard, ShardingRule, Snapshot};
pub use predicates::{extract_equality_predicates, parse_single_statement};
pub use shard_key::{encode_shard_key, KeyValue};
