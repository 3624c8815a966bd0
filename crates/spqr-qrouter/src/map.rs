//! The routing map: sharding rules, key ranges, and data shards
//!
//! Mutations are serialised by a single writer lock and written through
//! to the durable KV before they become visible. Readers never wait:
//! every routing decision dereferences one published `Arc<Snapshot>`
//! built copy-on-write by the last committed mutation.

use crate::key_range::KeyRange;
use crate::predicates::extract_equality_predicates;
use crate::shard_key::{encode_shard_key, KeyValue};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use spqr_common::kv::{KvStore, RANGES_PREFIX, RULES_PREFIX, SHARDS_PREFIX};
use spqr_common::{Result, SpqrError};
use sqlparser::ast::Statement;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A data shard known to the routing map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: String,
    /// Ordered host list; the first reachable host takes writes
    pub hosts: Vec<String>,
    /// World shards receive statements with no routable predicate
    #[serde(default)]
    pub world: bool,
}

/// Declares a column set that acts as a routing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingRule {
    pub columns: Vec<String>,
}

impl ShardingRule {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns: columns.into_iter().map(|c| c.to_lowercase()).collect(),
        }
    }

    fn same_column_set(&self, other: &ShardingRule) -> bool {
        let mut a = self.columns.clone();
        let mut b = other.columns.clone();
        a.sort();
        b.sort();
        a == b
    }
}

/// Persisted rule record; `seq` preserves insertion order across restarts
#[derive(Serialize, Deserialize)]
struct StoredRule {
    seq: u64,
    columns: Vec<String>,
}

/// Why a statement could not be routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// No sharding rule matches the statement's predicate columns
    NoRule,
    /// The routing key falls outside every key range
    NoKeyRange,
    /// The owning key range is locked for a lifecycle operation
    RangeLocked(String),
}

impl RejectReason {
    pub fn to_error(&self, stmt: &str) -> SpqrError {
        match self {
            RejectReason::NoRule | RejectReason::NoKeyRange => {
                SpqrError::NoRouteForStatement(stmt.to_string())
            }
            RejectReason::RangeLocked(krid) => SpqrError::RangeLocked(krid.clone()),
        }
    }
}

/// Where a statement should execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Exactly one shard owns the routing key
    Single(String),
    /// Predicate-free statement in world mode: all world shards
    Multi(Vec<String>),
    Reject(RejectReason),
}

/// Immutable, cheaply-cloned view of the routing state
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Insertion-ordered sharding rules
    pub rules: Vec<ShardingRule>,
    /// Key ranges sorted by lower bound
    pub ranges: Vec<KeyRange>,
    pub shards: Vec<Shard>,
    pub world_mode: bool,
}

impl Snapshot {
    /// The range owning `key`, if any.
    pub fn find_range(&self, key: &[u8]) -> Option<&KeyRange> {
        let idx = self.ranges.partition_point(|r| r.lower.as_slice() <= key);
        if idx == 0 {
            return None;
        }
        let candidate = &self.ranges[idx - 1];
        candidate.contains(key).then_some(candidate)
    }

    /// Best rule whose column set is a subset of `present`: largest
    /// matching set wins, insertion order breaks ties.
    fn match_rule(&self, present: &HashMap<String, KeyValue>) -> Option<&ShardingRule> {
        let mut best: Option<&ShardingRule> = None;
        for rule in &self.rules {
            if !rule.columns.iter().all(|c| present.contains_key(c)) {
                continue;
            }
            // Strict comparison keeps the earliest-inserted rule on ties.
            if best.map_or(true, |b| rule.columns.len() > b.columns.len()) {
                best = Some(rule);
            }
        }
        best
    }

    /// Decide where a parsed statement executes. Pure: equal snapshots
    /// and statements always produce equal decisions.
    pub fn route(&self, stmt: &Statement) -> RoutingDecision {
        let mut present: HashMap<String, KeyValue> = HashMap::new();
        for (column, value) in extract_equality_predicates(stmt) {
            present.entry(column).or_insert(value);
        }

        let rule = match self.match_rule(&present) {
            Some(rule) => rule,
            None => return self.world_fallback(),
        };

        let values: Vec<KeyValue> = rule
            .columns
            .iter()
            .map(|c| present[c].clone())
            .collect();
        let key = encode_shard_key(&values);

        match self.find_range(&key) {
            Some(range) if range.locked => {
                RoutingDecision::Reject(RejectReason::RangeLocked(range.id.clone()))
            }
            Some(range) => RoutingDecision::Single(range.shard_id.clone()),
            None => RoutingDecision::Reject(RejectReason::NoKeyRange),
        }
    }

    fn world_fallback(&self) -> RoutingDecision {
        if !self.world_mode {
            return RoutingDecision::Reject(RejectReason::NoRule);
        }

        let world: Vec<String> = self
            .shards
            .iter()
            .filter(|s| s.world)
            .map(|s| s.id.clone())
            .collect();
        let targets = if world.is_empty() {
            self.shards.iter().map(|s| s.id.clone()).collect()
        } else {
            world
        };

        if targets.is_empty() {
            RoutingDecision::Reject(RejectReason::NoRule)
        } else {
            RoutingDecision::Multi(targets)
        }
    }
}

struct WriterState {
    next_rule_seq: u64,
}

/// The transactional routing map shared by the router and coordinator.
pub struct RoutingMap {
    kv: Arc<dyn KvStore>,
    snapshot: RwLock<Arc<Snapshot>>,
    // Serialises all mutations; KV writes happen while held, before the
    // new snapshot is published.
    writer: tokio::sync::Mutex<WriterState>,
}

impl RoutingMap {
    /// Rebuild the map from the KV store. Ranges observed locked stay
    /// locked; the operator decides what to do with them.
    pub async fn load(kv: Arc<dyn KvStore>, world_mode: bool) -> Result<Self> {
        let mut shards = Vec::new();
        for (_, value) in kv.scan_prefix(SHARDS_PREFIX).await? {
            shards.push(serde_json::from_slice::<Shard>(&value)?);
        }

        let mut stored_rules = Vec::new();
        for (_, value) in kv.scan_prefix(RULES_PREFIX).await? {
            stored_rules.push(serde_json::from_slice::<StoredRule>(&value)?);
        }
        stored_rules.sort_by_key(|r| r.seq);
        let next_rule_seq = stored_rules.last().map(|r| r.seq + 1).unwrap_or(0);
        let rules = stored_rules
            .into_iter()
            .map(|r| ShardingRule { columns: r.columns })
            .collect();

        let mut ranges: Vec<KeyRange> = Vec::new();
        for (_, value) in kv.scan_prefix(RANGES_PREFIX).await? {
            ranges.push(serde_json::from_slice::<KeyRange>(&value)?);
        }
        ranges.sort_by(|a, b| a.lower.cmp(&b.lower));

        info!(
            shards = shards.len(),
            ranges = ranges.len(),
            "routing map loaded from storage"
        );

        Ok(Self {
            kv,
            snapshot: RwLock::new(Arc::new(Snapshot {
                rules,
                ranges,
                shards,
                world_mode,
            })),
            writer: tokio::sync::Mutex::new(WriterState { next_rule_seq }),
        })
    }

    /// The last fully committed snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    fn publish(&self, next: Snapshot) {
        *self.snapshot.write() = Arc::new(next);
    }

    fn clone_state(&self) -> Snapshot {
        let snap = self.snapshot();
        Snapshot {
            rules: snap.rules.clone(),
            ranges: snap.ranges.clone(),
            shards: snap.shards.clone(),
            world_mode: snap.world_mode,
        }
    }

    async fn persist_range(&self, range: &KeyRange) -> Result<()> {
        self.kv
            .put(&range_key(&range.lower), serde_json::to_vec(range)?)
            .await
    }

    /// Register a data shard. Shards are never implicitly removed.
    pub async fn add_shard(&self, shard: Shard) -> Result<()> {
        let _guard = self.writer.lock().await;
        let mut next = self.clone_state();

        if next.shards.iter().any(|s| s.id == shard.id) {
            return Err(SpqrError::Internal(format!(
                "shard {} already registered",
                shard.id
            )));
        }

        self.kv
            .put(
                &format!("{}{}", SHARDS_PREFIX, shard.id),
                serde_json::to_vec(&shard)?,
            )
            .await?;

        info!(shard = %shard.id, world = shard.world, "shard registered");
        next.shards.push(shard);
        self.publish(next);
        Ok(())
    }

    /// Append a sharding rule; duplicates by column set are rejected.
    pub async fn add_sharding_rule(&self, rule: ShardingRule) -> Result<()> {
        let mut state = self.writer.lock().await;
        let mut next = self.clone_state();

        if next.rules.iter().any(|r| r.same_column_set(&rule)) {
            return Err(SpqrError::Internal(format!(
                "sharding rule for columns {:?} already exists",
                rule.columns
            )));
        }

        let stored = StoredRule {
            seq: state.next_rule_seq,
            columns: rule.columns.clone(),
        };
        self.kv
            .put(&rule_key(&rule.columns), serde_json::to_vec(&stored)?)
            .await?;
        state.next_rule_seq += 1;

        info!(columns = ?rule.columns, "sharding rule added");
        next.rules.push(rule);
        self.publish(next);
        Ok(())
    }

    /// Insert a key range, maintaining disjointness and order.
    pub async fn add_key_range(&self, range: KeyRange) -> Result<()> {
        let _guard = self.writer.lock().await;
        let mut next = self.clone_state();

        if range.lower >= range.upper {
            return Err(SpqrError::BadBound(range.id));
        }
        if !next.shards.iter().any(|s| s.id == range.shard_id) {
            return Err(SpqrError::ShardUnavailable(range.shard_id));
        }
        if let Some(existing) = next.ranges.iter().find(|r| r.overlaps(&range)) {
            return Err(SpqrError::Internal(format!(
                "key range {} overlaps existing range {}",
                range.id, existing.id
            )));
        }

        self.persist_range(&range).await?;

        info!(krid = %range.id, shard = %range.shard_id, "key range added");
        let pos = next.ranges.partition_point(|r| r.lower < range.lower);
        next.ranges.insert(pos, range);
        self.publish(next);
        Ok(())
    }

    /// Lock a key range, freezing its ownership and bounds. Returns the
    /// locked range. Concurrent lockers serialise; the loser observes
    /// `AlreadyLocked`.
    pub async fn lock(&self, krid: &str) -> Result<KeyRange> {
        let _guard = self.writer.lock().await;
        let mut next = self.clone_state();

        let range = find_mut(&mut next.ranges, krid)?;
        if range.locked {
            return Err(SpqrError::AlreadyLocked(krid.to_string()));
        }
        range.locked = true;
        let locked = range.clone();

        self.persist_range(&locked).await?;

        debug!(krid = %krid, "key range locked");
        self.publish(next);
        Ok(locked)
    }

    /// Unlock a key range.
    pub async fn unlock(&self, krid: &str) -> Result<()> {
        let _guard = self.writer.lock().await;
        let mut next = self.clone_state();

        let range = find_mut(&mut next.ranges, krid)?;
        if !range.locked {
            return Err(SpqrError::NotLocked(krid.to_string()));
        }
        range.locked = false;
        let unlocked = range.clone();

        self.persist_range(&unlocked).await?;

        debug!(krid = %krid, "key range unlocked");
        self.publish(next);
        Ok(())
    }

    /// Split a locked range at `bound`. The lower half keeps the id,
    /// the upper half receives a fresh one.
    pub async fn split(&self, krid: &str, bound: &[u8]) -> Result<(KeyRange, KeyRange)> {
        let _guard = self.writer.lock().await;
        let mut next = self.clone_state();

        let pos = position(&next.ranges, krid)?;
        let range = &next.ranges[pos];
        if !range.locked {
            return Err(SpqrError::NotLocked(krid.to_string()));
        }

        let new_id = uuid::Uuid::new_v4().to_string();
        let (left, right) = range.split_at(bound, new_id)?;

        // Left keeps the original lower bound, so one put per half
        // rewrites the old record and adds the new one.
        self.persist_range(&left).await?;
        self.persist_range(&right).await?;

        info!(krid = %krid, new_krid = %right.id, "key range split");
        next.ranges[pos] = left.clone();
        next.ranges.insert(pos + 1, right.clone());
        self.publish(next);
        Ok((left, right))
    }

    /// Merge the two adjacent locked ranges meeting at `bound`. The left
    /// range's id survives.
    pub async fn merge(&self, bound: &[u8]) -> Result<KeyRange> {
        let _guard = self.writer.lock().await;
        let mut next = self.clone_state();

        let left_pos = next
            .ranges
            .iter()
            .position(|r| r.upper.as_slice() == bound)
            .ok_or(SpqrError::NotAdjacent)?;
        let right_pos = next
            .ranges
            .iter()
            .position(|r| r.lower.as_slice() == bound)
            .ok_or(SpqrError::NotAdjacent)?;

        let (left, right) = (&next.ranges[left_pos], &next.ranges[right_pos]);
        if !left.locked {
            return Err(SpqrError::NotLocked(left.id.clone()));
        }
        if !right.locked {
            return Err(SpqrError::NotLocked(right.id.clone()));
        }
        if left.shard_id != right.shard_id {
            return Err(SpqrError::ShardMismatch(
                left.shard_id.clone(),
                right.shard_id.clone(),
            ));
        }

        let merged = KeyRange {
            id: left.id.clone(),
            shard_id: left.shard_id.clone(),
            lower: left.lower.clone(),
            upper: right.upper.clone(),
            locked: true,
        };

        self.persist_range(&merged).await?;
        self.kv.delete(&range_key(bound)).await?;

        info!(krid = %merged.id, absorbed = %next.ranges[right_pos].id, "key ranges merged");
        next.ranges[left_pos] = merged.clone();
        next.ranges.remove(right_pos);
        self.publish(next);
        Ok(merged)
    }

    /// Rewrite a locked range's owner. The caller is responsible for
    /// draining sessions on the old owner first.
    pub async fn move_key_range(&self, krid: &str, to_shard: &str) -> Result<KeyRange> {
        let _guard = self.writer.lock().await;
        let mut next = self.clone_state();

        if !next.shards.iter().any(|s| s.id == to_shard) {
            return Err(SpqrError::ShardUnavailable(to_shard.to_string()));
        }

        let range = find_mut(&mut next.ranges, krid)?;
        if !range.locked {
            return Err(SpqrError::NotLocked(krid.to_string()));
        }
        let from = std::mem::replace(&mut range.shard_id, to_shard.to_string());
        let moved = range.clone();

        self.persist_range(&moved).await?;

        info!(krid = %krid, from = %from, to = %to_shard, "key range moved");
        self.publish(next);
        Ok(moved)
    }
}

fn range_key(lower: &[u8]) -> String {
    format!("{}{}", RANGES_PREFIX, hex::encode(lower))
}

fn rule_key(columns: &[String]) -> String {
    let mut sorted = columns.to_vec();
    sorted.sort();
    let digest = md5::compute(sorted.join(",").as_bytes());
    format!("{}{:x}", RULES_PREFIX, digest)
}

fn position(ranges: &[KeyRange], krid: &str) -> Result<usize> {
    ranges
        .iter()
        .position(|r| r.id == krid)
        .ok_or_else(|| SpqrError::Internal(format!("key range {} not found", krid)))
}

fn find_mut<'a>(ranges: &'a mut [KeyRange], krid: &str) -> Result<&'a mut KeyRange> {
    ranges
        .iter_mut()
        .find(|r| r.id == krid)
        .ok_or_else(|| SpqrError::Internal(format!("key range {} not found", krid)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicates::parse_single_statement;
    use spqr_common::MemKv;

    async fn test_map() -> RoutingMap {
        let map = RoutingMap::load(Arc::new(MemKv::new()), false).await.unwrap();
        map.add_shard(Shard {
            id: "sh1".into(),
            hosts: vec!["localhost:5432".into()],
            world: false,
        })
        .await
        .unwrap();
        map.add_shard(Shard {
            id: "sh2".into(),
            hosts: vec!["localhost:5433".into()],
            world: false,
        })
        .await
        .unwrap();
        map
    }

    fn kr(id: &str, shard: &str, lower: u8, upper: u8) -> KeyRange {
        KeyRange::new(id.into(), shard.into(), vec![lower], vec![upper]).unwrap()
    }

    fn route(map: &RoutingMap, sql: &str) -> RoutingDecision {
        let stmt = parse_single_statement(sql).unwrap();
        map.snapshot().route(&stmt)
    }

    #[tokio::test]
    async fn test_single_shard_routing() {
        let map = test_map().await;
        map.add_sharding_rule(ShardingRule::new(vec!["id".into()]))
            .await
            .unwrap();
        map.add_key_range(kr("kr1", "sh1", 0x00, 0x80)).await.unwrap();
        map.add_key_range(kr("kr2", "sh2", 0x80, 0xff)).await.unwrap();

        assert_eq!(
            route(&map, "SELECT * FROM t WHERE id = 64"),
            RoutingDecision::Single("sh1".into())
        );
        assert_eq!(
            route(&map, "SELECT * FROM t WHERE id = 200"),
            RoutingDecision::Single("sh2".into())
        );
    }

    #[tokio::test]
    async fn test_no_route_without_predicate() {
        let map = test_map().await;
        map.add_sharding_rule(ShardingRule::new(vec!["id".into()]))
            .await
            .unwrap();

        assert_eq!(
            route(&map, "SELECT * FROM t"),
            RoutingDecision::Reject(RejectReason::NoRule)
        );
    }

    #[tokio::test]
    async fn test_world_mode_fans_out() {
        let kv = Arc::new(MemKv::new());
        let map = RoutingMap::load(kv, true).await.unwrap();
        map.add_shard(Shard {
            id: "w1".into(),
            hosts: vec!["localhost:5442".into()],
            world: true,
        })
        .await
        .unwrap();

        assert_eq!(
            route(&map, "SELECT * FROM t"),
            RoutingDecision::Multi(vec!["w1".into()])
        );
    }

    #[tokio::test]
    async fn test_key_outside_ranges_rejected() {
        let map = test_map().await;
        map.add_sharding_rule(ShardingRule::new(vec!["id".into()]))
            .await
            .unwrap();
        map.add_key_range(kr("kr1", "sh1", 0x10, 0x80)).await.unwrap();

        assert_eq!(
            route(&map, "SELECT * FROM t WHERE id = 5"),
            RoutingDecision::Reject(RejectReason::NoKeyRange)
        );
    }

    #[tokio::test]
    async fn test_largest_rule_wins() {
        let map = test_map().await;
        map.add_sharding_rule(ShardingRule::new(vec!["id".into()]))
            .await
            .unwrap();
        map.add_sharding_rule(ShardingRule::new(vec!["id".into(), "region".into()]))
            .await
            .unwrap();
        // Composite key [len, 0x07, len, 'e', 'u'] starts with 0x01
        map.add_key_range(kr("kr1", "sh2", 0x00, 0x40)).await.unwrap();

        assert_eq!(
            route(&map, "SELECT * FROM t WHERE id = 7 AND region = 'eu'"),
            RoutingDecision::Single("sh2".into())
        );
    }

    #[tokio::test]
    async fn test_duplicate_rule_rejected() {
        let map = test_map().await;
        map.add_sharding_rule(ShardingRule::new(vec!["id".into()]))
            .await
            .unwrap();
        assert!(map
            .add_sharding_rule(ShardingRule::new(vec!["ID".into()]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_overlapping_range_rejected() {
        let map = test_map().await;
        map.add_key_range(kr("kr1", "sh1", 0x00, 0x80)).await.unwrap();
        assert!(map.add_key_range(kr("kr2", "sh2", 0x40, 0xc0)).await.is_err());
        assert!(map.add_key_range(kr("kr3", "sh2", 0x80, 0xc0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_unlock() {
        let map = test_map().await;
        map.add_key_range(kr("kr1", "sh1", 0x00, 0x80)).await.unwrap();

        let locked = map.lock("kr1").await.unwrap();
        assert!(locked.locked);
        assert!(matches!(
            map.lock("kr1").await,
            Err(SpqrError::AlreadyLocked(_))
        ));

        map.unlock("kr1").await.unwrap();
        assert!(matches!(
            map.unlock("kr1").await,
            Err(SpqrError::NotLocked(_))
        ));
    }

    #[tokio::test]
    async fn test_locked_range_rejects_routing() {
        let map = test_map().await;
        map.add_sharding_rule(ShardingRule::new(vec!["id".into()]))
            .await
            .unwrap();
        map.add_key_range(kr("kr1", "sh1", 0x00, 0x80)).await.unwrap();
        map.lock("kr1").await.unwrap();

        assert_eq!(
            route(&map, "SELECT * FROM t WHERE id = 64"),
            RoutingDecision::Reject(RejectReason::RangeLocked("kr1".into()))
        );
    }

    #[tokio::test]
    async fn test_split_requires_lock_and_interior_bound() {
        let map = test_map().await;
        map.add_key_range(kr("kr1", "sh1", 0x00, 0x80)).await.unwrap();

        assert!(matches!(
            map.split("kr1", &[0x40]).await,
            Err(SpqrError::NotLocked(_))
        ));

        map.lock("kr1").await.unwrap();
        assert!(matches!(
            map.split("kr1", &[0x80]).await,
            Err(SpqrError::BadBound(_))
        ));

        let (left, right) = map.split("kr1", &[0x40]).await.unwrap();
        assert_eq!(left.id, "kr1");
        assert_ne!(right.id, "kr1");
        assert_eq!(left.upper, right.lower);
        assert_eq!(left.shard_id, right.shard_id);

        let snap = map.snapshot();
        assert_eq!(snap.ranges.len(), 2);
    }

    #[tokio::test]
    async fn test_split_then_merge_restores_pre_split_state() {
        let map = test_map().await;
        map.add_key_range(kr("kr1", "sh1", 0x00, 0x80)).await.unwrap();
        map.lock("kr1").await.unwrap();

        let before: Vec<KeyRange> = map.snapshot().ranges.clone();

        map.split("kr1", &[0x40]).await.unwrap();
        let merged = map.merge(&[0x40]).await.unwrap();

        assert_eq!(merged.id, "kr1");
        assert_eq!(map.snapshot().ranges, before);
    }

    #[tokio::test]
    async fn test_merge_preconditions() {
        let map = test_map().await;
        map.add_key_range(kr("kr1", "sh1", 0x00, 0x40)).await.unwrap();
        map.add_key_range(kr("kr2", "sh2", 0x40, 0x80)).await.unwrap();

        assert!(matches!(map.merge(&[0x50]).await, Err(SpqrError::NotAdjacent)));
        assert!(matches!(
            map.merge(&[0x40]).await,
            Err(SpqrError::NotLocked(_))
        ));

        map.lock("kr1").await.unwrap();
        map.lock("kr2").await.unwrap();
        assert!(matches!(
            map.merge(&[0x40]).await,
            Err(SpqrError::ShardMismatch(_, _))
        ));
    }

    #[tokio::test]
    async fn test_move_key_range() {
        let map = test_map().await;
        map.add_key_range(kr("kr1", "sh1", 0x00, 0x80)).await.unwrap();

        assert!(matches!(
            map.move_key_range("kr1", "sh2").await,
            Err(SpqrError::NotLocked(_))
        ));

        map.lock("kr1").await.unwrap();
        assert!(matches!(
            map.move_key_range("kr1", "nowhere").await,
            Err(SpqrError::ShardUnavailable(_))
        ));

        let moved = map.move_key_range("kr1", "sh2").await.unwrap();
        assert_eq!(moved.shard_id, "sh2");
        assert!(moved.locked);
    }

    #[tokio::test]
    async fn test_reload_preserves_state_and_locks() {
        let kv = Arc::new(MemKv::new());
        {
            let map = RoutingMap::load(kv.clone(), false).await.unwrap();
            map.add_shard(Shard {
                id: "sh1".into(),
                hosts: vec!["localhost:5432".into()],
                world: false,
            })
            .await
            .unwrap();
            map.add_sharding_rule(ShardingRule::new(vec!["id".into()]))
                .await
                .unwrap();
            map.add_key_range(kr("kr1", "sh1", 0x00, 0x80)).await.unwrap();
            map.lock("kr1").await.unwrap();
        }

        let reloaded = RoutingMap::load(kv, false).await.unwrap();
        let snap = reloaded.snapshot();
        assert_eq!(snap.shards.len(), 1);
        assert_eq!(snap.rules.len(), 1);
        assert_eq!(snap.ranges.len(), 1);
        assert!(snap.ranges[0].locked);
    }

    #[tokio::test]
    async fn test_route_is_pure_per_snapshot() {
        let map = test_map().await;
        map.add_sharding_rule(ShardingRule::new(vec!["id".into()]))
            .await
            .unwrap();
        map.add_key_range(kr("kr1", "sh1", 0x00, 0x80)).await.unwrap();

        let snap = map.snapshot();
        let stmt = parse_single_statement("SELECT * FROM t WHERE id = 64").unwrap();

        let first = snap.route(&stmt);
        // Mutate the live map; the held snapshot must answer identically.
        map.lock("kr1").await.unwrap();
        let second = snap.route(&stmt);
        assert_eq!(first, second);
    }
}
