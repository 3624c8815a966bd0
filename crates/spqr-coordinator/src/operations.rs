//! Persisted operation registry
//!
//! Every coordinator mutation runs under an operation record: created
//! pending, advanced to done or failed, and persisted under `ops/<opid>`
//! so a restart does not lose status. Idempotency tokens map repeated
//! submissions onto the existing operation.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use spqr_common::kv::{KvStore, OPS_PREFIX};
use spqr_common::{Result, SpqrError};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Done,
    Failed,
}

/// One long-running mutation's lifecycle record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub status: OperationStatus,
    /// Mutation kind: lock, unlock, split, merge, move, add-shard, ...
    pub kind: String,
    /// Terminal error text when status is failed
    pub error: Option<String>,
    /// Idempotency token of the submission that created this operation
    pub token: Option<String>,
}

/// Outcome of registering a mutation
pub enum BeginOutcome {
    /// Fresh operation created in pending state
    New(Operation),
    /// The idempotency token matched an earlier submission
    Existing(Operation),
}

pub struct OperationRegistry {
    kv: Arc<dyn KvStore>,
    ops: DashMap<String, Operation>,
    tokens: DashMap<String, String>,
}

impl OperationRegistry {
    /// Rebuild the registry from storage.
    pub async fn load(kv: Arc<dyn KvStore>) -> Result<Self> {
        let ops = DashMap::new();
        let tokens = DashMap::new();

        for (_, value) in kv.scan_prefix(OPS_PREFIX).await? {
            let op: Operation = serde_json::from_slice(&value)?;
            if let Some(token) = &op.token {
                tokens.insert(token.clone(), op.id.clone());
            }
            ops.insert(op.id.clone(), op);
        }

        info!(operations = ops.len(), "operation registry loaded");
        Ok(Self { kv, ops, tokens })
    }

    /// Create a pending operation, or return the existing one for a
    /// repeated idempotency token.
    pub async fn begin(&self, kind: &str, token: &str) -> Result<BeginOutcome> {
        if !token.is_empty() {
            if let Some(existing_id) = self.tokens.get(token) {
                let op = self
                    .ops
                    .get(existing_id.value())
                    .map(|entry| entry.clone())
                    .ok_or_else(|| {
                        SpqrError::Internal(format!("token {} maps to missing operation", token))
                    })?;
                debug!(token = %token, operation = %op.id, "idempotent resubmission");
                return Ok(BeginOutcome::Existing(op));
            }
        }

        let op = Operation {
            id: uuid::Uuid::new_v4().to_string(),
            status: OperationStatus::Pending,
            kind: kind.to_string(),
            error: None,
            token: (!token.is_empty()).then(|| token.to_string()),
        };

        self.persist(&op).await?;
        if let Some(token) = &op.token {
            self.tokens.insert(token.clone(), op.id.clone());
        }
        self.ops.insert(op.id.clone(), op.clone());
        Ok(BeginOutcome::New(op))
    }

    /// Mark an operation done or failed and persist the terminal state.
    pub async fn complete(&self, id: &str, result: &Result<()>) -> Result<()> {
        let mut op = self
            .ops
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| SpqrError::Internal(format!("operation {} not found", id)))?;

        match result {
            Ok(()) => {
                op.status = OperationStatus::Done;
                op.error = None;
            }
            Err(e) => {
                op.status = OperationStatus::Failed;
                op.error = Some(e.to_string());
            }
        }

        self.persist(&op).await?;
        self.ops.insert(op.id.clone(), op);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Operation> {
        self.ops.get(id).map(|entry| entry.clone())
    }

    async fn persist(&self, op: &Operation) -> Result<()> {
        self.kv
            .put(
                &format!("{}{}", OPS_PREFIX, op.id),
                serde_json::to_vec(op)?,
            )
            .await
            .map_err(|e| SpqrError::StorageUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spqr_common::MemKv;

    #[tokio::test]
    async fn test_begin_complete_get() {
        let registry = OperationRegistry::load(Arc::new(MemKv::new())).await.unwrap();

        let op = match registry.begin("split", "").await.unwrap() {
            BeginOutcome::New(op) => op,
            BeginOutcome::Existing(_) => panic!("no token, must be new"),
        };
        assert_eq!(op.status, OperationStatus::Pending);

        registry.complete(&op.id, &Ok(())).await.unwrap();
        assert_eq!(registry.get(&op.id).unwrap().status, OperationStatus::Done);
    }

    #[tokio::test]
    async fn test_failure_records_error() {
        let registry = OperationRegistry::load(Arc::new(MemKv::new())).await.unwrap();
        let op = match registry.begin("merge", "").await.unwrap() {
            BeginOutcome::New(op) => op,
            BeginOutcome::Existing(_) => unreachable!(),
        };

        registry
            .complete(&op.id, &Err(SpqrError::NotAdjacent))
            .await
            .unwrap();

        let stored = registry.get(&op.id).unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
        assert!(stored.error.unwrap().contains("adjacent"));
    }

    #[tokio::test]
    async fn test_idempotency_token_returns_existing() {
        let registry = OperationRegistry::load(Arc::new(MemKv::new())).await.unwrap();

        let first = match registry.begin("lock", "tok-1").await.unwrap() {
            BeginOutcome::New(op) => op,
            BeginOutcome::Existing(_) => unreachable!(),
        };
        match registry.begin("lock", "tok-1").await.unwrap() {
            BeginOutcome::Existing(op) => assert_eq!(op.id, first.id),
            BeginOutcome::New(_) => panic!("token resubmission must not mint a new operation"),
        }
    }

    #[tokio::test]
    async fn test_registry_survives_restart() {
        let kv = Arc::new(MemKv::new());
        let op_id;
        {
            let registry = OperationRegistry::load(kv.clone()).await.unwrap();
            let op = match registry.begin("move", "tok-9").await.unwrap() {
                BeginOutcome::New(op) => op,
                BeginOutcome::Existing(_) => unreachable!(),
            };
            registry.complete(&op.id, &Ok(())).await.unwrap();
            op_id = op.id;
        }

        let reloaded = OperationRegistry::load(kv).await.unwrap();
        assert_eq!(reloaded.get(&op_id).unwrap().status, OperationStatus::Done);
        // Token map survives too
        match reloaded.begin("move", "tok-9").await.unwrap() {
            BeginOutcome::Existing(op) => assert_eq!(op.id, op_id),
            BeginOutcome::New(_) => panic!("token must survive restart"),
        }
    }
}
