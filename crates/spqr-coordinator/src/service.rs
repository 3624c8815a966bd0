//! Coordinator gRPC services
//!
//! A stateless façade over the routing map plus the operation registry.
//! Every mutation mints an operation, applies the change, records the
//! outcome, and replies with the operation id for polling. Mutations are
//! rejected while the KV store is unavailable; listings always serve the
//! in-memory snapshot.

use crate::operations::{BeginOutcome, Operation, OperationRegistry, OperationStatus};
use spqr_common::proto;
use spqr_common::proto::balancer_service_server::BalancerService;
use spqr_common::proto::key_range_service_server::KeyRangeService;
use spqr_common::proto::operation_service_server::OperationService;
use spqr_common::proto::shard_service_server::ShardService;
use spqr_common::proto::sharding_rules_service_server::ShardingRulesService;
use spqr_common::{Result, SpqrError};
use spqr_qrouter::{KeyRange, RoutingMap, Shard, ShardingRule};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::info;

#[derive(Clone)]
pub struct SpqrCoordinator {
    map: Arc<RoutingMap>,
    registry: Arc<OperationRegistry>,
    /// Set by key-range mutations, cleared by ReloadRequired
    reload_required: Arc<AtomicBool>,
}

impl SpqrCoordinator {
    pub fn new(map: Arc<RoutingMap>, registry: Arc<OperationRegistry>) -> Self {
        Self {
            map,
            registry,
            reload_required: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run `mutation` under a fresh operation record; a repeated token
    /// returns the earlier operation untouched.
    async fn run_operation<F>(
        &self,
        kind: &str,
        token: &str,
        mutation: F,
    ) -> std::result::Result<Response<proto::OperationReply>, Status>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        let op = match self.registry.begin(kind, token).await? {
            BeginOutcome::Existing(op) => {
                return Ok(Response::new(proto::OperationReply {
                    operation_id: op.id,
                }))
            }
            BeginOutcome::New(op) => op,
        };

        let outcome = mutation.await;
        self.registry.complete(&op.id, &outcome).await?;

        if outcome.is_ok() {
            self.reload_required.store(true, Ordering::SeqCst);
        }
        info!(
            operation = %op.id,
            kind = %kind,
            ok = outcome.is_ok(),
            "operation finished"
        );

        // The terminal error is visible both inline and on the polled
        // operation record.
        outcome?;
        Ok(Response::new(proto::OperationReply {
            operation_id: op.id,
        }))
    }
}

fn operation_to_proto(op: Operation) -> proto::Operation {
    proto::Operation {
        operation_id: op.id,
        status: match op.status {
            OperationStatus::Pending => proto::OperationStatus::Pending as i32,
            OperationStatus::Done => proto::OperationStatus::Done as i32,
            OperationStatus::Failed => proto::OperationStatus::Failed as i32,
        },
        kind: op.kind,
        error: op.error.unwrap_or_default(),
    }
}

#[tonic::async_trait]
impl KeyRangeService for SpqrCoordinator {
    async fn list_key_ranges(
        &self,
        _request: Request<proto::ListKeyRangeRequest>,
    ) -> std::result::Result<Response<proto::KeyRangeReply>, Status> {
        let snapshot = self.map.snapshot();
        Ok(Response::new(proto::KeyRangeReply {
            key_ranges: snapshot
                .ranges
                .iter()
                .map(|r| proto::KeyRange {
                    krid: r.id.clone(),
                    shard_id: r.shard_id.clone(),
                    lower_bound: r.lower.clone(),
                    upper_bound: r.upper.clone(),
                    locked: r.locked,
                })
                .collect(),
        }))
    }

    async fn add_key_range(
        &self,
        request: Request<proto::AddKeyRangeRequest>,
    ) -> std::result::Result<Response<proto::OperationReply>, Status> {
        let req = request.into_inner();
        let range = req
            .key_range
            .ok_or_else(|| Status::invalid_argument("key_range is required"))?;
        let range = KeyRange::new(
            range.krid,
            range.shard_id,
            range.lower_bound,
            range.upper_bound,
        )?;
        self.run_operation("add-key-range", &req.idempotency_token, async {
            self.map.add_key_range(range).await
        })
        .await
    }

    async fn lock_key_range(
        &self,
        request: Request<proto::LockKeyRangeRequest>,
    ) -> std::result::Result<Response<proto::OperationReply>, Status> {
        let req = request.into_inner();
        self.run_operation("lock", &req.idempotency_token, async {
            self.map.lock(&req.krid).await.map(|_| ())
        })
        .await
    }

    async fn unlock_key_range(
        &self,
        request: Request<proto::UnlockKeyRangeRequest>,
    ) -> std::result::Result<Response<proto::OperationReply>, Status> {
        let req = request.into_inner();
        self.run_operation("unlock", &req.idempotency_token, async {
            self.map.unlock(&req.krid).await
        })
        .await
    }

    async fn split_key_range(
        &self,
        request: Request<proto::SplitKeyRangeRequest>,
    ) -> std::result::Result<Response<proto::OperationReply>, Status> {
        let req = request.into_inner();
        self.run_operation("split", &req.idempotency_token, async {
            self.map.split(&req.krid, &req.bound).await.map(|_| ())
        })
        .await
    }

    async fn merge_key_range(
        &self,
        request: Request<proto::MergeKeyRangeRequest>,
    ) -> std::result::Result<Response<proto::OperationReply>, Status> {
        let req = request.into_inner();
        self.run_operation("merge", &req.idempotency_token, async {
            self.map.merge(&req.bound).await.map(|_| ())
        })
        .await
    }

    async fn move_key_range(
        &self,
        request: Request<proto::MoveKeyRangeRequest>,
    ) -> std::result::Result<Response<proto::OperationReply>, Status> {
        let req = request.into_inner();
        self.run_operation("move", &req.idempotency_token, async {
            self.map
                .move_key_range(&req.krid, &req.to_shard_id)
                .await
                .map(|_| ())
        })
        .await
    }
}

#[tonic::async_trait]
impl ShardService for SpqrCoordinator {
    async fn list_shards(
        &self,
        _request: Request<proto::ListShardsRequest>,
    ) -> std::result::Result<Response<proto::ListShardsReply>, Status> {
        let snapshot = self.map.snapshot();
        Ok(Response::new(proto::ListShardsReply {
            shards: snapshot
                .shards
                .iter()
                .map(|s| proto::ShardInfo {
                    id: s.id.clone(),
                    hosts: s.hosts.clone(),
                    world: s.world,
                })
                .collect(),
        }))
    }

    async fn get_shard_info(
        &self,
        request: Request<proto::GetShardInfoRequest>,
    ) -> std::result::Result<Response<proto::GetShardInfoReply>, Status> {
        let id = request.into_inner().id;
        let snapshot = self.map.snapshot();
        let shard = snapshot
            .shards
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Status::not_found(format!("shard {} not found", id)))?;
        Ok(Response::new(proto::GetShardInfoReply {
            shard_info: Some(proto::ShardInfo {
                id: shard.id.clone(),
                hosts: shard.hosts.clone(),
                world: shard.world,
            }),
        }))
    }

    async fn add_shard(
        &self,
        request: Request<proto::AddShardRequest>,
    ) -> std::result::Result<Response<proto::OperationReply>, Status> {
        let req = request.into_inner();
        let info = req
            .shard_info
            .ok_or_else(|| Status::invalid_argument("shard_info is required"))?;
        self.run_operation("add-shard", &req.idempotency_token, async {
            self.map
                .add_shard(Shard {
                    id: info.id,
                    hosts: info.hosts,
                    world: info.world,
                })
                .await
        })
        .await
    }
}

#[tonic::async_trait]
impl ShardingRulesService for SpqrCoordinator {
    async fn add_sharding_rules(
        &self,
        request: Request<proto::AddShardingRuleRequest>,
    ) -> std::result::Result<Response<proto::AddShardingRuleReply>, Status> {
        for rule in request.into_inner().rules {
            self.map
                .add_sharding_rule(ShardingRule::new(rule.columns))
                .await
                .map_err(Status::from)?;
        }
        Ok(Response::new(proto::AddShardingRuleReply {}))
    }

    async fn list_sharding_rules(
        &self,
        _request: Request<proto::ListShardingRuleRequest>,
    ) -> std::result::Result<Response<proto::ListShardingRuleReply>, Status> {
        let snapshot = self.map.snapshot();
        Ok(Response::new(proto::ListShardingRuleReply {
            rules: snapshot
                .rules
                .iter()
                .map(|r| proto::ShardingRule {
                    columns: r.columns.clone(),
                })
                .collect(),
        }))
    }
}

#[tonic::async_trait]
impl OperationService for SpqrCoordinator {
    async fn get_operation(
        &self,
        request: Request<proto::GetOperationRequest>,
    ) -> std::result::Result<Response<proto::GetOperationReply>, Status> {
        let id = request.into_inner().operation_id;
        let op = self
            .registry
            .get(&id)
            .ok_or_else(|| Status::not_found(format!("operation {} not found", id)))?;
        Ok(Response::new(proto::GetOperationReply {
            operation: Some(operation_to_proto(op)),
        }))
    }
}

#[tonic::async_trait]
impl BalancerService for SpqrCoordinator {
    async fn reload_required(
        &self,
        _request: Request<proto::ReloadRequest>,
    ) -> std::result::Result<Response<proto::ReloadReply>, Status> {
        let required = self.reload_required.swap(false, Ordering::SeqCst);
        Ok(Response::new(proto::ReloadReply {
            reload_required: required,
        }))
    }
}
