//! Router-local gRPC surface over the routing map
//!
//! Mirrors the coordinator's mutation set so an operator or the
//! coordinator itself can adjust this router instance directly. All
//! operations complete inline; the operation id in replies stays empty.

use crate::route_pool::RoutePool;
use spqr_common::proto;
use spqr_common::proto::key_range_service_server::{KeyRangeService, KeyRangeServiceServer};
use spqr_common::proto::shard_service_server::{ShardService, ShardServiceServer};
use spqr_common::proto::sharding_rules_service_server::{
    ShardingRulesService, ShardingRulesServiceServer,
};
use spqr_common::SpqrError;
use spqr_qrouter::{KeyRange, RoutingMap, Shard, ShardingRule};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::info;

/// Drain deadline applied before a move rewrites ownership
const MOVE_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct LocalQrouterServer {
    map: Arc<RoutingMap>,
    pool: Arc<RoutePool>,
}

impl LocalQrouterServer {
    pub fn new(map: Arc<RoutingMap>, pool: Arc<RoutePool>) -> Self {
        Self { map, pool }
    }

    /// Serve the router-local gRPC services until the process exits.
    pub async fn serve(self, addr: SocketAddr) -> Result<(), tonic::transport::Error> {
        info!("router gRPC listening on {}", addr);
        tonic::transport::Server::builder()
            .add_service(KeyRangeServiceServer::new(self.clone()))
            .add_service(ShardingRulesServiceServer::new(self.clone()))
            .add_service(ShardServiceServer::new(self))
            .serve(addr)
            .await
    }
}

fn key_range_to_proto(range: &KeyRange) -> proto::KeyRange {
    proto::KeyRange {
        krid: range.id.clone(),
        shard_id: range.shard_id.clone(),
        lower_bound: range.lower.clone(),
        upper_bound: range.upper.clone(),
        locked: range.locked,
    }
}

fn key_range_from_proto(range: proto::KeyRange) -> Result<KeyRange, SpqrError> {
    KeyRange::new(
        range.krid,
        range.shard_id,
        range.lower_bound,
        range.upper_bound,
    )
}

fn inline_reply() -> Response<proto::OperationReply> {
    Response::new(proto::OperationReply {
        operation_id: String::new(),
    })
}

#[tonic::async_trait]
impl KeyRangeService for LocalQrouterServer {
    async fn list_key_ranges(
        &self,
        _request: Request<proto::ListKeyRangeRequest>,
    ) -> Result<Response<proto::KeyRangeReply>, Status> {
        let snapshot = self.map.snapshot();
        Ok(Response::new(proto::KeyRangeReply {
            key_ranges: snapshot.ranges.iter().map(key_range_to_proto).collect(),
        }))
    }

    async fn add_key_range(
        &self,
        request: Request<proto::AddKeyRangeRequest>,
    ) -> Result<Response<proto::OperationReply>, Status> {
        let range = request
            .into_inner()
            .key_range
            .ok_or_else(|| Status::invalid_argument("key_range is required"))?;
        let range = key_range_from_proto(range)?;
        self.map.add_key_range(range).await?;
        Ok(inline_reply())
    }

    async fn lock_key_range(
        &self,
        request: Request<proto::LockKeyRangeRequest>,
    ) -> Result<Response<proto::OperationReply>, Status> {
        self.map.lock(&request.into_inner().krid).await?;
        Ok(inline_reply())
    }

    async fn unlock_key_range(
        &self,
        request: Request<proto::UnlockKeyRangeRequest>,
    ) -> Result<Response<proto::OperationReply>, Status> {
        self.map.unlock(&request.into_inner().krid).await?;
        Ok(inline_reply())
    }

    async fn split_key_range(
        &self,
        request: Request<proto::SplitKeyRangeRequest>,
    ) -> Result<Response<proto::OperationReply>, Status> {
        let req = request.into_inner();
        self.map.split(&req.krid, &req.bound).await?;
        Ok(inline_reply())
    }

    async fn merge_key_range(
        &self,
        request: Request<proto::MergeKeyRangeRequest>,
    ) -> Result<Response<proto::OperationReply>, Status> {
        self.map.merge(&request.into_inner().bound).await?;
        Ok(inline_reply())
    }

    async fn move_key_range(
        &self,
        request: Request<proto::MoveKeyRangeRequest>,
    ) -> Result<Response<proto::OperationReply>, Status> {
        let req = request.into_inner();

        // The range must already be locked so no new session can bind to
        // it; in-flight transactions finish during the drain.
        let owner = {
            let snapshot = self.map.snapshot();
            let range = snapshot
                .ranges
                .iter()
                .find(|r| r.id == req.krid)
                .ok_or_else(|| Status::not_found(format!("key range {} not found", req.krid)))?;
            if !range.locked {
                return Err(SpqrError::NotLocked(req.krid).into());
            }
            range.shard_id.clone()
        };

        self.pool
            .drain_shard(&owner, MOVE_DRAIN_DEADLINE)
            .await?;
        self.map.move_key_range(&req.krid, &req.to_shard_id).await?;
        Ok(inline_reply())
    }
}

#[tonic::async_trait]
impl ShardingRulesService for LocalQrouterServer {
    async fn add_sharding_rules(
        &self,
        request: Request<proto::AddShardingRuleRequest>,
    ) -> Result<Response<proto::AddShardingRuleReply>, Status> {
        for rule in request.into_inner().rules {
            self.map
                .add_sharding_rule(ShardingRule::new(rule.columns))
                .await?;
        }
        Ok(Response::new(proto::AddShardingRuleReply {}))
    }

    async fn list_sharding_rules(
        &self,
        _request: Request<proto::ListShardingRuleRequest>,
    ) -> Result<Response<proto::ListShardingRuleReply>, Status> {
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
impl ShardService for LocalQrouterServer {
    async fn list_shards(
        &self,
        _request: Request<proto::ListShardsRequest>,
    ) -> Result<Response<proto::ListShardsReply>, Status> {
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
    ) -> Result<Response<proto::GetShardInfoReply>, Status> {
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
    ) -> Result<Response<proto::OperationReply>, Status> {
        let info = request
            .into_inner()
            .shard_info
            .ok_or_else(|| Status::invalid_argument("shard_info is required"))?;
        self.map
            .add_shard(Shard {
                id: info.id,
                hosts: info.hosts,
                world: info.world,
            })
            .await?;
        Ok(inline_reply())
    }
}
