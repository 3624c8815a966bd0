//! Coordinator gRPC client
//!
//! Wraps the control-plane services and polls every mutation's
//! operation until it reaches a terminal status, with a bounded retry
//! count for transient RPC failures.

use spqr_common::proto;
use spqr_common::proto::balancer_service_client::BalancerServiceClient;
use spqr_common::proto::key_range_service_client::KeyRangeServiceClient;
use spqr_common::proto::operation_service_client::OperationServiceClient;
use spqr_common::proto::shard_service_client::ShardServiceClient;
use spqr_common::{Result, SpqrError};
use std::time::Duration;
use tonic::transport::Channel;
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct CoordinatorClient {
    key_ranges: KeyRangeServiceClient<Channel>,
    shards: ShardServiceClient<Channel>,
    operations: OperationServiceClient<Channel>,
    balancer: BalancerServiceClient<Channel>,
    max_retries: usize,
}

impl CoordinatorClient {
    pub async fn connect(addr: &str, max_retries: usize) -> Result<Self> {
        let channel = Channel::from_shared(addr.to_string())
            .map_err(|e| SpqrError::Internal(format!("bad coordinator address: {}", e)))?
            .connect()
            .await
            .map_err(|e| SpqrError::ShardUnavailable(format!("coordinator {}: {}", addr, e)))?;

        Ok(Self {
            key_ranges: KeyRangeServiceClient::new(channel.clone()),
            shards: ShardServiceClient::new(channel.clone()),
            operations: OperationServiceClient::new(channel.clone()),
            balancer: BalancerServiceClient::new(channel),
            max_retries,
        })
    }

    pub async fn list_shards(&mut self) -> Result<Vec<proto::ShardInfo>> {
        let reply = self
            .shards
            .list_shards(proto::ListShardsRequest {})
            .await
            .map_err(rpc_error)?;
        Ok(reply.into_inner().shards)
    }

    pub async fn list_key_ranges(&mut self) -> Result<Vec<proto::KeyRange>> {
        let reply = self
            .key_ranges
            .list_key_ranges(proto::ListKeyRangeRequest {})
            .await
            .map_err(rpc_error)?;
        Ok(reply.into_inner().key_ranges)
    }

    pub async fn reload_required(&mut self) -> Result<bool> {
        let reply = self
            .balancer
            .reload_required(proto::ReloadRequest {})
            .await
            .map_err(rpc_error)?;
        Ok(reply.into_inner().reload_required)
    }

    pub async fn lock(&mut self, krid: &str) -> Result<()> {
        let reply = self
            .key_ranges
            .lock_key_range(proto::LockKeyRangeRequest {
                krid: krid.to_string(),
                idempotency_token: String::new(),
            })
            .await
            .map_err(rpc_error)?;
        self.wait_til_done(&reply.into_inner().operation_id).await
    }

    pub async fn unlock(&mut self, krid: &str) -> Result<()> {
        let reply = self
            .key_ranges
            .unlock_key_range(proto::UnlockKeyRangeRequest {
                krid: krid.to_string(),
                idempotency_token: String::new(),
            })
            .await
            .map_err(rpc_error)?;
        self.wait_til_done(&reply.into_inner().operation_id).await
    }

    pub async fn split(&mut self, krid: &str, bound: &[u8]) -> Result<()> {
        let reply = self
            .key_ranges
            .split_key_range(proto::SplitKeyRangeRequest {
                krid: krid.to_string(),
                bound: bound.to_vec(),
                idempotency_token: String::new(),
            })
            .await
            .map_err(rpc_error)?;
        self.wait_til_done(&reply.into_inner().operation_id).await
    }

    pub async fn merge(&mut self, bound: &[u8]) -> Result<()> {
        let reply = self
            .key_ranges
            .merge_key_range(proto::MergeKeyRangeRequest {
                bound: bound.to_vec(),
                idempotency_token: String::new(),
            })
            .await
            .map_err(rpc_error)?;
        self.wait_til_done(&reply.into_inner().operation_id).await
    }

    pub async fn move_key_range(&mut self, krid: &str, to_shard: &str) -> Result<()> {
        let reply = self
            .key_ranges
            .move_key_range(proto::MoveKeyRangeRequest {
                krid: krid.to_string(),
                to_shard_id: to_shard.to_string(),
                idempotency_token: String::new(),
            })
            .await
            .map_err(rpc_error)?;
        self.wait_til_done(&reply.into_inner().operation_id).await
    }

    /// Poll an operation until done or failed. Empty ids mean the
    /// mutation completed inline.
    async fn wait_til_done(&mut self, operation_id: &str) -> Result<()> {
        if operation_id.is_empty() {
            return Ok(());
        }

        let mut retries = 0;
        loop {
            match self
                .operations
                .get_operation(proto::GetOperationRequest {
                    operation_id: operation_id.to_string(),
                })
                .await
            {
                Ok(reply) => {
                    let op = reply
                        .into_inner()
                        .operation
                        .ok_or_else(|| SpqrError::Internal("operation reply without record".into()))?;
                    match proto::OperationStatus::try_from(op.status) {
                        Ok(proto::OperationStatus::Done) => return Ok(()),
                        Ok(proto::OperationStatus::Failed) => {
                            return Err(SpqrError::Internal(format!(
                                "operation {} failed: {}",
                                operation_id, op.error
                            )))
                        }
                        _ => tokio::time::sleep(POLL_INTERVAL).await,
                    }
                }
                Err(status) => {
                    retries += 1;
                    warn!(
                        operation = %operation_id,
                        retries,
                        "failed to poll operation: {}",
                        status
                    );
                    if retries >= self.max_retries {
                        return Err(rpc_error(status));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }
}

fn rpc_error(status: tonic::Status) -> SpqrError {
    match status.code() {
        tonic::Code::DeadlineExceeded => SpqrError::Timeout(status.message().to_string()),
        tonic::Code::Unavailable => SpqrError::ShardUnavailable(status.message().to_string()),
        _ => SpqrError::Internal(status.message().to_string()),
    }
}
