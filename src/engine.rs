use crate::types::{ZeroShotRequest, ZeroShotResponse};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Engine {
    async fn classify(&self, request: ZeroShotRequest) -> Result<ZeroShotResponse>;
}

#[async_trait]
pub trait BatchedEngine: Send + Sync {
    async fn classify_batch(
        &self,
        requests: Vec<ZeroShotRequest>,
    ) -> Result<Vec<Result<ZeroShotResponse>>>;
}
