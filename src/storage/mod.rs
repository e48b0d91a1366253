pub mod memory;
pub mod redis;

use crate::error::StoreError;
use crate::models::LeaseRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 支持条件写的租约存储；条件不满足时返回 `StoreError::Conflict`
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// 不存在有效记录（不存在或已过期）时写入
    async fn create(
        &self,
        table: &str,
        record: &LeaseRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// 记录的 owner_token 一致时更新过期时间
    async fn update(&self, table: &str, record: &LeaseRecord) -> Result<(), StoreError>;

    /// 记录的 owner_token 一致时删除
    async fn delete(&self, table: &str, key: &str, owner_token: &str) -> Result<(), StoreError>;

    /// 读取记录（可能已过期）
    async fn get(&self, table: &str, key: &str) -> Result<Option<LeaseRecord>, StoreError>;
}
