use crate::error::StoreError;
use crate::models::LeaseRecord;
use crate::storage::LeaseStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// 进程内存储，按 key 加锁保证条件写的原子性
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, LeaseRecord>, // table:key -> LeaseRecord
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    fn full_key(table: &str, key: &str) -> String {
        format!("{}:{}", table, key)
    }

    /// 无条件删除，模拟运维手动清理
    pub fn remove(&self, table: &str, key: &str) -> Option<LeaseRecord> {
        self.records
            .remove(&Self::full_key(table, key))
            .map(|(_, record)| record)
    }

    /// 无条件覆盖写入
    pub fn insert(&self, table: &str, record: LeaseRecord) {
        self.records
            .insert(Self::full_key(table, &record.key), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn create(
        &self,
        table: &str,
        record: &LeaseRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self.records.entry(Self::full_key(table, &record.key)) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_live(now) {
                    return Err(StoreError::Conflict);
                }
                log::info!(
                    "[EXPIRED] Overwriting stale lease - key: {}, previous_owner: {}, expired_at: {}",
                    record.key,
                    existing.get().owner_token,
                    existing.get().expires_at
                );
                existing.insert(record.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }
        Ok(())
    }

    async fn update(&self, table: &str, record: &LeaseRecord) -> Result<(), StoreError> {
        match self.records.get_mut(&Self::full_key(table, &record.key)) {
            Some(mut existing) if existing.owner_token == record.owner_token => {
                existing.expires_at = record.expires_at;
                Ok(())
            }
            _ => Err(StoreError::Conflict),
        }
    }

    async fn delete(&self, table: &str, key: &str, owner_token: &str) -> Result<(), StoreError> {
        let removed = self
            .records
            .remove_if(&Self::full_key(table, key), |_, existing| {
                existing.owner_token == owner_token
            });
        match removed {
            Some(_) => Ok(()),
            None => Err(StoreError::Conflict),
        }
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<LeaseRecord>, StoreError> {
        Ok(self
            .records
            .get(&Self::full_key(table, key))
            .map(|entry| entry.value().clone()))
    }
}
