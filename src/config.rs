use crate::error::LockError;
use serde::Deserialize;
use std::env;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TABLE_NAME: &str = "locks";
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// 锁句柄的构造参数
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// 存储中的表名（Redis 中作为 key 前缀）
    pub table: String,
    /// 租约时长，不能为 0
    pub ttl: Duration,
    /// 连续续约失败达到该次数即视为丢锁；None 表示只要租约未过期就一直重试
    pub max_renewal_failures: Option<u32>,
    /// 上层取消信号，触发后自动释放锁
    pub parent: Option<CancellationToken>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE_NAME.to_string(),
            ttl: DEFAULT_TTL,
            max_renewal_failures: None,
            parent: None,
        }
    }
}

impl LockOptions {
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_renewal_failures(mut self, limit: u32) -> Self {
        self.max_renewal_failures = Some(limit);
        self
    }

    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn validate(&self) -> Result<(), LockError> {
        if self.ttl.is_zero() {
            return Err(LockError::Config("ttl can not be zero".to_string()));
        }
        // 过期时间必须能用 DateTime 表示
        let fits = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| chrono::Utc::now().checked_add_signed(ttl))
            .is_some();
        if !fits {
            return Err(LockError::Config(format!("ttl {:?} is out of range", self.ttl)));
        }
        if self.table.trim().is_empty() {
            return Err(LockError::Config("table name can not be empty".to_string()));
        }
        if self.max_renewal_failures == Some(0) {
            return Err(LockError::Config(
                "max_renewal_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Memory,
    Redis,
}

/// 演示程序的配置，从环境变量读取
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage_type: StorageType,
    pub redis_url: Option<String>,
    pub redis_username: Option<String>,
    pub redis_password: Option<String>,
    pub redis_db: Option<i64>,
    pub lock_name: String,
    pub lock_table: String,
    pub lock_ttl_secs: u64,
    pub hold_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let storage_type = env::var("STORAGE_TYPE")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase();

        let storage_type = match storage_type.as_str() {
            "redis" => StorageType::Redis,
            _ => StorageType::Memory,
        };

        let redis_url = if storage_type == StorageType::Redis {
            Some(
                env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            )
        } else {
            None
        };

        let redis_username = env::var("REDIS_USERNAME").ok();
        let redis_password = env::var("REDIS_PASSWORD").ok();
        let redis_db = env::var("REDIS_DB")
            .ok()
            .and_then(|s| s.parse::<i64>().ok());

        let lock_name = env::var("LOCK_NAME").unwrap_or_else(|_| "foo".to_string());
        let lock_table =
            env::var("LOCK_TABLE").unwrap_or_else(|_| DEFAULT_TABLE_NAME.to_string());

        // 0 原样保留，由 LockOptions::validate 拒绝
        let lock_ttl_secs = env::var("LOCK_TTL_SECS")
            .unwrap_or_else(|_| DEFAULT_TTL.as_secs().to_string())
            .parse()
            .unwrap_or(DEFAULT_TTL.as_secs());

        let hold_secs = env::var("LOCK_HOLD_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        Self {
            storage_type,
            redis_url,
            redis_username,
            redis_password,
            redis_db,
            lock_name,
            lock_table,
            lock_ttl_secs,
            hold_secs,
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions::default()
            .with_table(self.lock_table.clone())
            .with_ttl(Duration::from_secs(self.lock_ttl_secs))
    }
}
