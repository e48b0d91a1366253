use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 资源名的存储前缀
pub const KEY_PREFIX: &str = "lease-";

/// 租约记录，每个 key 在存储中最多一行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub key: String,
    pub owner_token: String,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn new(key: &str, owner_token: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            owner_token: owner_token.to_string(),
            expires_at,
        }
    }

    /// 到达 expires_at 即视为过期
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// 锁句柄的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Held,
    Released,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Held => "held",
            LifecycleState::Released => "released",
        };
        f.write_str(s)
    }
}

/// 续约任务上报的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    Renewed { expires_at: DateTime<Utc> },
    /// 非冲突类失败，仍认为持有租约
    RenewalFailed { consecutive: u32, error: String },
    /// 存储中的记录已不属于本句柄
    OwnershipLost,
    /// 连续失败超过租约期限（或配置的上限）
    Expired { consecutive: u32 },
    /// 取消触发的释放已完成
    Released,
    ReleaseFailed { error: String },
}

pub fn storage_key(name: &str) -> String {
    format!("{}{}", KEY_PREFIX, name)
}

pub fn new_owner_token() -> String {
    Uuid::new_v4().to_string()
}

/// 获取时的过期时间；超出 DateTime 范围返回 None
pub fn expiry_after(now: DateTime<Utc>, ttl: ChronoDuration) -> Option<DateTime<Utc>> {
    now.checked_add_signed(ttl)
}

/// 续约后的过期时间，保证严格递增（存储精度为毫秒）
pub fn next_expiry(
    previous: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    ttl: ChronoDuration,
) -> Option<DateTime<Utc>> {
    let candidate = expiry_after(now, ttl)?;
    match previous {
        Some(prev) if candidate <= prev => prev.checked_add_signed(ChronoDuration::milliseconds(1)),
        _ => Some(candidate),
    }
}
