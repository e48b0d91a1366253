use crate::models::LifecycleState;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 条件写失败：有其他持有者，或记录已不属于自己
    Conflict,
    /// 网络或存储暂时不可用
    Transient,
    /// 参数或后端配置错误，重试无意义
    Configuration,
}

/// 存储适配层的错误，后端错误在这里完成分类
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conditional check failed")]
    Conflict,

    #[error("store unavailable: {0}")]
    Transient(#[source] BoxError),

    #[error("store misconfigured: {0}")]
    Configuration(#[source] BoxError),
}

impl StoreError {
    pub fn transient<E: Into<BoxError>>(err: E) -> Self {
        StoreError::Transient(err.into())
    }

    pub fn configuration<E: Into<BoxError>>(err: E) -> Self {
        StoreError::Configuration(err.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::Conflict => FailureKind::Conflict,
            StoreError::Transient(_) => FailureKind::Transient,
            StoreError::Configuration(_) => FailureKind::Configuration,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict)
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock '{name}' is held by another owner")]
    Conflict { name: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid lock options: {0}")]
    Config(String),

    #[error("lock '{name}' is {state}, cannot acquire")]
    InvalidState { name: String, state: LifecycleState },

    #[error("lock '{name}' was cancelled before acquisition")]
    Cancelled { name: String },
}

impl LockError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LockError::Conflict { .. } => FailureKind::Conflict,
            LockError::Store(e) => e.kind(),
            LockError::Config(_) | LockError::InvalidState { .. } | LockError::Cancelled { .. } => {
                FailureKind::Configuration
            }
        }
    }
}

/// 判断 acquire 失败是否因为锁被他人持有；false 且有错误则是网络或配置问题
pub fn is_acquire_conflict(err: &LockError) -> bool {
    matches!(err, LockError::Conflict { .. })
}
