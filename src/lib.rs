//! 基于外部存储条件写的分布式互斥锁。
//!
//! 获取锁是一次条件创建；持有期间后台任务每 `ttl / 2` 续约一次；
//! 释放是一次按 owner token 的条件删除，可重复调用。
//!
//! ```no_run
//! use lease_lock::{is_acquire_conflict, LockHandle, LockOptions, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), lease_lock::LockError> {
//! let store = Arc::new(MemoryStore::new());
//! let lock = LockHandle::new("job-7", store, LockOptions::default())?;
//! match lock.acquire().await {
//!     Ok(()) => {}
//!     Err(e) if is_acquire_conflict(&e) => return Ok(()),
//!     Err(e) => return Err(e),
//! }
//! // ...
//! lock.release().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod lock;
pub mod models;
pub mod renewal;
pub mod storage;

pub use config::{LockOptions, DEFAULT_TABLE_NAME, DEFAULT_TTL};
pub use error::{is_acquire_conflict, FailureKind, LockError, StoreError};
pub use lock::LockHandle;
pub use models::{LeaseEvent, LeaseRecord, LifecycleState};
pub use storage::memory::MemoryStore;
pub use storage::redis::RedisStore;
pub use storage::LeaseStore;
