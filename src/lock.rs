use crate::config::LockOptions;
use crate::error::{LockError, StoreError};
use crate::models::{self, LeaseEvent, LeaseRecord, LifecycleState};
use crate::renewal;
use crate::storage::LeaseStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 64;

/// 分布式锁句柄。
///
/// 每次 `acquire` 成功都会生成新的 owner token 并启动续约任务；`release`
/// 可重复调用。句柄被 drop 时会触发取消，续约任务随后在后台释放锁。
/// 一个句柄只能获取一次，释放后需要重新构造。
pub struct LockHandle {
    inner: Arc<LockInner>,
}

/// 受互斥保护的租约状态，所有写存储的操作都在该锁内完成
#[derive(Default)]
struct Lease {
    owner_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

pub(crate) struct LockInner {
    name: String,
    storage_key: String,
    table: String,
    ttl: Duration,
    lease_ttl: chrono::Duration,
    max_renewal_failures: Option<u32>,
    store: Arc<dyn LeaseStore>,
    cancel: CancellationToken,
    lease: tokio::sync::Mutex<Lease>,
    state: parking_lot::Mutex<LifecycleState>,
    events: broadcast::Sender<LeaseEvent>,
    /// 续约任务退出时触发
    renewal_done: parking_lot::Mutex<Option<CancellationToken>>,
}

impl LockHandle {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn LeaseStore>,
        options: LockOptions,
    ) -> Result<Self, LockError> {
        let name = name.into();
        if name.is_empty() {
            return Err(LockError::Config("lock name can not be empty".to_string()));
        }
        options.validate()?;
        let lease_ttl = chrono::Duration::from_std(options.ttl)
            .map_err(|e| LockError::Config(format!("invalid ttl: {}", e)))?;

        let cancel = match &options.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(LockInner {
                storage_key: models::storage_key(&name),
                name,
                table: options.table,
                ttl: options.ttl,
                lease_ttl,
                max_renewal_failures: options.max_renewal_failures,
                store,
                cancel,
                lease: tokio::sync::Mutex::new(Lease::default()),
                state: parking_lot::Mutex::new(LifecycleState::Idle),
                events,
                renewal_done: parking_lot::Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn storage_key(&self) -> &str {
        &self.inner.storage_key
    }

    pub fn table(&self) -> &str {
        &self.inner.table
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    pub fn is_held(&self) -> bool {
        self.state() == LifecycleState::Held
    }

    pub async fn owner_token(&self) -> Option<String> {
        self.inner.lease.lock().await.owner_token.clone()
    }

    /// 最近一次写入成功的过期时间
    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.inner.confirmed_expiry().await
    }

    /// 取消该 token 等同于请求自动释放
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// 订阅续约事件；丢锁只能通过这里或 `state()` 观察到
    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.inner.events.subscribe()
    }

    /// 尝试获取锁，只做一次条件写，不自动重试。
    ///
    /// 锁被他人持有时返回 `LockError::Conflict`，其他存储错误原样返回。
    pub async fn acquire(&self) -> Result<(), LockError> {
        let inner = &self.inner;
        let mut lease = inner.lease.lock().await;

        let state = inner.state();
        if state != LifecycleState::Idle {
            return Err(LockError::InvalidState {
                name: inner.name.clone(),
                state,
            });
        }
        if inner.cancel.is_cancelled() {
            return Err(LockError::Cancelled {
                name: inner.name.clone(),
            });
        }

        let token = models::new_owner_token();
        let now = Utc::now();
        let expires_at = models::expiry_after(now, inner.lease_ttl).ok_or_else(|| {
            LockError::Config(format!("ttl {:?} overflows the lease expiry", inner.ttl))
        })?;
        let record = LeaseRecord::new(&inner.storage_key, &token, expires_at);

        match inner.store.create(&inner.table, &record, now).await {
            Ok(()) => {}
            Err(StoreError::Conflict) => {
                log::info!(
                    "[ACQUIRE FAILED] Lock already held - name: {}, key: {}",
                    inner.name,
                    inner.storage_key
                );
                return Err(LockError::Conflict {
                    name: inner.name.clone(),
                });
            }
            Err(e) => {
                log::error!("[ACQUIRE] Failed to acquire lock {}: {}", inner.name, e);
                return Err(e.into());
            }
        }

        log::info!(
            "[ACQUIRE SUCCESS] Lock acquired - name: {}, owner: {}, expires_at: {}",
            inner.name,
            token,
            record.expires_at
        );
        lease.owner_token = Some(token);
        lease.expires_at = Some(record.expires_at);
        inner.set_state(LifecycleState::Held);

        // 持有 lease 锁时登记，之后的 release 一定能看到完成信号
        let done = CancellationToken::new();
        *inner.renewal_done.lock() = Some(done.clone());
        renewal::spawn(self.inner.clone(), done);
        drop(lease);
        Ok(())
    }

    /// 释放锁，可重复调用。
    ///
    /// 记录已不存在或已被他人占用同样视为成功；网络或配置错误会返回，
    /// 此时保留 owner token，可以重试。返回时续约任务已经退出（并发调用同样如此）。
    pub async fn release(&self) -> Result<(), LockError> {
        let result = self.inner.release().await;

        let done = self.inner.renewal_done.lock().clone();
        if let Some(done) = done {
            done.cancelled().await;
        }
        result
    }

    pub async fn unlock(&self) -> Result<(), LockError> {
        self.release().await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl LockInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn ttl(&self) -> Duration {
        self.ttl
    }

    pub(crate) fn max_renewal_failures(&self) -> Option<u32> {
        self.max_renewal_failures
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock() = state;
    }

    pub(crate) fn publish(&self, event: LeaseEvent) {
        // 没有订阅者时直接丢弃
        let _ = self.events.send(event);
    }

    pub(crate) async fn confirmed_expiry(&self) -> Option<DateTime<Utc>> {
        self.lease.lock().await.expires_at
    }

    /// 续约一次；返回 Ok(None) 表示锁已不再持有
    pub(crate) async fn renew(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut lease = self.lease.lock().await;
        let token = match lease.owner_token.clone() {
            Some(token) => token,
            None => return Ok(None),
        };

        let expires_at = models::next_expiry(lease.expires_at, Utc::now(), self.lease_ttl)
            .ok_or_else(|| StoreError::configuration("lease expiry out of range"))?;
        let record = LeaseRecord::new(&self.storage_key, &token, expires_at);
        self.store.update(&self.table, &record).await?;

        lease.expires_at = Some(expires_at);
        Ok(Some(expires_at))
    }

    /// 续约判定丢锁：清除 owner token，不再对记录做任何写操作
    pub(crate) async fn mark_lost(&self) {
        let mut lease = self.lease.lock().await;
        lease.owner_token = None;
        lease.expires_at = None;
        self.set_state(LifecycleState::Released);
        drop(lease);
        self.cancel.cancel();
    }

    pub(crate) async fn release(&self) -> Result<(), LockError> {
        self.cancel.cancel();

        let mut lease = self.lease.lock().await;
        let token = match lease.owner_token.clone() {
            Some(token) => token,
            None => {
                // 已经释放过
                self.set_state(LifecycleState::Released);
                return Ok(());
            }
        };

        match self.store.delete(&self.table, &self.storage_key, &token).await {
            Ok(()) => {
                log::info!("[RELEASE] Releasing lock - name: {}, owner: {}", self.name, token);
            }
            Err(StoreError::Conflict) => {
                log::info!(
                    "[RELEASE] Lock {} already gone or reassigned, owner: {}",
                    self.name,
                    token
                );
            }
            Err(e) => {
                log::error!("[RELEASE] Failed to release lock {}: {}", self.name, e);
                return Err(e.into());
            }
        }

        lease.owner_token = None;
        lease.expires_at = None;
        self.set_state(LifecycleState::Released);
        Ok(())
    }
}
