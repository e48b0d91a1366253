use crate::error::StoreError;
use crate::lock::LockInner;
use crate::models::LeaseEvent;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// 续约间隔为 ttl 的一半，丢一次 tick 仍有机会在过期前续上
pub fn renewal_interval(ttl: Duration) -> Duration {
    (ttl / 2).max(MIN_INTERVAL)
}

/// `done` 在任务退出时被触发（包括 panic）
pub(crate) fn spawn(lock: Arc<LockInner>, done: CancellationToken) {
    tokio::spawn(run(lock, done));
}

async fn run(lock: Arc<LockInner>, done: CancellationToken) {
    let _finished = done.drop_guard();
    let interval = renewal_interval(lock.ttl());
    let cancel = lock.cancellation_token();
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                match lock.release().await {
                    Ok(()) => lock.publish(LeaseEvent::Released),
                    Err(e) => {
                        log::error!("[RENEW] Auto-release of {} failed: {}", lock.name(), e);
                        lock.publish(LeaseEvent::ReleaseFailed { error: e.to_string() });
                    }
                }
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match lock.renew().await {
            Ok(Some(expires_at)) => {
                failures = 0;
                log::debug!("[RENEW] Lease {} extended to {}", lock.name(), expires_at);
                lock.publish(LeaseEvent::Renewed { expires_at });
            }
            // 已被释放，下一轮会看到取消信号
            Ok(None) => {}
            Err(StoreError::Conflict) => {
                log::warn!("[RENEW] Ownership of {} lost, stopping renewal", lock.name());
                lock.mark_lost().await;
                lock.publish(LeaseEvent::OwnershipLost);
                return;
            }
            Err(e) => {
                failures += 1;
                log::warn!(
                    "[RENEW] Failed to renew {} ({} consecutive): {}",
                    lock.name(),
                    failures,
                    e
                );
                lock.publish(LeaseEvent::RenewalFailed {
                    consecutive: failures,
                    error: e.to_string(),
                });

                if should_give_up(&lock, failures).await {
                    log::warn!(
                        "[EXPIRED] Giving up lease {} after {} failed renewals",
                        lock.name(),
                        failures
                    );
                    lock.mark_lost().await;
                    lock.publish(LeaseEvent::Expired {
                        consecutive: failures,
                    });
                    return;
                }
            }
        }
    }
}

/// 达到失败上限，或最后一次确认的过期时间已过（对方可能已视为弃锁）
async fn should_give_up(lock: &LockInner, failures: u32) -> bool {
    if let Some(limit) = lock.max_renewal_failures() {
        if failures >= limit {
            return true;
        }
    }
    match lock.confirmed_expiry().await {
        Some(expires_at) => Utc::now() >= expires_at,
        // 已被释放，交给取消分支处理
        None => false,
    }
}
