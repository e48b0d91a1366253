use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lease_lock::{
    is_acquire_conflict, FailureKind, LeaseEvent, LeaseRecord, LeaseStore, LifecycleState,
    LockHandle, LockOptions, MemoryStore, StoreError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const TABLE: &str = "locks";

/// 可注入故障的存储，包装 MemoryStore
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_create: AtomicBool,
    fail_update: AtomicBool,
    fail_delete: AtomicBool,
}

fn outage() -> StoreError {
    StoreError::transient(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "simulated outage",
    ))
}

#[async_trait]
impl LeaseStore for FlakyStore {
    async fn create(
        &self,
        table: &str,
        record: &LeaseRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.create(table, record, now).await
    }

    async fn update(&self, table: &str, record: &LeaseRecord) -> Result<(), StoreError> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.update(table, record).await
    }

    async fn delete(&self, table: &str, key: &str, owner_token: &str) -> Result<(), StoreError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.delete(table, key, owner_token).await
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<LeaseRecord>, StoreError> {
        self.inner.get(table, key).await
    }
}

fn options(ttl: Duration) -> LockOptions {
    LockOptions::default().with_ttl(ttl)
}

fn memory_handle(store: &Arc<MemoryStore>, name: &str, ttl: Duration) -> LockHandle {
    LockHandle::new(name, store.clone() as Arc<dyn LeaseStore>, options(ttl)).unwrap()
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<LeaseEvent>, matches: F) -> LeaseEvent
where
    F: Fn(&LeaseEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for lease event")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_have_exactly_one_winner() {
    let store = Arc::new(MemoryStore::new());
    let mut tasks = JoinSet::new();

    for _ in 0..16 {
        let lock = memory_handle(&store, "shared", Duration::from_secs(10));
        tasks.spawn(async move {
            let result = lock.acquire().await;
            (lock, result)
        });
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    while let Some(joined) = tasks.join_next().await {
        let (lock, result) = joined.unwrap();
        match result {
            Ok(()) => winners.push(lock),
            Err(e) => {
                assert!(is_acquire_conflict(&e), "unexpected error: {}", e);
                assert_eq!(lock.state(), LifecycleState::Idle);
                conflicts += 1;
            }
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 15);

    let winner = winners.pop().unwrap();
    let record = store.get(TABLE, "lease-shared").await.unwrap().unwrap();
    assert_eq!(Some(record.owner_token), winner.owner_token().await);
    winner.release().await.unwrap();
}

#[tokio::test]
async fn abandoned_lease_is_claimable_after_expiry() {
    let store = Arc::new(MemoryStore::new());
    // 持有者崩溃：记录还在，但没有人续约
    let abandoned_until = Utc::now() + ChronoDuration::milliseconds(300);
    store.insert(
        TABLE,
        LeaseRecord::new("lease-crashy", "crashed-owner", abandoned_until),
    );

    let lock = memory_handle(&store, "crashy", Duration::from_secs(10));
    let err = lock.acquire().await.unwrap_err();
    assert!(is_acquire_conflict(&err));

    let remaining = (abandoned_until - Utc::now()).to_std().unwrap_or_default();
    tokio::time::sleep(remaining + Duration::from_millis(20)).await;

    // 冲突后句柄仍是 Idle，可以直接重试
    lock.acquire().await.unwrap();
    let record = store.get(TABLE, "lease-crashy").await.unwrap().unwrap();
    assert_ne!(record.owner_token, "crashed-owner");
    lock.release().await.unwrap();
}

#[tokio::test]
async fn release_is_idempotent_even_after_takeover() {
    let store = Arc::new(MemoryStore::new());
    let lock = memory_handle(&store, "job", Duration::from_secs(10));
    lock.acquire().await.unwrap();

    // 运维手动把锁交给了别人
    let other = LeaseRecord::new(
        "lease-job",
        "someone-else",
        Utc::now() + ChronoDuration::seconds(30),
    );
    store.insert(TABLE, other.clone());

    for _ in 0..3 {
        lock.release().await.unwrap();
    }
    assert_eq!(lock.state(), LifecycleState::Released);
    // 不能删除别人的记录
    assert_eq!(store.get(TABLE, "lease-job").await.unwrap(), Some(other));
}

#[tokio::test]
async fn concurrent_releases_all_succeed() {
    let store = Arc::new(MemoryStore::new());
    let lock = Arc::new(memory_handle(&store, "job", Duration::from_secs(10)));
    lock.acquire().await.unwrap();

    let mut tasks = JoinSet::new();
    for _ in 0..4 {
        let lock = lock.clone();
        let mut events = lock.subscribe();
        tasks.spawn(async move {
            lock.release().await?;
            // 每个调用方返回时续约任务都已退出，Released 事件已经发出
            let mut released = false;
            while let Ok(event) = events.try_recv() {
                released |= event == LeaseEvent::Released;
            }
            assert!(released, "release returned before the renewal task exited");
            Ok::<_, lease_lock::LockError>(())
        });
    }
    lock.cancellation_token().cancel();

    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }
    assert!(store.is_empty());
    assert!(lock.owner_token().await.is_none());
}

#[tokio::test]
async fn renewals_strictly_extend_the_lease() {
    let store = Arc::new(MemoryStore::new());
    let lock = memory_handle(&store, "job", Duration::from_millis(100));
    let mut events = lock.subscribe();
    lock.acquire().await.unwrap();

    let mut previous = lock.expires_at().await.unwrap();
    for _ in 0..4 {
        let event = wait_for(&mut events, |e| matches!(e, LeaseEvent::Renewed { .. })).await;
        let LeaseEvent::Renewed { expires_at } = event else {
            unreachable!()
        };
        assert!(expires_at > previous);
        previous = expires_at;
    }

    let record = store.get(TABLE, "lease-job").await.unwrap().unwrap();
    assert!(record.expires_at >= previous);
    lock.release().await.unwrap();
}

#[tokio::test]
async fn cancellation_releases_the_lease() {
    let store = Arc::new(MemoryStore::new());
    let parent = CancellationToken::new();
    let ttl = Duration::from_millis(200);
    let lock = LockHandle::new(
        "job",
        store.clone() as Arc<dyn LeaseStore>,
        options(ttl).with_parent(parent.clone()),
    )
    .unwrap();
    let mut events = lock.subscribe();
    lock.acquire().await.unwrap();

    parent.cancel();
    wait_for(&mut events, |e| *e == LeaseEvent::Released).await;

    assert!(store.get(TABLE, "lease-job").await.unwrap().is_none());
    assert_eq!(lock.state(), LifecycleState::Released);
    // 之后的显式释放是空操作
    lock.release().await.unwrap();
}

#[tokio::test]
async fn dropping_a_held_handle_releases_it() {
    let store = Arc::new(MemoryStore::new());
    let lock = memory_handle(&store, "job", Duration::from_secs(10));
    let mut events = lock.subscribe();
    lock.acquire().await.unwrap();

    drop(lock);
    wait_for(&mut events, |e| *e == LeaseEvent::Released).await;
    assert!(store.is_empty());
}

#[tokio::test]
async fn job_seven_changes_hands() {
    let store = Arc::new(MemoryStore::new());
    let ttl = Duration::from_secs(2);
    let a = memory_handle(&store, "job-7", ttl);
    let b = memory_handle(&store, "job-7", ttl);

    a.acquire().await.unwrap();
    let err = b.acquire().await.unwrap_err();
    assert!(is_acquire_conflict(&err));

    a.release().await.unwrap();
    b.acquire().await.unwrap();
    assert!(b.is_held());
    b.release().await.unwrap();
}

#[tokio::test]
async fn lost_ownership_is_reported_not_renewed() {
    let store = Arc::new(MemoryStore::new());
    let lock = memory_handle(&store, "job", Duration::from_millis(200));
    let mut events = lock.subscribe();
    lock.acquire().await.unwrap();

    store.remove(TABLE, "lease-job");
    wait_for(&mut events, |e| *e == LeaseEvent::OwnershipLost).await;

    assert_eq!(lock.state(), LifecycleState::Released);
    assert!(lock.owner_token().await.is_none());
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(store.is_empty());
    lock.release().await.unwrap();
}

#[tokio::test]
async fn transient_renewal_failures_are_tolerated() {
    let store = Arc::new(FlakyStore::default());
    let lock = LockHandle::new(
        "job",
        store.clone() as Arc<dyn LeaseStore>,
        options(Duration::from_secs(1)),
    )
    .unwrap();
    let mut events = lock.subscribe();
    lock.acquire().await.unwrap();

    store.fail_update.store(true, Ordering::SeqCst);
    let failed = wait_for(&mut events, |e| matches!(e, LeaseEvent::RenewalFailed { .. })).await;
    assert!(matches!(failed, LeaseEvent::RenewalFailed { consecutive: 1, .. }));
    assert!(lock.is_held());

    store.fail_update.store(false, Ordering::SeqCst);
    wait_for(&mut events, |e| matches!(e, LeaseEvent::Renewed { .. })).await;
    assert!(lock.is_held());
    lock.release().await.unwrap();
}

#[tokio::test]
async fn failure_limit_declares_the_lease_lost() {
    let store = Arc::new(FlakyStore::default());
    let lock = LockHandle::new(
        "job",
        store.clone() as Arc<dyn LeaseStore>,
        options(Duration::from_secs(2)).with_max_renewal_failures(2),
    )
    .unwrap();
    let mut events = lock.subscribe();
    lock.acquire().await.unwrap();
    store.fail_update.store(true, Ordering::SeqCst);

    let event = wait_for(&mut events, |e| matches!(e, LeaseEvent::Expired { .. })).await;
    assert_eq!(event, LeaseEvent::Expired { consecutive: 2 });
    assert_eq!(lock.state(), LifecycleState::Released);
    lock.release().await.unwrap();
}

#[tokio::test]
async fn renewal_gives_up_once_the_lease_has_expired() {
    let store = Arc::new(FlakyStore::default());
    let lock = LockHandle::new(
        "job",
        store.clone() as Arc<dyn LeaseStore>,
        options(Duration::from_millis(100)),
    )
    .unwrap();
    let mut events = lock.subscribe();
    lock.acquire().await.unwrap();
    store.fail_update.store(true, Ordering::SeqCst);

    wait_for(&mut events, |e| matches!(e, LeaseEvent::Expired { .. })).await;
    assert_eq!(lock.state(), LifecycleState::Released);
    assert!(lock.owner_token().await.is_none());
}

#[tokio::test]
async fn failed_release_keeps_ownership_for_retry() {
    let store = Arc::new(FlakyStore::default());
    let lock = LockHandle::new(
        "job",
        store.clone() as Arc<dyn LeaseStore>,
        options(Duration::from_secs(10)),
    )
    .unwrap();
    lock.acquire().await.unwrap();

    store.fail_delete.store(true, Ordering::SeqCst);
    let err = lock.release().await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Transient);
    assert!(!is_acquire_conflict(&err));
    assert!(lock.owner_token().await.is_some());
    assert!(store.get(TABLE, "lease-job").await.unwrap().is_some());

    store.fail_delete.store(false, Ordering::SeqCst);
    lock.release().await.unwrap();
    assert!(lock.owner_token().await.is_none());
    assert!(store.get(TABLE, "lease-job").await.unwrap().is_none());
}

#[tokio::test]
async fn oversized_ttl_is_rejected_before_acquire() {
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryStore::new());
    let err = LockHandle::new(
        "job",
        store,
        options(Duration::from_secs(300_000 * 365 * 24 * 3600)),
    )
    .err()
    .expect("ttl beyond the representable expiry must be rejected");
    assert_eq!(err.kind(), FailureKind::Configuration);
}

#[tokio::test]
async fn store_outage_on_acquire_is_not_a_conflict() {
    let store = Arc::new(FlakyStore::default());
    let lock = LockHandle::new(
        "job",
        store.clone() as Arc<dyn LeaseStore>,
        options(Duration::from_secs(10)),
    )
    .unwrap();

    store.fail_create.store(true, Ordering::SeqCst);
    let err = lock.acquire().await.unwrap_err();
    assert!(!is_acquire_conflict(&err));
    assert_eq!(err.kind(), FailureKind::Transient);
    assert_eq!(lock.state(), LifecycleState::Idle);

    store.fail_create.store(false, Ordering::SeqCst);
    lock.acquire().await.unwrap();
    lock.release().await.unwrap();
}
