use lease_lock::config::{Config, StorageType};
use lease_lock::{is_acquire_conflict, LeaseStore, LockHandle, MemoryStore, RedisStore};
use log::info;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    // 加载配置
    let config = Config::from_env();
    info!("Starting lease-lock demo with config: {:?}", config);

    // 创建存储
    let store: Arc<dyn LeaseStore> = match config.storage_type {
        StorageType::Memory => {
            info!("Using memory storage");
            Arc::new(MemoryStore::new())
        }
        StorageType::Redis => {
            info!("Using Redis storage");
            let redis_url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Redis URL not configured"))?;
            let redis_store = RedisStore::new(
                redis_url,
                config.redis_username.clone(),
                config.redis_password.clone(),
                config.redis_db,
            )
            .await?;
            Arc::new(redis_store)
        }
    };

    let lock = LockHandle::new(config.lock_name.clone(), store.clone(), config.lock_options())?;

    match lock.acquire().await {
        Ok(()) => {}
        Err(e) if is_acquire_conflict(&e) => {
            anyhow::bail!("someone already has the lock {}", lock.name());
        }
        Err(e) => return Err(e.into()),
    }

    if let Some(record) = store.get(lock.table(), lock.storage_key()).await? {
        info!("Current lease record: {}", serde_json::to_string(&record)?);
    }

    info!("Lock acquired, holding for {} seconds", config.hold_secs);
    tokio::time::sleep(Duration::from_secs(config.hold_secs)).await;

    // 可以重复释放
    for attempt in ["one", "two", "three"] {
        info!("Unlock {}", attempt);
        lock.unlock().await?;
    }

    Ok(())
}
