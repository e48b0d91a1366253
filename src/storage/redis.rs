use crate::error::StoreError;
use crate::models::LeaseRecord;
use crate::storage::LeaseStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, Script};
use std::collections::HashMap;
use std::str::FromStr;

const OWNER_FIELD: &str = "owner";
const EXPIRES_FIELD: &str = "expires_at";

// KEYS[1]=key ARGV: owner, expires_ms, now_ms, retain_ms
const CREATE_SCRIPT: &str = r#"
local expires = redis.call('HGET', KEYS[1], 'expires_at')
if expires and tonumber(expires) > tonumber(ARGV[3]) then
    return 0
end
redis.call('HSET', KEYS[1], 'owner', ARGV[1], 'expires_at', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return 1
"#;

// KEYS[1]=key ARGV: owner, expires_ms, retain_ms
const UPDATE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'owner') ~= ARGV[1] then
    return 0
end
redis.call('HSET', KEYS[1], 'expires_at', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 1
"#;

// KEYS[1]=key ARGV: owner
const DELETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'owner') ~= ARGV[1] then
    return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

/// Redis 存储：每个条件操作是一个 Lua 脚本，在服务端原子执行
pub struct RedisStore {
    client: ConnectionManager,
    create: Script,
    update: Script,
    delete: Script,
}

impl RedisStore {
    pub async fn new(
        redis_url: &str,
        username: Option<String>,
        password: Option<String>,
        db: Option<i64>,
    ) -> Result<Self> {
        // 构建连接信息
        let mut connection_info = redis::ConnectionInfo::from_str(redis_url)?;

        if let Some(pwd) = password {
            connection_info.redis.password = Some(pwd);
        }
        if let Some(user) = username {
            connection_info.redis.username = Some(user);
        }
        if let Some(database) = db {
            connection_info.redis.db = database;
        }

        let client = redis::Client::open(connection_info)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            client: connection,
            create: Script::new(CREATE_SCRIPT),
            update: Script::new(UPDATE_SCRIPT),
            delete: Script::new(DELETE_SCRIPT),
        })
    }

    fn full_key(table: &str, key: &str) -> String {
        format!("{}:{}", table, key)
    }
}

/// 记录在 Redis 中保留到过期后再多一个租期，便于排查，随后由服务端回收
fn retain_millis(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let remaining = (expires_at - now).num_milliseconds().max(1);
    remaining.saturating_mul(2)
}

fn script_outcome(applied: i64) -> Result<(), StoreError> {
    if applied == 1 {
        Ok(())
    } else {
        Err(StoreError::Conflict)
    }
}

/// 把 Redis 错误归入 Transient / Configuration
pub fn classify(err: RedisError) -> StoreError {
    match err.kind() {
        ErrorKind::AuthenticationFailed | ErrorKind::InvalidClientConfig | ErrorKind::TypeError => {
            StoreError::configuration(err)
        }
        // 未知的服务端错误码会被解析成 ExtensionError，只能按 code 判断
        _ if matches!(err.code(), Some("WRONGTYPE" | "NOPERM")) => StoreError::configuration(err),
        _ => StoreError::transient(err),
    }
}

fn parse_record(key: &str, fields: HashMap<String, String>) -> Result<Option<LeaseRecord>, StoreError> {
    if fields.is_empty() {
        return Ok(None);
    }
    let owner = fields
        .get(OWNER_FIELD)
        .ok_or_else(|| StoreError::configuration(format!("record {} has no owner field", key)))?;
    let expires_at = fields
        .get(EXPIRES_FIELD)
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| StoreError::configuration(format!("record {} has a malformed expiry", key)))?;
    Ok(Some(LeaseRecord::new(key, owner, expires_at)))
}

#[async_trait]
impl LeaseStore for RedisStore {
    async fn create(
        &self,
        table: &str,
        record: &LeaseRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.client.clone();
        let applied: i64 = self
            .create
            .key(Self::full_key(table, &record.key))
            .arg(&record.owner_token)
            .arg(record.expires_at.timestamp_millis())
            .arg(now.timestamp_millis())
            .arg(retain_millis(record.expires_at, now))
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        script_outcome(applied)
    }

    async fn update(&self, table: &str, record: &LeaseRecord) -> Result<(), StoreError> {
        let mut conn = self.client.clone();
        let applied: i64 = self
            .update
            .key(Self::full_key(table, &record.key))
            .arg(&record.owner_token)
            .arg(record.expires_at.timestamp_millis())
            .arg(retain_millis(record.expires_at, Utc::now()))
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        script_outcome(applied)
    }

    async fn delete(&self, table: &str, key: &str, owner_token: &str) -> Result<(), StoreError> {
        let mut conn = self.client.clone();
        let applied: i64 = self
            .delete
            .key(Self::full_key(table, key))
            .arg(owner_token)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        script_outcome(applied)
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<LeaseRecord>, StoreError> {
        let mut conn = self.client.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(Self::full_key(table, key))
            .await
            .map_err(classify)?;
        parse_record(key, fields)
    }
}
